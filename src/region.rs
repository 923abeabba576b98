//! Mapped byte region and region-relative pointers
//!
//! A [`Region`] is the contiguous byte range an allocator instance manages.
//! Every allocator layer addresses it through [`RPtr`], an offset from the
//! start of the region, so the on-media state stays valid no matter where a
//! process maps the region.
//!
//! Allocator metadata (heap headers, extent headers, slab headers, bitmaps)
//! is read and written through the atomic accessors, so a header scan can run
//! next to a writer without a data race. Payload bytes belong to the caller
//! and are copied with [`Region::read_bytes`] / [`Region::write_bytes`].

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::alloc::{self, Layout};
use std::fmt;
use std::ops::{Add, Sub};
use std::ptr::NonNull;
use std::sync::atomic::{self, AtomicU16, AtomicU32, AtomicU64, AtomicU8, Ordering};

/// Size of a cache line; all on-media structures are padded to it
pub const CACHE_LINE_SIZE: usize = 64;

/// Round `value` up to the next multiple of `align`
pub fn round_up(value: usize, align: usize) -> usize {
    value.div_ceil(align) * align
}

/// Pointer relative to the start of a region
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct RPtr(u64);

impl RPtr {
    /// Create a pointer `offset` bytes into the region
    pub const fn new(offset: u64) -> Self {
        Self(offset)
    }

    /// Offset from the start of the region
    pub const fn offset(self) -> u64 {
        self.0
    }

    fn index(self) -> usize {
        self.0 as usize
    }
}

impl Add<usize> for RPtr {
    type Output = RPtr;

    fn add(self, bytes: usize) -> RPtr {
        RPtr(self.0 + bytes as u64)
    }
}

impl Sub<RPtr> for RPtr {
    type Output = usize;

    /// Distance in bytes between two pointers into the same region
    fn sub(self, other: RPtr) -> usize {
        debug_assert!(self >= other, "{} precedes {}", self, other);
        (self.0 - other.0) as usize
    }
}

impl fmt::Display for RPtr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPtr({:#x})", self.0)
    }
}

macro_rules! atomic_access {
    ($load:ident, $store:ident, $int:ty, $atomic:ty) => {
        pub fn $load(&self, ptr: RPtr) -> $int {
            self.atomic::<$atomic>(ptr).load(Ordering::Acquire)
        }

        pub fn $store(&self, ptr: RPtr, value: $int) {
            self.atomic::<$atomic>(ptr).store(value, Ordering::Release)
        }
    };
}

/// Contiguous, cache-line aligned byte range
pub struct Region {
    base: NonNull<u8>,
    len: usize,
}

// SAFETY: the region owns its allocation, and every shared access goes
// through atomics (metadata) or through byte copies whose exclusivity is
// guaranteed by the allocator handing each payload to a single owner.
unsafe impl Send for Region {}
unsafe impl Sync for Region {}

impl Region {
    /// Map a zero-filled region of `len` bytes
    pub fn new(len: usize) -> Result<Self> {
        if len == 0 {
            return Err(Error::InvalidParameter("region length must be non-zero".to_string()));
        }
        let layout = Layout::from_size_align(len, CACHE_LINE_SIZE)
            .map_err(|e| Error::InvalidParameter(format!("bad region layout: {}", e)))?;
        // SAFETY: layout has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let base = NonNull::new(ptr)
            .ok_or_else(|| Error::OutOfMemory(format!("cannot map a region of {} bytes", len)))?;
        Ok(Self { base, len })
    }

    /// Map a fresh region holding a copy of `bytes`
    ///
    /// The copy lives at a different virtual address than the source, which
    /// is exactly what a process restart looks like to the allocator.
    pub fn from_snapshot(bytes: &[u8]) -> Result<Self> {
        let region = Self::new(bytes.len())?;
        region.write_bytes(RPtr::new(0), bytes)?;
        Ok(region)
    }

    /// Copy out the whole region
    ///
    /// Only meaningful while no allocator call is in flight.
    pub fn snapshot(&self) -> Vec<u8> {
        // SAFETY: base is valid for len bytes for the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.base.as_ptr(), self.len) }.to_vec()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Whether `[ptr, ptr + len)` lies inside the region
    pub fn contains(&self, ptr: RPtr, len: usize) -> bool {
        ptr.index()
            .checked_add(len)
            .map_or(false, |end| end <= self.len)
    }

    /// Virtual address of `ptr` in this process
    ///
    /// Obtaining the address is safe; dereferencing it is up to the caller.
    pub fn addr(&self, ptr: RPtr) -> *mut u8 {
        assert!(self.contains(ptr, 0), "{} is outside the region", ptr);
        // SAFETY: offset is within the allocation (or one past its end).
        unsafe { self.base.as_ptr().add(ptr.index()) }
    }

    /// Copy payload bytes out of the region
    pub fn read_bytes(&self, ptr: RPtr, buf: &mut [u8]) -> Result<()> {
        if !self.contains(ptr, buf.len()) {
            return Err(Error::InvalidAddress(ptr));
        }
        // SAFETY: bounds checked above; buf cannot alias the region allocation.
        unsafe {
            std::ptr::copy_nonoverlapping(self.addr(ptr), buf.as_mut_ptr(), buf.len());
        }
        Ok(())
    }

    /// Copy payload bytes into the region
    pub fn write_bytes(&self, ptr: RPtr, data: &[u8]) -> Result<()> {
        if !self.contains(ptr, data.len()) {
            return Err(Error::InvalidAddress(ptr));
        }
        // SAFETY: bounds checked above; data cannot alias the region allocation.
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), self.addr(ptr), data.len());
        }
        Ok(())
    }

    atomic_access!(load_u8, store_u8, u8, AtomicU8);
    atomic_access!(load_u16, store_u16, u16, AtomicU16);
    atomic_access!(load_u32, store_u32, u32, AtomicU32);
    atomic_access!(load_u64, store_u64, u64, AtomicU64);

    /// Set bits of a metadata byte, returning the previous value
    pub fn fetch_or_u8(&self, ptr: RPtr, bits: u8) -> u8 {
        self.atomic::<AtomicU8>(ptr).fetch_or(bits, Ordering::AcqRel)
    }

    /// Clear bits of a metadata byte, returning the previous value
    pub fn fetch_and_u8(&self, ptr: RPtr, bits: u8) -> u8 {
        self.atomic::<AtomicU8>(ptr).fetch_and(bits, Ordering::AcqRel)
    }

    /// Make `[ptr, ptr + len)` durable before any later store
    ///
    /// The in-memory region orders stores with a full fence; a backing store
    /// on persistent media flushes the covered cache lines at this point.
    pub fn persist(&self, ptr: RPtr, len: usize) {
        debug_assert!(self.contains(ptr, len), "persist of {}+{} outside region", ptr, len);
        atomic::fence(Ordering::SeqCst);
    }

    fn atomic<A>(&self, ptr: RPtr) -> &A {
        let size = std::mem::size_of::<A>();
        assert!(self.contains(ptr, size), "{} is outside the region", ptr);
        assert_eq!(
            ptr.index() % std::mem::align_of::<A>(),
            0,
            "misaligned metadata access at {}",
            ptr
        );
        // SAFETY: in bounds and aligned (the base is cache-line aligned), and
        // atomic integers share the layout of their plain counterparts.
        unsafe { &*(self.base.as_ptr().add(ptr.index()) as *const A) }
    }
}

impl Drop for Region {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this exact layout.
        unsafe {
            alloc::dealloc(
                self.base.as_ptr(),
                Layout::from_size_align_unchecked(self.len, CACHE_LINE_SIZE),
            );
        }
    }
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region").field("len", &self.len).finish_non_exhaustive()
    }
}
