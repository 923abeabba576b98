//! A slab: one extent carved into equal blocks of a single size class
//!
//! # Layout
//!
//! ```text
//! 0   header_size   u32   bytes before block 0, a multiple of a cache line
//! 4   size_class    u16
//! 6   magic         u16
//! 8   nblocks       u32
//! 16  reserved      u64
//! 24  bitmap        one bit per block, set = allocated
//! ... padding to header_size
//! header_size       block 0, block 1, ...
//! ```
//!
//! The bitmap is the only persistent allocation state. The free list is
//! rebuilt from it whenever a slab is loaded.

use super::bitmap::Bitmap;
use super::size_class;
use crate::error::{Error, Result};
use crate::region::{round_up, RPtr, Region, CACHE_LINE_SIZE};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

pub const SLAB_MAGIC: u16 = 0x5342;

/// Number of fullness bins a slab can sit in
pub const SLAB_FULLNESS_BINS: usize = 3;

/// Bytes of the header before the bitmap
pub const SLAB_HEADER_FIXED_SIZE: usize = 24;

pub(crate) const HEADER_SIZE_OFFSET: usize = 0;
const SIZE_CLASS_OFFSET: usize = 4;
const MAGIC_OFFSET: usize = 6;
pub(crate) const NBLOCKS_OFFSET: usize = 8;
const RESERVED_OFFSET: usize = 16;
const BITMAP_OFFSET: usize = SLAB_HEADER_FIXED_SIZE;

/// Header size of a slab with `nblocks` blocks
pub fn header_size(nblocks: usize) -> usize {
    round_up(SLAB_HEADER_FIXED_SIZE + Bitmap::size_of(nblocks), CACHE_LINE_SIZE)
}

/// Most blocks of `block_size` bytes that fit in a slab with their header
pub fn max_nblocks(slab_size: usize, block_size: usize) -> usize {
    let fits = |n: usize| header_size(n) + n * block_size <= slab_size;
    let mut n = slab_size.saturating_sub(SLAB_HEADER_FIXED_SIZE) * 8 / (1 + 8 * block_size);
    while fits(n + 1) {
        n += 1;
    }
    while n > 0 && !fits(n) {
        n -= 1;
    }
    n
}

/// Volatile handle on a persistent slab
pub struct Slab {
    region: Arc<Region>,
    base: RPtr,
    size_class: usize,
    block_size: usize,
    nblocks: usize,
    header_size: usize,
    free_list: VecDeque<usize>,
}

impl Slab {
    /// Format a slab of `slab_size` bytes at `base` and open it
    pub fn make(region: Arc<Region>, base: RPtr, slab_size: usize, size_class: usize) -> Result<Self> {
        Self::format(&region, base, slab_size, size_class)?;
        Self::load(region, base)
    }

    /// Open the slab formatted at `base`
    pub fn load(region: Arc<Region>, base: RPtr) -> Result<Self> {
        if !region.contains(base, SLAB_HEADER_FIXED_SIZE) {
            return Err(Error::InvalidAddress(base));
        }
        let magic = region.load_u16(base + MAGIC_OFFSET);
        if magic != SLAB_MAGIC {
            return Err(Error::InvalidParameter(format!(
                "no slab at {} (magic {:#x})",
                base, magic
            )));
        }

        let header_size = region.load_u32(base + HEADER_SIZE_OFFSET) as usize;
        let size_class = region.load_u16(base + SIZE_CLASS_OFFSET) as usize;
        let nblocks = region.load_u32(base + NBLOCKS_OFFSET) as usize;
        let block_size = size_class::size_from_class(size_class).ok_or_else(|| {
            Error::InvalidParameter(format!("slab at {} has unknown size class {}", base, size_class))
        })?;
        if nblocks == 0
            || header_size != self::header_size(nblocks)
            || !region.contains(base, header_size + nblocks * block_size)
        {
            return Err(Error::InvalidParameter(format!(
                "corrupt slab header at {}",
                base
            )));
        }

        let bitmap = Bitmap::load(&region, base + BITMAP_OFFSET, nblocks);
        let free_list = (0..nblocks).filter(|&i| !bitmap.is_set(i)).collect();

        Ok(Self {
            region,
            base,
            size_class,
            block_size,
            nblocks,
            header_size,
            free_list,
        })
    }

    fn format(region: &Region, base: RPtr, slab_size: usize, size_class: usize) -> Result<()> {
        let block_size = size_class::size_from_class(size_class).ok_or_else(|| {
            Error::InvalidParameter(format!("unknown size class {}", size_class))
        })?;
        let nblocks = max_nblocks(slab_size, block_size);
        if nblocks == 0 {
            return Err(Error::InvalidParameter(format!(
                "a {}-byte slab cannot hold a {}-byte block",
                slab_size, block_size
            )));
        }
        if !region.contains(base, slab_size) {
            return Err(Error::InvalidAddress(base));
        }

        let header_size = header_size(nblocks);
        region.store_u16(base + MAGIC_OFFSET, 0);
        region.store_u32(base + HEADER_SIZE_OFFSET, header_size as u32);
        region.store_u16(base + SIZE_CLASS_OFFSET, size_class as u16);
        region.store_u32(base + NBLOCKS_OFFSET, nblocks as u32);
        region.store_u64(base + RESERVED_OFFSET, 0);
        Bitmap::make(region, base + BITMAP_OFFSET, nblocks);
        region.persist(base, header_size);
        region.store_u16(base + MAGIC_OFFSET, SLAB_MAGIC);
        region.persist(base, header_size);
        Ok(())
    }

    /// Reformat an empty slab for another size class
    pub fn reset(&mut self, slab_size: usize, size_class: usize) -> Result<()> {
        assert!(self.empty(), "reset of slab {} with live blocks", self.base);
        Self::format(&self.region, self.base, slab_size, size_class)?;
        *self = Self::load(Arc::clone(&self.region), self.base)?;
        Ok(())
    }

    /// Take the block at the front of the free list
    pub fn alloc_block(&mut self) -> Option<RPtr> {
        let id = self.free_list.pop_front()?;
        self.bitmap().set(id);
        debug!("Allocated block {} of slab {} ({} bytes)", id, self.base, self.block_size);
        Some(self.block(id))
    }

    /// Return a block; it is reused first
    ///
    /// Panics if the block is already free.
    pub fn free_block(&mut self, ptr: RPtr) {
        assert!(self.owns_block(ptr), "{} is not a block of slab {}", ptr, self.base);
        let id = self.block_id(ptr);
        assert!(!self.is_free(id), "double free of block {} in slab {}", id, self.base);
        self.bitmap().clear(id);
        self.free_list.push_front(id);
        debug!("Freed block {} of slab {}", id, self.base);
    }

    pub fn is_free(&self, id: usize) -> bool {
        !self.bitmap().is_set(id)
    }

    /// Address of block `id`
    pub fn block(&self, id: usize) -> RPtr {
        self.base + self.header_size + id * self.block_size
    }

    /// Block index of `ptr`, which must lie in the block area
    pub fn block_id(&self, ptr: RPtr) -> usize {
        (ptr - self.block(0)) / self.block_size
    }

    /// Whether `ptr` is the start of one of this slab's blocks
    pub fn owns_block(&self, ptr: RPtr) -> bool {
        self.contains(ptr) && (ptr - self.block(0)) % self.block_size == 0
    }

    /// Whether `ptr` falls in this slab's block area
    pub fn contains(&self, ptr: RPtr) -> bool {
        ptr >= self.block(0) && ptr < self.block(self.nblocks)
    }

    pub fn base(&self) -> RPtr {
        self.base
    }

    pub fn size_class(&self) -> usize {
        self.size_class
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn header_size(&self) -> usize {
        self.header_size
    }

    pub fn nblocks(&self) -> usize {
        self.nblocks
    }

    pub fn nblocks_free(&self) -> usize {
        self.free_list.len()
    }

    /// Fullness bin, from 0 (empty or nearly so) to `SLAB_FULLNESS_BINS - 1` (full)
    pub fn fullness(&self) -> usize {
        (SLAB_FULLNESS_BINS - 1) * (self.nblocks - self.nblocks_free()) / self.nblocks
    }

    pub fn empty(&self) -> bool {
        self.nblocks_free() == self.nblocks
    }

    pub fn full(&self) -> bool {
        self.free_list.is_empty()
    }

    /// Free block ids in the order they will be handed out
    pub fn free_blocks(&self) -> impl Iterator<Item = usize> + '_ {
        self.free_list.iter().copied()
    }

    fn bitmap(&self) -> Bitmap<'_> {
        Bitmap::load(&self.region, self.base + BITMAP_OFFSET, self.nblocks)
    }
}

impl fmt::Debug for Slab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Slab")
            .field("base", &self.base)
            .field("size_class", &self.size_class)
            .field("nblocks", &self.nblocks)
            .field("nblocks_free", &self.nblocks_free())
            .finish()
    }
}

impl fmt::Display for Slab {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.block_size, self.nblocks, self.nblocks_free())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use crate::slab::size_class::size_class;

    const SLAB_SIZE: usize = 256 * 1024;

    fn class_of(size: usize) -> usize {
        size_class(size).unwrap()
    }

    fn make_slab(size: usize) -> Result<Slab> {
        let region = Arc::new(Region::new(SLAB_SIZE)?);
        Slab::make(region, RPtr::new(0), SLAB_SIZE, class_of(size))
    }

    #[test]
    fn test_geometry() -> Result<()> {
        let slab = make_slab(128 * 1024)?;
        assert_eq!(slab.nblocks(), 1);
        assert_eq!(slab.header_size() % CACHE_LINE_SIZE, 0);

        let slab = make_slab(32 * 1024)?;
        assert_eq!(slab.nblocks(), 7);
        for i in 0..slab.nblocks() {
            assert_eq!(slab.block_id(slab.block(i)), i);
        }
        let blocks: std::collections::HashSet<_> = (0..slab.nblocks()).map(|i| slab.block(i)).collect();
        assert_eq!(blocks.len(), slab.nblocks());

        let slab = make_slab(1024)?;
        assert_eq!(slab.nblocks(), 255);
        assert_eq!(slab.block_id(slab.block(1)), 1);

        let slab = make_slab(8)?;
        assert!(slab.header_size() + slab.nblocks() * 8 <= SLAB_SIZE);
        assert!(header_size(slab.nblocks() + 1) + (slab.nblocks() + 1) * 8 > SLAB_SIZE);
        Ok(())
    }

    #[test]
    fn test_max_nblocks_edges() {
        assert_eq!(max_nblocks(64, 8), 0);
        assert_eq!(max_nblocks(128, 64), 1);
        assert_eq!(max_nblocks(8192, 8192), 0);
        assert_eq!(max_nblocks(8192, 2048), 3);
    }

    #[test]
    fn test_load_rejects_slab_without_blocks() -> Result<()> {
        let region = Arc::new(Region::new(SLAB_SIZE)?);
        let base = RPtr::new(0);
        Slab::make(Arc::clone(&region), base, SLAB_SIZE, class_of(1024))?;
        region.store_u32(base + NBLOCKS_OFFSET, 0);
        region.store_u32(base + HEADER_SIZE_OFFSET, header_size(0) as u32);

        let err = Slab::load(region, base).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParameter);
        Ok(())
    }

    #[test]
    fn test_oversized_class_rejected() -> Result<()> {
        let region = Arc::new(Region::new(8192)?);
        let err = Slab::make(region, RPtr::new(0), 8192, class_of(8192)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParameter);
        Ok(())
    }

    #[test]
    fn test_alloc_keeps_payload() -> Result<()> {
        let mut slab = make_slab(130)?;
        assert_eq!(slab.block_size(), 136);

        let pattern = [0x5au8; 136];
        let first = slab.alloc_block().unwrap();
        assert_eq!(first, slab.block(0));
        slab.region.write_bytes(first, &pattern)?;

        while slab.alloc_block().is_some() {}
        assert!(slab.full());
        assert!(!slab.is_free(slab.nblocks() - 1));

        let mut buf = [0u8; 136];
        slab.region.read_bytes(first, &mut buf)?;
        assert_eq!(buf, pattern);
        Ok(())
    }

    #[test]
    fn test_free_block_is_reused_first() -> Result<()> {
        let mut slab = make_slab(1024)?;
        let a = slab.alloc_block().unwrap();
        let b = slab.alloc_block().unwrap();
        slab.alloc_block().unwrap();

        slab.free_block(a);
        slab.free_block(b);
        assert_eq!(slab.alloc_block(), Some(b));
        assert_eq!(slab.alloc_block(), Some(a));
        Ok(())
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn test_double_free_panics() {
        let mut slab = make_slab(1024).unwrap();
        let a = slab.alloc_block().unwrap();
        slab.free_block(a);
        slab.free_block(a);
    }

    #[test]
    fn test_load_rebuilds_free_list() -> Result<()> {
        let mut slab = make_slab(1024)?;
        for _ in 0..3 {
            slab.alloc_block();
        }
        assert_eq!(slab.nblocks_free(), slab.nblocks() - 3);

        let shadow = Slab::load(Arc::clone(&slab.region), slab.base())?;
        assert_eq!(shadow.nblocks_free(), slab.nblocks_free());
        assert!((0..3).all(|i| !shadow.is_free(i)));
        assert_eq!(shadow.free_blocks().next(), Some(3));
        Ok(())
    }

    #[test]
    fn test_load_requires_magic() -> Result<()> {
        let region = Arc::new(Region::new(4096)?);
        let err = Slab::load(region, RPtr::new(0)).unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidParameter);
        Ok(())
    }

    #[test]
    fn test_fullness() -> Result<()> {
        let mut slab = make_slab(32 * 1024)?;
        assert!(slab.empty());
        assert_eq!(slab.fullness(), 0);

        let mut blocks = Vec::new();
        for _ in 0..4 {
            blocks.push(slab.alloc_block().unwrap());
        }
        // 2 * 4 / 7
        assert_eq!(slab.fullness(), 1);
        while let Some(block) = slab.alloc_block() {
            blocks.push(block);
        }
        assert_eq!(slab.fullness(), SLAB_FULLNESS_BINS - 1);
        assert!(slab.full());

        for block in blocks {
            slab.free_block(block);
        }
        assert!(slab.empty());
        Ok(())
    }

    #[test]
    fn test_reset_changes_class() -> Result<()> {
        let mut slab = make_slab(1024)?;
        slab.reset(SLAB_SIZE, class_of(32 * 1024))?;
        assert_eq!(slab.block_size(), 32 * 1024);
        assert_eq!(slab.nblocks(), 7);
        assert_eq!(slab.to_string(), "(32768, 7, 7)");

        let reloaded = Slab::load(Arc::clone(&slab.region), slab.base())?;
        assert_eq!(reloaded.size_class(), class_of(32 * 1024));
        Ok(())
    }
}
