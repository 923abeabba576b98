//! On-media layout of an extent heap
//!
//! # Layout
//!
//! ```text
//! offset 0          heap header, one cache line
//!                     0  magic            u32
//!                     8  region_size      u64
//!                    16  block_log2size   u64
//!                    24  nblocks          u64
//!                    32  headers_offset   u64  (relative to the end of the heap header)
//!                    40  blocks_offset    u64  (relative to the end of the heap header)
//! 64                extent header array, one 8-byte header per block
//!                     0  tag    u8   Free | ExtentFirst | ExtentRun
//!                     1  kind   u8   Raw | Slab
//!                     4  nblocks u32 (meaningful on ExtentFirst)
//! 64 + headers      block array, cache-line aligned
//! ```
//!
//! The magic is written last when a heap is formatted, so a region that
//! crashed mid-format does not load.

use crate::error::{Error, Result};
use crate::region::{round_up, RPtr, Region, CACHE_LINE_SIZE};
use serde::{Deserialize, Serialize};

pub const HEAP_MAGIC: u32 = 0x504d_4845;
pub const HEAP_HEADER_SIZE: usize = CACHE_LINE_SIZE;
pub const EXTENT_HEADER_SIZE: usize = 8;

pub const MIN_BLOCK_LOG2SIZE: u32 = 6;
pub const MAX_BLOCK_LOG2SIZE: u32 = 30;

const MAGIC_OFFSET: usize = 0;
const REGION_SIZE_OFFSET: usize = 8;
const BLOCK_LOG2SIZE_OFFSET: usize = 16;
const NBLOCKS_OFFSET: usize = 24;
const HEADERS_OFFSET_OFFSET: usize = 32;
const BLOCKS_OFFSET_OFFSET: usize = 40;

const TAG_OFFSET: usize = 0;
const KIND_OFFSET: usize = 1;
const LEN_OFFSET: usize = 4;

/// State of one block's header
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BlockTag {
    Free = 0,
    /// First block of an allocated extent, carries the extent length
    ExtentFirst = 1,
    /// Continuation block of an allocated extent
    ExtentRun = 2,
}

impl BlockTag {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(BlockTag::Free),
            1 => Some(BlockTag::ExtentFirst),
            2 => Some(BlockTag::ExtentRun),
            _ => None,
        }
    }
}

/// What an allocated extent is used for, recorded so recovery can find slabs
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ExtentKind {
    Raw = 0,
    Slab = 1,
}

impl ExtentKind {
    fn from_raw(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(ExtentKind::Raw),
            1 => Some(ExtentKind::Slab),
            _ => None,
        }
    }
}

/// Geometry of a formatted heap, in absolute region offsets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeapLayout {
    pub region_size: usize,
    pub block_log2size: u32,
    pub nblocks: usize,
    pub headers_offset: usize,
    pub blocks_offset: usize,
}

impl HeapLayout {
    /// Largest heap whose header array and blocks fit in `region_size` bytes
    pub fn compute(region_size: usize, block_log2size: u32) -> Result<Self> {
        if !(MIN_BLOCK_LOG2SIZE..=MAX_BLOCK_LOG2SIZE).contains(&block_log2size) {
            return Err(Error::InvalidParameter(format!(
                "block_log2size {} outside {}..={}",
                block_log2size, MIN_BLOCK_LOG2SIZE, MAX_BLOCK_LOG2SIZE
            )));
        }
        let block_size = 1usize << block_log2size;
        let effective = region_size.saturating_sub(HEAP_HEADER_SIZE);
        let max_nblocks = effective / block_size;
        let headers_size = round_up(max_nblocks * EXTENT_HEADER_SIZE, CACHE_LINE_SIZE);
        let nblocks = effective.saturating_sub(headers_size) / block_size;

        if nblocks == 0 {
            return Err(Error::InvalidParameter(format!(
                "region of {} bytes cannot hold a single {}-byte block",
                region_size, block_size
            )));
        }
        if nblocks > u32::MAX as usize {
            return Err(Error::InvalidParameter(format!(
                "{} blocks exceed the extent length field",
                nblocks
            )));
        }

        Ok(Self {
            region_size,
            block_log2size,
            nblocks,
            headers_offset: HEAP_HEADER_SIZE,
            blocks_offset: HEAP_HEADER_SIZE + headers_size,
        })
    }

    /// Persist the heap header, magic last
    pub fn write(&self, region: &Region) {
        let base = RPtr::new(0);
        region.store_u64(base + REGION_SIZE_OFFSET, self.region_size as u64);
        region.store_u64(base + BLOCK_LOG2SIZE_OFFSET, self.block_log2size as u64);
        region.store_u64(base + NBLOCKS_OFFSET, self.nblocks as u64);
        region.store_u64(
            base + HEADERS_OFFSET_OFFSET,
            (self.headers_offset - HEAP_HEADER_SIZE) as u64,
        );
        region.store_u64(
            base + BLOCKS_OFFSET_OFFSET,
            (self.blocks_offset - HEAP_HEADER_SIZE) as u64,
        );
        region.persist(base, HEAP_HEADER_SIZE);
        region.store_u32(base + MAGIC_OFFSET, HEAP_MAGIC);
        region.persist(base, HEAP_HEADER_SIZE);
    }

    /// Read back a heap header written by [`HeapLayout::write`]
    pub fn read(region: &Region) -> Result<Self> {
        if !region.contains(RPtr::new(0), HEAP_HEADER_SIZE) {
            return Err(Error::InvalidParameter(
                "region is smaller than a heap header".to_string(),
            ));
        }
        let base = RPtr::new(0);
        let magic = region.load_u32(base + MAGIC_OFFSET);
        if magic != HEAP_MAGIC {
            return Err(Error::InvalidParameter(format!(
                "region holds no extent heap (magic {:#x})",
                magic
            )));
        }

        let block_log2size = region.load_u64(base + BLOCK_LOG2SIZE_OFFSET) as u32;
        let layout = Self {
            region_size: region.load_u64(base + REGION_SIZE_OFFSET) as usize,
            block_log2size,
            nblocks: region.load_u64(base + NBLOCKS_OFFSET) as usize,
            headers_offset: HEAP_HEADER_SIZE
                + region.load_u64(base + HEADERS_OFFSET_OFFSET) as usize,
            blocks_offset: HEAP_HEADER_SIZE
                + region.load_u64(base + BLOCKS_OFFSET_OFFSET) as usize,
        };

        let consistent = (MIN_BLOCK_LOG2SIZE..=MAX_BLOCK_LOG2SIZE).contains(&block_log2size)
            && layout.region_size <= region.len()
            && layout.headers_offset + layout.nblocks * EXTENT_HEADER_SIZE
                <= layout.blocks_offset
            && layout.blocks_offset + (layout.nblocks << block_log2size) <= layout.region_size;
        if !consistent {
            return Err(Error::InvalidParameter(format!(
                "corrupt extent heap header: {:?}",
                layout
            )));
        }
        Ok(layout)
    }

    pub fn block_size(&self) -> usize {
        1 << self.block_log2size
    }

    /// Header of block `idx`
    pub fn header(&self, idx: usize) -> RPtr {
        debug_assert!(idx < self.nblocks);
        RPtr::new((self.headers_offset + idx * EXTENT_HEADER_SIZE) as u64)
    }

    /// First byte of block `idx`
    pub fn block(&self, idx: usize) -> RPtr {
        RPtr::new((self.blocks_offset + (idx << self.block_log2size)) as u64)
    }

    /// Block index holding `ptr`, when `ptr` falls in the block array
    pub fn block_index(&self, ptr: RPtr) -> Option<usize> {
        let offset = ptr.offset() as usize;
        if offset < self.blocks_offset {
            return None;
        }
        let idx = (offset - self.blocks_offset) >> self.block_log2size;
        (idx < self.nblocks).then_some(idx)
    }
}

/// View of one block's persistent header
#[derive(Clone, Copy)]
pub struct ExtentHeader<'r> {
    region: &'r Region,
    ptr: RPtr,
}

impl<'r> ExtentHeader<'r> {
    pub fn new(region: &'r Region, ptr: RPtr) -> Self {
        Self { region, ptr }
    }

    pub fn ptr(&self) -> RPtr {
        self.ptr
    }

    pub fn tag(&self) -> BlockTag {
        let raw = self.region.load_u8(self.ptr + TAG_OFFSET);
        match BlockTag::from_raw(raw) {
            Some(tag) => tag,
            None => panic!("corrupt extent header at {}: tag {}", self.ptr, raw),
        }
    }

    pub fn kind(&self) -> ExtentKind {
        let raw = self.region.load_u8(self.ptr + KIND_OFFSET);
        match ExtentKind::from_raw(raw) {
            Some(kind) => kind,
            None => panic!("corrupt extent header at {}: kind {}", self.ptr, raw),
        }
    }

    /// Extent length in blocks, valid on an `ExtentFirst` header
    pub fn nblocks(&self) -> usize {
        self.region.load_u32(self.ptr + LEN_OFFSET) as usize
    }

    pub fn is_free(&self) -> bool {
        self.tag() == BlockTag::Free
    }

    /// Reset to a free, raw header
    pub fn format(&self) {
        self.set_tag(BlockTag::Free);
        self.region.store_u8(self.ptr + KIND_OFFSET, ExtentKind::Raw as u8);
        self.region.store_u32(self.ptr + LEN_OFFSET, 0);
    }

    /// Mark `nblocks` headers starting here as one allocated extent
    ///
    /// The length and the run tags become durable before the first tag is
    /// set, so a crash leaves either a free run or a complete extent.
    pub fn mark_alloc(&self, nblocks: usize) {
        debug_assert!(nblocks >= 1 && nblocks <= u32::MAX as usize);
        self.region.store_u32(self.ptr + LEN_OFFSET, nblocks as u32);
        self.region.store_u8(self.ptr + KIND_OFFSET, ExtentKind::Raw as u8);
        for i in 1..nblocks {
            self.follower(i).set_tag(BlockTag::ExtentRun);
        }
        self.region.persist(self.ptr, nblocks * EXTENT_HEADER_SIZE);
        self.set_tag(BlockTag::ExtentFirst);
        self.region.persist(self.ptr, EXTENT_HEADER_SIZE);
    }

    /// Return every header of this extent to free
    ///
    /// The first tag is cleared first; from then on the extent is free even
    /// if the run tags are still set when a crash hits.
    pub fn mark_free(&self) {
        let nblocks = self.nblocks();
        self.set_tag(BlockTag::Free);
        self.region.persist(self.ptr, EXTENT_HEADER_SIZE);
        for i in 1..nblocks {
            self.follower(i).set_tag(BlockTag::Free);
        }
        self.region.store_u8(self.ptr + KIND_OFFSET, ExtentKind::Raw as u8);
        self.region.persist(self.ptr, nblocks * EXTENT_HEADER_SIZE);
    }

    pub fn set_kind(&self, kind: ExtentKind) {
        self.region.store_u8(self.ptr + KIND_OFFSET, kind as u8);
        self.region.persist(self.ptr, EXTENT_HEADER_SIZE);
    }

    pub(crate) fn set_tag(&self, tag: BlockTag) {
        self.region.store_u8(self.ptr + TAG_OFFSET, tag as u8);
    }

    fn follower(&self, i: usize) -> ExtentHeader<'r> {
        ExtentHeader::new(self.region, self.ptr + i * EXTENT_HEADER_SIZE)
    }
}
