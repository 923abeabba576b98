//! Extent heap: variable-length runs of fixed-size blocks
//!
//! Every block has a persistent header; an allocated extent is a run of
//! headers tagged `ExtentFirst, ExtentRun, ...`. The free space is not
//! persisted. It is rebuilt by a header scan each time the heap is loaded,
//! which also reclaims runs a crash left without a first header.

use super::free_space::FreeSpaceMap;
use super::header::{BlockTag, ExtentHeader, ExtentKind, HeapLayout, EXTENT_HEADER_SIZE};
use super::interval::ExtentInterval;
use crate::error::{Error, Result};
use crate::heap::Heap;
use crate::region::{RPtr, Region};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Volatile handle on a run of blocks, as seen when it was looked up
#[derive(Debug, Clone, Copy)]
pub struct Extent {
    interval: ExtentInterval,
    header: RPtr,
    payload: RPtr,
    tag: BlockTag,
    kind: ExtentKind,
}

impl Extent {
    pub fn interval(&self) -> ExtentInterval {
        self.interval
    }

    pub fn start(&self) -> usize {
        self.interval.start()
    }

    /// Length in blocks
    pub fn len(&self) -> usize {
        self.interval.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interval.is_empty()
    }

    pub fn end(&self) -> usize {
        self.interval.end()
    }

    /// Persistent header of the first block
    pub fn header(&self) -> RPtr {
        self.header
    }

    /// First byte of the extent's payload
    pub fn payload(&self) -> RPtr {
        self.payload
    }

    pub fn is_free(&self) -> bool {
        self.tag == BlockTag::Free
    }

    pub fn kind(&self) -> ExtentKind {
        self.kind
    }
}

impl PartialEq for Extent {
    fn eq(&self, other: &Self) -> bool {
        self.interval == other.interval
    }
}

impl Eq for Extent {}

/// Counters for an extent heap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtentHeapStats {
    pub block_size: usize,
    pub nblocks: usize,
    pub free_blocks: usize,
    pub free_extents: usize,
    pub largest_free_extent: usize,
}

pub struct ExtentHeap {
    region: Arc<Region>,
    layout: HeapLayout,
    fsmap: Mutex<FreeSpaceMap>,
}

impl ExtentHeap {
    /// Format the first `region_size` bytes of `region` as an empty heap
    ///
    /// # Arguments
    ///
    /// * `region` - Region to format
    /// * `region_size` - Bytes of the region the heap may use
    /// * `block_log2size` - log2 of the block size
    pub fn make(region: Arc<Region>, region_size: usize, block_log2size: u32) -> Result<Self> {
        if region_size > region.len() {
            return Err(Error::InvalidParameter(format!(
                "heap of {} bytes does not fit in a {}-byte region",
                region_size,
                region.len()
            )));
        }
        let layout = HeapLayout::compute(region_size, block_log2size)?;

        for idx in 0..layout.nblocks {
            ExtentHeader::new(&region, layout.header(idx)).format();
        }
        region.persist(layout.header(0), layout.nblocks * EXTENT_HEADER_SIZE);
        layout.write(&region);

        info!(
            region_size,
            block_size = layout.block_size(),
            nblocks = layout.nblocks,
            "Formatted extent heap"
        );
        Self::init(region, layout)
    }

    /// Open a heap previously formatted with [`ExtentHeap::make`]
    pub fn load(region: Arc<Region>) -> Result<Self> {
        let layout = HeapLayout::read(&region)?;
        info!(
            region_size = layout.region_size,
            block_size = layout.block_size(),
            nblocks = layout.nblocks,
            "Loading extent heap"
        );
        Self::init(region, layout)
    }

    fn init(region: Arc<Region>, layout: HeapLayout) -> Result<Self> {
        let heap = Self {
            region,
            layout,
            fsmap: Mutex::new(FreeSpaceMap::new()),
        };

        let mut fsmap = FreeSpaceMap::new();
        let mut allocated = 0;
        let mut repaired = 0;
        for extent in heap.iter() {
            if !extent.is_free() {
                allocated += 1;
                continue;
            }
            for idx in extent.start()..extent.end() {
                let header = heap.header(idx);
                if header.tag() != BlockTag::Free {
                    header.set_tag(BlockTag::Free);
                    repaired += 1;
                }
            }
            fsmap.free_extent(extent.interval());
        }

        if repaired > 0 {
            heap.region
                .persist(layout.header(0), layout.nblocks * EXTENT_HEADER_SIZE);
            warn!(repaired, "Reclaimed extent run headers without a first header");
        }
        info!(
            free_blocks = fsmap.free_blocks(),
            allocated_extents = allocated,
            "Extent heap ready"
        );

        *heap.fsmap.lock() = fsmap;
        Ok(heap)
    }

    pub fn region(&self) -> &Arc<Region> {
        &self.region
    }

    pub fn layout(&self) -> &HeapLayout {
        &self.layout
    }

    pub fn blocksize(&self) -> usize {
        self.layout.block_size()
    }

    pub fn block_log2size(&self) -> u32 {
        self.layout.block_log2size
    }

    pub fn nblocks(&self) -> usize {
        self.layout.nblocks
    }

    /// Blocks needed to hold `size` bytes
    pub fn blocks_for(&self, size: usize) -> usize {
        size.div_ceil(self.blocksize())
    }

    /// Allocate a run of exactly `nblocks` blocks
    pub fn alloc_extent(&self, nblocks: usize) -> Result<Extent> {
        let mut fsmap = self.fsmap.lock();
        let interval = fsmap.alloc_extent(nblocks)?;
        self.header(interval.start()).mark_alloc(interval.len());
        debug!("Allocated extent {} ({} free blocks left)", interval, fsmap.free_blocks());
        Ok(self.extent_at(interval))
    }

    /// Return an allocated extent
    ///
    /// Panics if the extent is already free.
    pub fn free_extent(&self, extent: &Extent) {
        let mut fsmap = self.fsmap.lock();
        self.release(&mut fsmap, extent);
    }

    fn release(&self, fsmap: &mut FreeSpaceMap, extent: &Extent) {
        let header = self.header(extent.start());
        assert_eq!(
            header.tag(),
            BlockTag::ExtentFirst,
            "double free of extent {}",
            extent.interval()
        );
        assert_eq!(
            header.nblocks(),
            extent.len(),
            "extent {} disagrees with its header",
            extent.interval()
        );
        header.mark_free();
        fsmap.free_extent(extent.interval());
        debug!("Freed extent {}", extent.interval());
    }

    /// Allocate enough whole blocks for `size` bytes
    pub fn malloc(&self, size: usize) -> Result<RPtr> {
        if size == 0 {
            return Err(Error::InvalidParameter("cannot allocate 0 bytes".to_string()));
        }
        Ok(self.alloc_extent(self.blocks_for(size))?.payload())
    }

    /// Free the extent starting at `ptr`
    ///
    /// Extents tagged as slabs belong to a slab heap and are only released
    /// through [`ExtentHeap::free_extent`].
    pub fn free(&self, ptr: RPtr) -> Result<()> {
        let mut fsmap = self.fsmap.lock();
        let extent = self.extent(ptr)?;
        if extent.is_free() || extent.payload() != ptr || extent.kind() != ExtentKind::Raw {
            return Err(Error::InvalidAddress(ptr));
        }
        self.release(&mut fsmap, &extent);
        Ok(())
    }

    /// Bytes spanned by the allocated extent holding `ptr`, or 0
    pub fn getsize(&self, ptr: RPtr) -> usize {
        match self.extent(ptr) {
            Ok(extent) if !extent.is_free() => extent.len() << self.layout.block_log2size,
            _ => 0,
        }
    }

    /// Extent covering `ptr`
    ///
    /// Interior pointers resolve to their extent; a pointer into free space
    /// resolves to a one-block free extent.
    pub fn extent(&self, ptr: RPtr) -> Result<Extent> {
        let idx = self
            .layout
            .block_index(ptr)
            .ok_or(Error::InvalidAddress(ptr))?;

        let mut first = idx;
        while first > 0 && self.header(first).tag() == BlockTag::ExtentRun {
            first -= 1;
        }

        let header = self.header(first);
        match header.tag() {
            BlockTag::ExtentFirst if first + header.nblocks() > idx => {
                Ok(self.extent_at(ExtentInterval::new(first, header.nblocks())))
            }
            BlockTag::Free if first == idx => Ok(self.extent_at(ExtentInterval::new(idx, 1))),
            _ => Err(Error::InvalidAddress(ptr)),
        }
    }

    /// Record what an allocated extent is used for
    pub fn set_kind(&self, extent: &Extent, kind: ExtentKind) {
        self.header(extent.start()).set_kind(kind);
    }

    /// Walk the heap in block order
    pub fn iter(&self) -> Extents<'_> {
        Extents { heap: self, cursor: 0 }
    }

    /// Copy of the current free-space index
    pub fn free_space(&self) -> FreeSpaceMap {
        self.fsmap.lock().clone()
    }

    pub fn stats(&self) -> ExtentHeapStats {
        let fsmap = self.fsmap.lock();
        ExtentHeapStats {
            block_size: self.blocksize(),
            nblocks: self.nblocks(),
            free_blocks: fsmap.free_blocks(),
            free_extents: fsmap.map().len(),
            largest_free_extent: fsmap.largest().map_or(0, |iv| iv.len()),
        }
    }

    fn header(&self, idx: usize) -> ExtentHeader<'_> {
        ExtentHeader::new(&self.region, self.layout.header(idx))
    }

    fn extent_at(&self, interval: ExtentInterval) -> Extent {
        let header = self.header(interval.start());
        Extent {
            interval,
            header: header.ptr(),
            payload: self.layout.block(interval.start()),
            tag: header.tag(),
            kind: header.kind(),
        }
    }
}

impl Heap for ExtentHeap {
    fn malloc(&self, size: usize) -> Result<RPtr> {
        ExtentHeap::malloc(self, size)
    }

    fn free(&self, ptr: RPtr) -> Result<()> {
        ExtentHeap::free(self, ptr)
    }

    fn getsize(&self, ptr: RPtr) -> usize {
        ExtentHeap::getsize(self, ptr)
    }
}

impl fmt::Debug for ExtentHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtentHeap")
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

/// Iterator over every extent, allocated or free, in block order
///
/// Adjacent free blocks are reported as one extent. Run headers with no
/// first header in front of them count as free.
pub struct Extents<'a> {
    heap: &'a ExtentHeap,
    cursor: usize,
}

impl Iterator for Extents<'_> {
    type Item = Extent;

    fn next(&mut self) -> Option<Extent> {
        let nblocks = self.heap.nblocks();
        if self.cursor >= nblocks {
            return None;
        }
        let start = self.cursor;

        let header = self.heap.header(start);
        if header.tag() == BlockTag::ExtentFirst {
            let len = header.nblocks();
            assert!(
                len >= 1 && start + len <= nblocks,
                "corrupt extent header at block {}: length {}",
                start,
                len
            );
            self.cursor = start + len;
            return Some(self.heap.extent_at(ExtentInterval::new(start, len)));
        }

        let mut end = start + 1;
        while end < nblocks && self.heap.header(end).tag() != BlockTag::ExtentFirst {
            end += 1;
        }
        self.cursor = end;

        let mut extent = self.heap.extent_at(ExtentInterval::new(start, end - start));
        extent.tag = BlockTag::Free;
        Some(extent)
    }
}
