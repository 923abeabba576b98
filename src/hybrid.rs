//! Hybrid heap: slab heap for small requests, extent heap for big ones
//!
//! # Architecture
//!
//! ```text
//! HybridHeap
//!   ├─→ size <  big_size → small heap (SlabHeap)
//!   └─→ size >= big_size → big heap   (ExtentHeap)
//! ```
//!
//! `free` and `getsize` ask the small heap first; a pointer it does not know
//! belongs to the big heap.

use crate::config::HeapConfig;
use crate::error::Result;
use crate::extent::ExtentHeap;
use crate::heap::Heap;
use crate::region::{RPtr, Region};
use crate::slab::SlabHeap;
use std::fmt;
use std::sync::Arc;
use tracing::info;

pub struct HybridHeap {
    bigsize: usize,
    small: Arc<dyn Heap>,
    big: Arc<dyn Heap>,
}

impl HybridHeap {
    /// Compose two heaps around the `bigsize` threshold
    pub fn new(bigsize: usize, small: Arc<dyn Heap>, big: Arc<dyn Heap>) -> Self {
        Self { bigsize, small, big }
    }

    /// Format `region` and build a slab heap over an extent heap
    pub fn make(region: Arc<Region>, config: &HeapConfig) -> Result<Self> {
        config.validate()?;
        let extent_heap = Arc::new(ExtentHeap::make(
            region,
            config.region_size,
            config.block_log2size,
        )?);
        let slab_heap = SlabHeap::new(config.slab_size, Arc::clone(&extent_heap))?;
        info!(
            region_size = config.region_size,
            slab_size = config.slab_size,
            big_size = config.big_size,
            "Created hybrid heap"
        );
        Ok(Self::new(config.big_size, slab_heap, extent_heap))
    }

    /// Reopen a heap stack previously built with [`HybridHeap::make`]
    pub fn load(region: Arc<Region>, config: &HeapConfig) -> Result<Self> {
        config.validate()?;
        let extent_heap = Arc::new(ExtentHeap::load(region)?);
        let slab_heap = SlabHeap::new(config.slab_size, Arc::clone(&extent_heap))?;
        let slabs = slab_heap.init()?;
        info!(slabs, big_size = config.big_size, "Loaded hybrid heap");
        Ok(Self::new(config.big_size, slab_heap, extent_heap))
    }

    pub fn bigsize(&self) -> usize {
        self.bigsize
    }

    pub fn small(&self) -> &Arc<dyn Heap> {
        &self.small
    }

    pub fn big(&self) -> &Arc<dyn Heap> {
        &self.big
    }

    pub fn malloc(&self, size: usize) -> Result<RPtr> {
        if size < self.bigsize {
            self.small.malloc(size)
        } else {
            self.big.malloc(size)
        }
    }

    pub fn free(&self, ptr: RPtr) -> Result<()> {
        if self.small.getsize(ptr) != 0 {
            self.small.free(ptr)
        } else {
            self.big.free(ptr)
        }
    }

    pub fn getsize(&self, ptr: RPtr) -> usize {
        match self.small.getsize(ptr) {
            0 => self.big.getsize(ptr),
            size => size,
        }
    }
}

impl Heap for HybridHeap {
    fn malloc(&self, size: usize) -> Result<RPtr> {
        HybridHeap::malloc(self, size)
    }

    fn free(&self, ptr: RPtr) -> Result<()> {
        HybridHeap::free(self, ptr)
    }

    fn getsize(&self, ptr: RPtr) -> usize {
        HybridHeap::getsize(self, ptr)
    }
}

impl fmt::Debug for HybridHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HybridHeap")
            .field("bigsize", &self.bigsize)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, ErrorCode};

    #[test]
    fn test_alloc_free() -> Result<()> {
        let region_size = 1024 * 1024;
        let block_log2size = 13;
        let slabsize = 1 << block_log2size;
        let bigsize = slabsize;

        let region = Arc::new(Region::new(region_size)?);
        let extent_heap = Arc::new(ExtentHeap::make(region, region_size, block_log2size)?);
        let slab_heap = SlabHeap::new(slabsize, Arc::clone(&extent_heap))?;
        slab_heap.init()?;
        let heap = HybridHeap::new(bigsize, slab_heap, extent_heap);

        let big = heap.malloc(bigsize * 2)?;
        assert_eq!(heap.getsize(big), bigsize * 2);

        let small = heap.malloc(bigsize / 4)?;
        assert_eq!(heap.getsize(small), bigsize / 4);

        heap.free(big)?;
        heap.free(small)?;
        assert_eq!(heap.getsize(big), 0);
        Ok(())
    }

    #[test]
    fn test_threshold_routing() -> Result<()> {
        let config = HeapConfig::default();
        let region = Arc::new(Region::new(config.region_size)?);
        let heap = HybridHeap::make(region, &config)?;

        let below = heap.malloc(config.big_size - 1)?;
        let at = heap.malloc(config.big_size)?;
        assert!(heap.small().getsize(below) >= config.big_size - 1);
        assert!(heap.getsize(below) < config.big_size);
        assert_eq!(heap.small().getsize(at), 0);
        assert!(heap.big().getsize(at) >= config.big_size);
        assert_eq!(heap.getsize(at), heap.big().getsize(at));

        heap.free(below)?;
        heap.free(at)?;
        Ok(())
    }

    #[test]
    fn test_slab_extent_is_not_freed_as_big() -> Result<()> {
        let config = HeapConfig::default();
        let region = Arc::new(Region::new(config.region_size)?);
        let extent_heap = Arc::new(ExtentHeap::make(region, config.region_size, config.block_log2size)?);
        let slab_heap = SlabHeap::new(config.slab_size, Arc::clone(&extent_heap))?;
        let heap = HybridHeap::new(config.big_size, slab_heap, Arc::clone(&extent_heap) as Arc<dyn Heap>);

        let small = heap.malloc(64)?;
        let slab_base = extent_heap.extent(small)?.payload();
        assert_ne!(slab_base, small);
        assert_eq!(heap.free(slab_base), Err(Error::InvalidAddress(slab_base)));

        // The slab and its live block are untouched.
        assert_eq!(heap.getsize(small), 64);
        let big = heap.malloc(config.slab_size)?;
        assert!(big + config.slab_size <= slab_base || slab_base + config.slab_size <= big);
        heap.free(small)?;
        heap.free(big)?;
        Ok(())
    }

    #[test]
    fn test_unknown_pointer() -> Result<()> {
        let config = HeapConfig::default();
        let region = Arc::new(Region::new(config.region_size)?);
        let heap = HybridHeap::make(region, &config)?;

        let ptr = RPtr::new(8);
        assert_eq!(heap.getsize(ptr), 0);
        assert_eq!(heap.free(ptr), Err(Error::InvalidAddress(ptr)));
        assert_eq!(heap.malloc(0).unwrap_err().code(), ErrorCode::InvalidParameter);
        Ok(())
    }
}
