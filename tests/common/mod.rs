//! Shared helpers for integration tests

#![allow(dead_code)]

use pmheap::error::Result;
use pmheap::{ExtentHeap, HeapConfig, Region, SlabHeap};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Route allocator logs to the test output; `RUST_LOG=pmheap=debug` to see them
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Deterministic generator so failures replay
pub struct Lcg(pub u64);

impl Lcg {
    pub fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    pub fn below(&mut self, bound: u64) -> u64 {
        self.next() % bound
    }
}

/// Extent heap plus root slab heap over a fresh region
pub struct Stack {
    pub region: Arc<Region>,
    pub extent_heap: Arc<ExtentHeap>,
    pub slab_heap: Arc<SlabHeap>,
}

impl Stack {
    pub fn make(config: &HeapConfig) -> Result<Self> {
        let region = Arc::new(Region::new(config.region_size)?);
        let extent_heap = Arc::new(ExtentHeap::make(
            Arc::clone(&region),
            config.region_size,
            config.block_log2size,
        )?);
        let slab_heap = SlabHeap::new(config.slab_size, Arc::clone(&extent_heap))?;
        Ok(Self {
            region,
            extent_heap,
            slab_heap,
        })
    }

    /// Copy the region into a new mapping and recover both heaps from it
    pub fn restart(&self, config: &HeapConfig) -> Result<Self> {
        let region = Arc::new(Region::from_snapshot(&self.region.snapshot())?);
        let extent_heap = Arc::new(ExtentHeap::load(Arc::clone(&region))?);
        let slab_heap = SlabHeap::new(config.slab_size, Arc::clone(&extent_heap))?;
        slab_heap.init()?;
        Ok(Self {
            region,
            extent_heap,
            slab_heap,
        })
    }
}

/// Fill `len` bytes at `ptr` with a pattern derived from `seed`
pub fn stamp(region: &Region, ptr: pmheap::RPtr, len: usize, seed: u8) -> Result<()> {
    let bytes: Vec<u8> = (0..len).map(|i| seed.wrapping_add(i as u8)).collect();
    region.write_bytes(ptr, &bytes)
}

/// Whether `len` bytes at `ptr` still hold the pattern written by [`stamp`]
pub fn stamped(region: &Region, ptr: pmheap::RPtr, len: usize, seed: u8) -> Result<bool> {
    let mut bytes = vec![0u8; len];
    region.read_bytes(ptr, &mut bytes)?;
    Ok(bytes
        .iter()
        .enumerate()
        .all(|(i, &b)| b == seed.wrapping_add(i as u8)))
}
