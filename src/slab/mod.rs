//! Slab Heap
//!
//! Serves small allocations from slabs: extents of a fixed size carved into
//! equal blocks of one size class, with a persistent allocation bitmap.
//!
//! # Architecture
//!
//! ```text
//! SlabHeap (child) ──acquire_slab──→ SlabHeap (root) ──alloc_extent──→ ExtentHeap
//!   │
//!   ├─→ class 104B   [0] slab, slab   [1] slab   [2] (full) slab
//!   ├─→ class 1KB    [0] slab         [1]        [2]
//!   └─→ [R] empty slabs, reusable for any class
//!
//! SlabArena (shared by the family)
//!   ├─→ base → SharedSlab { owner, Mutex<Slab> }
//!   └─→ heap id → Weak<SlabHeap>
//! ```
//!
//! Slab extents are tagged in the extent heap, so a root slab heap finds
//! them again after a restart.

pub mod bitmap;
pub mod heap;
pub mod list;
pub mod size_class;
#[allow(clippy::module_inception)]
pub mod slab;

pub use bitmap::Bitmap;
pub use heap::{Bucket, HeapId, SharedSlab, SizeClassStats, SlabArena, SlabHeap, SlabHeapStats};
pub use list::SlabLists;
pub use size_class::{size_class, size_from_class, MAX_CLASS_SIZE, NUM_SIZE_CLASSES, SIZE_CLASSES};
pub use slab::{Slab, SLAB_FULLNESS_BINS};
