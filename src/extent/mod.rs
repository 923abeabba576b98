//! Extent Heap
//!
//! Manages a region as an array of fixed-size blocks handed out in
//! variable-length runs (extents).
//!
//! # Architecture
//!
//! ```text
//! ExtentHeap
//!   ├─→ HeapLayout      (persistent header: magic, geometry)
//!   ├─→ ExtentHeader[]  (persistent, one per block: Free | First(len) | Run)
//!   └─→ FreeSpaceMap    (volatile, rebuilt by a header scan on load)
//!         └─→ ExtentMap
//!               ├─→ by start      → coalescing on free
//!               └─→ by (len, start) → best fit on alloc
//! ```
//!
//! Allocation takes the smallest free run that fits and splits off the
//! tail. Freeing coalesces with free neighbours.

pub mod free_space;
pub mod header;
pub mod heap;
pub mod interval;
pub mod map;

pub use free_space::FreeSpaceMap;
pub use header::{BlockTag, ExtentKind, HeapLayout};
pub use heap::{Extent, ExtentHeap, ExtentHeapStats, Extents};
pub use interval::ExtentInterval;
pub use map::ExtentMap;
