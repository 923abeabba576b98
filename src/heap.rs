//! Common surface of every allocator tier
//!
//! The extent heap, the slab heap and the hybrid heap all hand out
//! region-relative pointers through the same three calls, which lets the
//! hybrid heap compose any two of them.

use crate::error::Result;
use crate::region::RPtr;

/// Allocator over a region
pub trait Heap: Send + Sync {
    /// Allocate at least `size` bytes
    fn malloc(&self, size: usize) -> Result<RPtr>;

    /// Release an allocation previously returned by [`Heap::malloc`]
    fn free(&self, ptr: RPtr) -> Result<()>;

    /// Usable size of the allocation holding `ptr`, or 0 when this heap
    /// does not know the pointer
    fn getsize(&self, ptr: RPtr) -> usize;
}
