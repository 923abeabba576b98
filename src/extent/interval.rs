//! Block-index intervals

use serde::{Deserialize, Serialize};
use std::fmt;

/// Half-open run of blocks `[start, start + len)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ExtentInterval {
    start: usize,
    len: usize,
}

impl ExtentInterval {
    pub const fn new(start: usize, len: usize) -> Self {
        Self { start, len }
    }

    pub const fn start(&self) -> usize {
        self.start
    }

    pub const fn len(&self) -> usize {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// One past the last block
    pub const fn end(&self) -> usize {
        self.start + self.len
    }

    /// True when the intervals share a block or touch end to start
    pub fn overlaps(&self, other: &ExtentInterval) -> bool {
        (self.start <= other.start && other.start <= self.end())
            || (other.start <= self.start && self.start <= other.end())
    }

    /// Grow to the union of `self` and `other`
    ///
    /// Leaves `self` untouched when the two neither overlap nor touch.
    pub fn merge(&mut self, other: &ExtentInterval) {
        if !self.overlaps(other) {
            return;
        }
        let start = self.start.min(other.start);
        let end = self.end().max(other.end());
        self.start = start;
        self.len = end - start;
    }
}

impl fmt::Display for ExtentInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.start, self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn merged(a: (usize, usize), b: (usize, usize)) -> ExtentInterval {
        let mut ex = ExtentInterval::new(a.0, a.1);
        ex.merge(&ExtentInterval::new(b.0, b.1));
        ex
    }

    #[test]
    fn test_merge_adjacent() {
        assert_eq!(merged((0, 10), (10, 10)), ExtentInterval::new(0, 20));
        assert_eq!(merged((10, 10), (0, 10)), ExtentInterval::new(0, 20));
    }

    #[test]
    fn test_merge_partial_overlap() {
        assert_eq!(merged((0, 10), (5, 10)), ExtentInterval::new(0, 15));
        assert_eq!(merged((5, 10), (0, 10)), ExtentInterval::new(0, 15));
    }

    #[test]
    fn test_merge_containment() {
        assert_eq!(merged((0, 10), (2, 3)), ExtentInterval::new(0, 10));
        assert_eq!(merged((5, 4), (0, 10)), ExtentInterval::new(0, 10));
        assert_eq!(merged((3, 7), (0, 10)), ExtentInterval::new(0, 10));
    }

    #[test]
    fn test_merge_disjoint_is_noop() {
        assert_eq!(merged((0, 10), (11, 5)), ExtentInterval::new(0, 10));
        assert_eq!(merged((20, 5), (0, 10)), ExtentInterval::new(20, 5));
    }

    #[test]
    fn test_overlaps() {
        let a = ExtentInterval::new(10, 10);
        assert!(a.overlaps(&ExtentInterval::new(20, 1)));
        assert!(a.overlaps(&ExtentInterval::new(0, 10)));
        assert!(a.overlaps(&ExtentInterval::new(12, 2)));
        assert!(!a.overlaps(&ExtentInterval::new(21, 1)));
        assert!(!a.overlaps(&ExtentInterval::new(0, 9)));
    }

    #[test]
    fn test_display() {
        assert_eq!(ExtentInterval::new(6, 58).to_string(), "(6, 58)");
        assert_eq!(ExtentInterval::new(6, 58).end(), 64);
    }
}
