//! Volatile index of free blocks

use super::interval::ExtentInterval;
use super::map::ExtentMap;
use crate::error::{Error, Result};
use std::fmt;

/// Free block runs of an extent heap, served best fit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FreeSpaceMap {
    map: ExtentMap,
}

impl FreeSpaceMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a run of at least `nblocks` blocks is free
    pub fn exists_extent(&self, nblocks: usize) -> bool {
        self.map.find_ge(nblocks).is_some()
    }

    /// Carve `nblocks` blocks out of the best-fitting free run
    ///
    /// The head of the run is handed out; any tail goes back to the map.
    pub fn alloc_extent(&mut self, nblocks: usize) -> Result<ExtentInterval> {
        if nblocks == 0 {
            return Err(Error::InvalidParameter(
                "cannot allocate an extent of 0 blocks".to_string(),
            ));
        }
        let found = self.map.remove_ge(nblocks).ok_or_else(|| {
            Error::OutOfMemory(format!("no free extent of {} blocks", nblocks))
        })?;
        if found.len() > nblocks {
            self.map.insert(ExtentInterval::new(
                found.start() + nblocks,
                found.len() - nblocks,
            ));
        }
        Ok(ExtentInterval::new(found.start(), nblocks))
    }

    /// Return a run of blocks, coalescing with its free neighbours
    pub fn free_extent(&mut self, interval: ExtentInterval) {
        self.map.insert(interval);
    }

    /// Total number of free blocks
    pub fn free_blocks(&self) -> usize {
        self.map.total_len()
    }

    /// Longest free run
    pub fn largest(&self) -> Option<ExtentInterval> {
        self.map.largest()
    }

    pub fn map(&self) -> &ExtentMap {
        &self.map
    }
}

impl PartialEq<ExtentMap> for FreeSpaceMap {
    fn eq(&self, other: &ExtentMap) -> bool {
        self.map == *other
    }
}

impl fmt::Display for FreeSpaceMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.map, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    fn expect(intervals: &[(usize, usize)]) -> ExtentMap {
        intervals
            .iter()
            .map(|&(start, len)| ExtentInterval::new(start, len))
            .collect()
    }

    #[test]
    fn test_alloc_extent() -> Result<()> {
        let mut fsmap = FreeSpaceMap::new();
        fsmap.free_extent(ExtentInterval::new(0, 64));

        let e1 = fsmap.alloc_extent(1)?;
        let e2 = fsmap.alloc_extent(2)?;
        let e3 = fsmap.alloc_extent(3)?;
        assert_eq!(e1, ExtentInterval::new(0, 1));
        assert_eq!(e2, ExtentInterval::new(1, 2));
        assert_eq!(e3, ExtentInterval::new(3, 3));
        assert_eq!(fsmap, expect(&[(6, 58)]));

        fsmap.free_extent(e1);
        assert_eq!(fsmap, expect(&[(0, 1), (6, 58)]));

        let e4 = fsmap.alloc_extent(4)?;
        assert_eq!(e4, ExtentInterval::new(6, 4));
        assert_eq!(fsmap, expect(&[(0, 1), (10, 54)]));

        let e5 = fsmap.alloc_extent(1)?;
        assert_eq!(e5, ExtentInterval::new(0, 1));
        assert_eq!(fsmap, expect(&[(10, 54)]));
        Ok(())
    }

    #[test]
    fn test_alloc_extent_exhaustion() -> Result<()> {
        let mut fsmap = FreeSpaceMap::new();
        fsmap.free_extent(ExtentInterval::new(0, 64));

        fsmap.alloc_extent(62)?;
        let err = fsmap.alloc_extent(3).unwrap_err();
        assert_eq!(err.code(), ErrorCode::OutOfMemory);
        assert_eq!(fsmap.alloc_extent(2)?, ExtentInterval::new(62, 2));
        assert!(!fsmap.exists_extent(1));
        Ok(())
    }

    #[test]
    fn test_alloc_then_free_restores_map() -> Result<()> {
        let mut fsmap = FreeSpaceMap::new();
        fsmap.free_extent(ExtentInterval::new(0, 10));
        fsmap.free_extent(ExtentInterval::new(20, 30));
        let before = fsmap.clone();

        let extent = fsmap.alloc_extent(12)?;
        assert_eq!(extent, ExtentInterval::new(20, 12));
        fsmap.free_extent(extent);
        assert_eq!(fsmap, before);
        Ok(())
    }

    #[test]
    fn test_zero_blocks_rejected() {
        let mut fsmap = FreeSpaceMap::new();
        fsmap.free_extent(ExtentInterval::new(0, 8));
        assert_eq!(
            fsmap.alloc_extent(0).unwrap_err().code(),
            ErrorCode::InvalidParameter
        );
        assert_eq!(fsmap.free_blocks(), 8);
        assert_eq!(fsmap.largest(), Some(ExtentInterval::new(0, 8)));
    }
}
