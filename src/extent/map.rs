//! Coalescing set of disjoint block intervals
//!
//! The map is indexed twice: by start block, which drives coalescing on
//! insert, and by `(len, start)`, which answers best-fit queries. The two
//! indices always describe the same set of intervals, and no two stored
//! intervals overlap or touch.

use super::interval::ExtentInterval;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::trace;

#[derive(Debug, Clone, Default)]
pub struct ExtentMap {
    by_start: BTreeMap<usize, ExtentInterval>,
    by_len: BTreeSet<(usize, usize)>,
}

impl ExtentMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an interval, coalescing it with every overlapping or adjacent one
    pub fn insert(&mut self, interval: ExtentInterval) {
        if interval.is_empty() {
            return;
        }
        let mut merged = interval;

        let prev = self
            .by_start
            .range(..=interval.start())
            .next_back()
            .map(|(_, iv)| *iv);
        if let Some(prev) = prev {
            if prev.overlaps(&merged) {
                self.unlink(&prev);
                merged.merge(&prev);
            }
        }

        loop {
            let next = self.by_start.range(merged.start()..).next().map(|(_, iv)| *iv);
            match next {
                Some(next) if merged.overlaps(&next) => {
                    self.unlink(&next);
                    merged.merge(&next);
                }
                _ => break,
            }
        }

        trace!("Inserted {} as {}", interval, merged);
        self.link(merged);
        debug_assert!(self.is_consistent());
    }

    /// Smallest interval of at least `len` blocks, lowest start on ties
    pub fn find_ge(&self, len: usize) -> Option<ExtentInterval> {
        if len == 0 {
            return None;
        }
        self.by_len
            .range((len, 0)..)
            .next()
            .map(|&(len, start)| ExtentInterval::new(start, len))
    }

    /// Like [`ExtentMap::find_ge`], and removes the interval it finds
    pub fn remove_ge(&mut self, len: usize) -> Option<ExtentInterval> {
        let found = self.find_ge(len)?;
        self.unlink(&found);
        debug_assert!(self.is_consistent());
        Some(found)
    }

    /// Longest interval in the map
    pub fn largest(&self) -> Option<ExtentInterval> {
        self.by_len
            .iter()
            .next_back()
            .map(|&(len, start)| ExtentInterval::new(start, len))
    }

    /// Intervals in start order
    pub fn iter(&self) -> impl Iterator<Item = ExtentInterval> + '_ {
        self.by_start.values().copied()
    }

    /// Intervals in `(len, start)` order
    pub fn iter_by_len(&self) -> impl Iterator<Item = ExtentInterval> + '_ {
        self.by_len
            .iter()
            .map(|&(len, start)| ExtentInterval::new(start, len))
    }

    /// Number of intervals
    pub fn len(&self) -> usize {
        self.by_start.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_start.is_empty()
    }

    /// Total number of blocks covered
    pub fn total_len(&self) -> usize {
        self.by_start.values().map(|iv| iv.len()).sum()
    }

    /// Both indices agree and stored intervals are pairwise separated
    pub fn is_consistent(&self) -> bool {
        if self.by_start.len() != self.by_len.len() {
            return false;
        }
        let indexed = self.by_len.iter().all(|&(len, start)| {
            self.by_start
                .get(&start)
                .map_or(false, |iv| iv.start() == start && iv.len() == len)
        });
        let separated = self
            .by_start
            .values()
            .zip(self.by_start.values().skip(1))
            .all(|(a, b)| a.end() < b.start());
        indexed && separated
    }

    fn link(&mut self, interval: ExtentInterval) {
        self.by_start.insert(interval.start(), interval);
        self.by_len.insert((interval.len(), interval.start()));
    }

    fn unlink(&mut self, interval: &ExtentInterval) {
        self.by_start.remove(&interval.start());
        let removed = self.by_len.remove(&(interval.len(), interval.start()));
        debug_assert!(removed, "{} missing from length index", interval);
    }
}

impl PartialEq for ExtentMap {
    fn eq(&self, other: &Self) -> bool {
        self.by_start == other.by_start
    }
}

impl Eq for ExtentMap {}

impl FromIterator<ExtentInterval> for ExtentMap {
    fn from_iter<I: IntoIterator<Item = ExtentInterval>>(iter: I) -> Self {
        let mut map = ExtentMap::new();
        for interval in iter {
            map.insert(interval);
        }
        map
    }
}

impl fmt::Display for ExtentMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for interval in self.iter() {
            writeln!(f, "{}", interval)?;
        }
        Ok(())
    }
}
