//! Heap configuration
//!
//! A [`HeapConfig`] describes the geometry of a hybrid heap stack. It can be
//! built in code or read from TOML:
//!
//! ```toml
//! region_size = 4194304
//! block_log2size = 12
//! slab_size = 65536
//! big_size = 8193
//! ```
//!
//! Missing keys take their default.

use crate::error::{Error, Result};
use crate::extent::HeapLayout;
use crate::slab::size_class;
use crate::slab::slab::max_nblocks;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

/// Geometry of a hybrid heap
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeapConfig {
    /// Bytes of the region the extent heap manages
    pub region_size: usize,
    /// log2 of the extent heap block size
    pub block_log2size: u32,
    /// Bytes per slab, a multiple of the block size
    pub slab_size: usize,
    /// Requests of at least this many bytes bypass the slab heap
    pub big_size: usize,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            region_size: 4 * 1024 * 1024,
            block_log2size: 12,
            slab_size: 64 * 1024,
            big_size: 8 * 1024 + 1,
        }
    }
}

impl HeapConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| Error::Config(format!("Failed to parse heap config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and validate a TOML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Failed to read heap config {:?}: {}", path, e))
        })?;
        debug!(path = ?path, "Loaded heap config");
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string(self)
            .map_err(|e| Error::Config(format!("Failed to serialize heap config: {}", e)))
    }

    pub fn block_size(&self) -> usize {
        1 << self.block_log2size
    }

    /// Check that the geometry describes a working heap stack
    pub fn validate(&self) -> Result<()> {
        let layout = HeapLayout::compute(self.region_size, self.block_log2size)
            .map_err(|e| Error::Config(e.to_string()))?;

        if self.slab_size == 0 || self.slab_size % self.block_size() != 0 {
            return Err(Error::Config(format!(
                "slab_size {} must be a non-zero multiple of the {}-byte block",
                self.slab_size,
                self.block_size()
            )));
        }
        if self.slab_size > layout.nblocks * self.block_size() {
            return Err(Error::Config(format!(
                "slab_size {} exceeds the {} bytes of blocks in the region",
                self.slab_size,
                layout.nblocks * self.block_size()
            )));
        }
        if self.big_size == 0 {
            return Err(Error::Config("big_size must be non-zero".to_string()));
        }

        // Everything below big_size is routed to the slab heap, so the
        // largest such request must have a class that fits in a slab and
        // whose block size stays below big_size.
        if self.big_size > 1 {
            let largest = self.big_size - 1;
            let block_size = size_class::size_class(largest)
                .and_then(size_class::size_from_class)
                .ok_or_else(|| {
                    Error::Config(format!(
                        "big_size {} exceeds the largest slab size class",
                        self.big_size
                    ))
                })?;
            if block_size >= self.big_size {
                return Err(Error::Config(format!(
                    "requests of {} bytes land in the {}-byte class, not below big_size {}",
                    largest, block_size, self.big_size
                )));
            }
            if max_nblocks(self.slab_size, block_size) == 0 {
                return Err(Error::Config(format!(
                    "a {}-byte slab cannot hold a {}-byte block for requests below big_size {}",
                    self.slab_size, block_size, self.big_size
                )));
            }
        }
        Ok(())
    }
}
