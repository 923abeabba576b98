// pmheap - Persistent Memory Heap
// Multi-tier allocator over a mapped region: extent heap, slab heap, hybrid heap

#![warn(rust_2018_idioms)]

pub mod config;
pub mod extent;
pub mod heap;
pub mod hybrid;
pub mod region;
pub mod slab;

// Re-exports for convenience
pub use config::HeapConfig;
pub use extent::{ExtentHeap, ExtentInterval, ExtentMap, FreeSpaceMap};
pub use heap::Heap;
pub use hybrid::HybridHeap;
pub use region::{RPtr, Region};
pub use slab::{Slab, SlabHeap};

/// Allocator error types
pub mod error {
    use crate::region::RPtr;
    use thiserror::Error;

    /// Closed set of result codes reported by every heap
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum ErrorCode {
        Ok,
        OutOfMemory,
        InvalidAddress,
        InvalidParameter,
    }

    #[derive(Error, Debug, Clone, PartialEq, Eq)]
    pub enum Error {
        #[error("Out of memory: {0}")]
        OutOfMemory(String),

        #[error("Invalid address: {0}")]
        InvalidAddress(RPtr),

        #[error("Invalid parameter: {0}")]
        InvalidParameter(String),

        #[error("Configuration error: {0}")]
        Config(String),
    }

    impl Error {
        /// Result code of this error
        pub fn code(&self) -> ErrorCode {
            match self {
                Error::OutOfMemory(_) => ErrorCode::OutOfMemory,
                Error::InvalidAddress(_) => ErrorCode::InvalidAddress,
                Error::InvalidParameter(_) | Error::Config(_) => ErrorCode::InvalidParameter,
            }
        }
    }

    /// Result code of an allocator call
    pub fn code_of<T>(result: &Result<T>) -> ErrorCode {
        match result {
            Ok(_) => ErrorCode::Ok,
            Err(e) => e.code(),
        }
    }

    pub type Result<T> = std::result::Result<T, Error>;
}

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[cfg(test)]
mod tests {
    use super::error::{code_of, Error, ErrorCode, Result};
    use super::*;

    #[test]
    fn test_version_format() {
        assert!(VERSION.split('.').count() >= 3);
    }

    #[test]
    fn test_error_codes() {
        let ok: Result<()> = Ok(());
        assert_eq!(code_of(&ok), ErrorCode::Ok);
        assert_eq!(
            Error::OutOfMemory("full".into()).code(),
            ErrorCode::OutOfMemory
        );
        assert_eq!(
            Error::InvalidAddress(RPtr::new(8)).code(),
            ErrorCode::InvalidAddress
        );
        assert_eq!(Error::Config("bad".into()).code(), ErrorCode::InvalidParameter);
        assert_eq!(
            Error::InvalidAddress(RPtr::new(16)).to_string(),
            "Invalid address: RPtr(0x10)"
        );
    }
}
