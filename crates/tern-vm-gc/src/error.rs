//! GC errors

use thiserror::Error;

/// Errors reported by the heap
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GcError {
    /// Allocation would exceed the configured heap ceiling
    #[error("Out of memory: requested {requested} bytes with {live} bytes live (limit {limit})")]
    OutOfMemory {
        /// Bytes requested
        requested: usize,
        /// Bytes live at the time of the request
        live: usize,
        /// Configured ceiling
        limit: usize,
    },
}

/// Result type for heap operations
pub type GcResult<T> = std::result::Result<T, GcError>;
