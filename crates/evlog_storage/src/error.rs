//! Storage error types.

use std::io;
use thiserror::Error;

/// Result alias for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Failures raised by backends and volumes.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Underlying I/O failure.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A read reached past the last appended byte.
    #[error("read past end: offset {offset}, len {len}, size {size}")]
    ReadPastEnd {
        /// Requested offset.
        offset: u64,
        /// Requested length.
        len: usize,
        /// Backend size at the time of the read.
        size: u64,
    },

    /// Truncation target lies beyond the current size.
    #[error("cannot truncate to {requested}, current size is {size}")]
    InvalidTruncate {
        /// Requested new size.
        requested: u64,
        /// Current size.
        size: u64,
    },

    /// A backend name is not usable inside a volume.
    #[error("invalid backend name: {0:?}")]
    InvalidName(String),

    /// The volume directory is held by another process.
    #[error("volume is locked by another process: {0}")]
    Locked(String),
}
