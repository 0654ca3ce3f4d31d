//! Error types for the segment store core.

use crate::types::BlockId;
use std::io;
use thiserror::Error;

/// Result alias for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by blocks, the WAL, metadata stores and replicas.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Storage backend failure.
    #[error("storage error: {0}")]
    Storage(#[from] evlog_storage::StorageError),

    /// Entry could not be decoded.
    #[error("codec error: {0}")]
    Codec(#[from] evlog_codec::CodecError),

    /// I/O failure outside a backend.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// WAL content is invalid.
    #[error("WAL corruption: {message}")]
    WalCorruption {
        /// What was wrong.
        message: String,
    },

    /// Block file content is invalid.
    #[error("block corruption: {message}")]
    BlockCorruption {
        /// What was wrong.
        message: String,
    },

    /// Metadata store content is invalid.
    #[error("metadata corruption: {message}")]
    MetaCorruption {
        /// What was wrong.
        message: String,
    },

    /// Stored checksum does not match the data.
    #[error("checksum mismatch: expected {expected:08x}, got {actual:08x}")]
    ChecksumMismatch {
        /// Stored checksum.
        expected: u32,
        /// Computed checksum.
        actual: u32,
    },

    /// The block is archived or the append would exceed its capacity.
    #[error("block {block} is full")]
    SegmentFull {
        /// The block.
        block: BlockId,
    },

    /// A read started at or past the last entry.
    #[error("offset {seq} is at the end of block {block}")]
    OffsetOnEnd {
        /// The block.
        block: BlockId,
        /// Requested sequence number.
        seq: u64,
    },

    /// No entry satisfies a seek, or a block is unknown.
    #[error("not found: {message}")]
    NotFound {
        /// What was missing.
        message: String,
    },

    /// A block with this id already exists.
    #[error("block {0} already exists")]
    AlreadyExists(BlockId),

    /// Caller passed something unusable.
    #[error("invalid argument: {message}")]
    InvalidArgument {
        /// What was wrong.
        message: String,
    },

    /// Write sent to a replica that is not the leader.
    #[error("replica {block} is not the leader (leader: {leader:?})")]
    NotLeader {
        /// The replica that refused.
        block: BlockId,
        /// The leader it knows of, if any.
        leader: Option<BlockId>,
    },

    /// The replica has no consensus group yet.
    #[error("replica {0} is not bootstrapped")]
    NotBootstrapped(BlockId),

    /// The component was closed.
    #[error("{0} is closed")]
    Closed(&'static str),

    /// A proposal was not committed in time.
    #[error("proposal timed out on {0}")]
    Timeout(BlockId),
}

impl CoreError {
    /// WAL corruption.
    pub fn wal_corruption(message: impl Into<String>) -> Self {
        Self::WalCorruption {
            message: message.into(),
        }
    }

    /// Block file corruption.
    pub fn block_corruption(message: impl Into<String>) -> Self {
        Self::BlockCorruption {
            message: message.into(),
        }
    }

    /// Metadata corruption.
    pub fn meta_corruption(message: impl Into<String>) -> Self {
        Self::MetaCorruption {
            message: message.into(),
        }
    }

    /// Not found.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Invalid argument.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Whether the error comes from the block having no room left.
    #[must_use]
    pub fn is_segment_full(&self) -> bool {
        matches!(self, Self::SegmentFull { .. })
    }
}
