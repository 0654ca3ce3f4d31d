//! Codec errors.

use thiserror::Error;

/// Result alias for codec operations.
pub type CodecResult<T> = Result<T, CodecError>;

/// Failures decoding a binary entry.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodecError {
    /// Input ended before a complete field was read.
    #[error("unexpected end of input: needed {needed} bytes, {remaining} remaining")]
    UnexpectedEof {
        /// Bytes the decoder wanted.
        needed: usize,
        /// Bytes left in the input.
        remaining: usize,
    },

    /// The entry header names a format version this build cannot read.
    #[error("unsupported entry version: {0}")]
    UnsupportedVersion(u8),

    /// Slot number outside [`crate::Ordinal`].
    #[error("unknown ordinal: {0}")]
    UnknownOrdinal(u8),

    /// Value tag outside [`crate::Value`].
    #[error("unknown value tag {tag} for ordinal {ordinal}")]
    UnknownValueTag {
        /// Slot being decoded.
        ordinal: u8,
        /// Offending tag.
        tag: u8,
    },

    /// A text field is not UTF-8.
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),

    /// A timestamp field is out of range.
    #[error("invalid timestamp: {secs}s {nanos}ns")]
    InvalidTimestamp {
        /// Seconds since the Unix epoch.
        secs: i64,
        /// Sub-second nanoseconds.
        nanos: u32,
    },

    /// Bytes left over after the last field.
    #[error("{0} trailing bytes after entry")]
    TrailingBytes(usize),
}
