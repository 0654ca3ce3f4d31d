//! Node-wide write-ahead log for raft entries.
//!
//! Every replica on a node appends its raft log entries to the same WAL,
//! tagged with its block id. Raft keeps only `(index, term, offset)` in
//! memory and reads entry bodies back from the WAL when it needs them.
//!
//! ## Record format
//!
//! ```text
//! | magic "EVWL" (4) | version (2) | type (1) | length (4) | payload (N) | crc32 (4) |
//! payload: | block u64 | term u64 | index u64 | command bytes |
//! ```
//!
//! ## Recovery policy
//!
//! - A truncated header or body at the tail is a crash mid-write: replay
//!   stops there and the tail is cut before new appends.
//! - Bad magic, unknown types, future versions and CRC mismatches are
//!   corruption and abort the open.
//!
//! ## Lifetime
//!
//! The WAL is never compacted; records of removed blocks are skipped on
//! replay.
// TODO: segment the WAL file so records below every replica's applied index can be dropped.

mod iterator;
mod record;
mod writer;

pub use iterator::WalIterator;
pub use record::{WalRecord, WalRecordType, WAL_MAGIC, WAL_VERSION};
pub use writer::Wal;
