//! Blocks: the unit of storage and replication.
//!
//! A block is an append-only sequence of entries with a fixed byte capacity.
//! It supports three operations:
//!
//! - `append(entries)` returns gapless sequence numbers, or `SegmentFull`
//!   once the block is archived
//! - `read(seq, num)` returns stored entries, or `OffsetOnEnd` at the tail
//! - `seek(start, key, flag)` binary-searches the store-time key column
//!
//! Archival happens exactly once, on the append that would overflow the
//! capacity, and is announced through an [`ArchivedCallback`].

mod record;
mod seek;
mod store;

pub use seek::{seek, stime_key, SeekKeyFlag};
pub use store::{
    block_file_name, parse_block_file_name, ArchivedCallback, Block, Statistics, StoredEntry,
};
