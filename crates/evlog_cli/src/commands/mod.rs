//! CLI command implementations.

pub mod dump_wal;
pub mod inspect;
pub mod serve;
