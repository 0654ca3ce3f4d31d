//! # evlog core
//!
//! Storage engine of a segment server.
//!
//! This crate provides:
//! - [`block`]: capacity-bounded, append-only blocks with a seekable
//!   store-time index
//! - [`wal`]: the node-wide write-ahead log with group commit
//! - [`meta`]: the sync and async metadata stores
//! - [`raft`]: replicas keeping a block identical across servers
//! - [`Engine`]: opening, recovering and creating all of the above
//!
//! The network surface lives in `evlog_server`.

#![deny(unsafe_code)]
#![warn(missing_docs)]

pub mod block;
mod checksum;
mod config;
mod engine;
mod error;
pub mod meta;
pub mod raft;
mod types;
pub mod wal;

pub use config::Config;
pub use engine::{Engine, WAL_FILE};
pub use error::{CoreError, CoreResult};
pub use raft::{Host, LeaderCallback, Outbound, RaftMessage, Replica, Resolver};
pub use types::{now_millis, BlockId, LeaderInfo, LogIndex, Peer, SegmentHealthInfo, Term};
