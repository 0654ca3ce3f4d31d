//! Raft replication of blocks.
//!
//! Every block is wrapped by a [`Replica`]. Replicas of the same block on
//! different servers form a raft group whose members are addressed by
//! block id. Each member's raft log lives in the node-wide WAL; committed
//! entries are applied to the block in log order, so every member ends up
//! with the same entries at the same sequence numbers and store times.
//!
//! - election with randomized timeouts, counted in driver ticks
//! - log replication with a consistency check and conflict back-off
//! - a new leader commits a no-op before anything of earlier terms
//! - term and vote are in the sync store before any vote is answered
//! - on restart the driver resumes after the block's last applied index

mod log;
mod message;
mod node;
mod replica;
mod transport;

pub use self::log::RaftLog;
pub use message::{Command, LogEntry, MessageBody, RaftMessage};
pub use node::{LeaderCallback, RaftStatus, Role};
pub use replica::Replica;
pub use transport::{Host, Outbound, Resolver};
