//! Identifiers and small value types shared across the core.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

/// Raft term.
pub type Term = u64;

/// Raft log index. Index 0 means "nothing".
pub type LogIndex = u64;

/// Identifier of a block, and of the replica wrapping it.
///
/// Ids are assigned by the controller and are unique across the cluster.
/// Zero is never a valid id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BlockId(u64);

impl BlockId {
    /// Wraps a raw id.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Raw id.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// Whether this is the reserved zero id.
    #[must_use]
    pub const fn is_zero(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for BlockId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

/// One member of a replica group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Peer {
    /// Block id of the member.
    pub id: BlockId,
    /// Address of the server hosting it.
    pub endpoint: String,
}

impl Peer {
    /// Creates a peer.
    pub fn new(id: BlockId, endpoint: impl Into<String>) -> Self {
        Self {
            id,
            endpoint: endpoint.into(),
        }
    }
}

/// Leadership observed by a replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeaderInfo {
    /// Replica reporting the change.
    pub block: BlockId,
    /// Current leader, if one is known.
    pub leader: Option<BlockId>,
    /// Term of the observation.
    pub term: Term,
}

/// Point-in-time health of one replica, as reported to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentHealthInfo {
    /// Block id.
    pub id: BlockId,
    /// Capacity in bytes.
    pub capacity: u64,
    /// Bytes used.
    pub size: u64,
    /// Number of entries.
    pub event_number: u64,
    /// Whether the block is archived.
    pub is_full: bool,
    /// Store time of the first entry, in milliseconds.
    pub first_event_time: Option<i64>,
    /// Store time of the last entry, in milliseconds.
    pub last_event_time: Option<i64>,
    /// Leader known to this replica.
    pub leader: Option<BlockId>,
    /// Term known to this replica.
    pub term: Term,
}

/// Milliseconds since the Unix epoch.
#[must_use]
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| i64::try_from(d.as_millis()).unwrap_or(i64::MAX))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_id_basics() {
        let id = BlockId::new(1001);
        assert_eq!(id.as_u64(), 1001);
        assert_eq!(id.to_string(), "1001");
        assert!(BlockId::new(0).is_zero());
        assert!(BlockId::new(1) < BlockId::new(2));
    }

    #[test]
    fn clock_is_past_2020() {
        assert!(now_millis() > 1_577_836_800_000);
    }
}
