//! Consensus messages and log commands.

use crate::error::{CoreError, CoreResult};
use crate::types::{BlockId, LogIndex, Term};
use serde::{Deserialize, Serialize};

/// One raft message between two replicas of the same group.
///
/// Replicas are addressed by block id; the transport resolves the id to the
/// server hosting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftMessage {
    /// Sender.
    pub from: BlockId,
    /// Recipient.
    pub to: BlockId,
    /// Sender's current term.
    pub term: Term,
    /// Payload.
    pub body: MessageBody,
}

/// Raft message payloads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageBody {
    /// Candidate asks for a vote.
    RequestVote {
        /// Index of the candidate's last log entry.
        last_index: LogIndex,
        /// Term of the candidate's last log entry.
        last_term: Term,
    },

    /// Vote decision.
    RequestVoteReply {
        /// Whether the vote was granted.
        granted: bool,
    },

    /// Leader replicates entries, or sends a heartbeat when `entries` is
    /// empty.
    AppendEntries {
        /// Index immediately preceding `entries`.
        prev_index: LogIndex,
        /// Term at `prev_index`.
        prev_term: Term,
        /// Entries to store.
        entries: Vec<LogEntry>,
        /// Leader's commit index.
        leader_commit: LogIndex,
    },

    /// Follower's answer to AppendEntries.
    AppendEntriesReply {
        /// Whether the entries were accepted.
        success: bool,
        /// On success, last index known to match the leader.
        match_index: LogIndex,
        /// On failure, where the leader should retry from.
        conflict_index: LogIndex,
    },
}

/// An entry of a replica's raft log.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Term the entry was created in.
    pub term: Term,
    /// Position in the log.
    pub index: LogIndex,
    /// Encoded [`Command`].
    pub command: Vec<u8>,
}

impl std::fmt::Debug for LogEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogEntry")
            .field("term", &self.term)
            .field("index", &self.index)
            .field("command_len", &self.command.len())
            .finish()
    }
}

/// State machine command carried by a log entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Written by a new leader to commit entries of earlier terms.
    Noop,
    /// Append encoded entries to the block.
    Append {
        /// Store time proposed by the leader, in milliseconds.
        stime: i64,
        /// Entries in `evlog_codec` binary form.
        entries: Vec<Vec<u8>>,
    },
}

impl Command {
    /// CBOR bytes of the command.
    ///
    /// # Errors
    ///
    /// Serialization failure.
    pub fn encode(&self) -> CoreResult<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(self, &mut buf)
            .map_err(|e| CoreError::invalid_argument(format!("command encode: {e}")))?;
        Ok(buf)
    }

    /// Parses CBOR bytes.
    ///
    /// # Errors
    ///
    /// [`CoreError::WalCorruption`] if the bytes are not a command.
    pub fn decode(bytes: &[u8]) -> CoreResult<Self> {
        ciborium::from_reader(bytes)
            .map_err(|e| CoreError::wal_corruption(format!("command decode: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_survives_cbor() {
        let cmd = Command::Append {
            stime: 1_700_000_000_000,
            entries: vec![vec![1, 2, 3], vec![]],
        };
        assert_eq!(Command::decode(&cmd.encode().unwrap()).unwrap(), cmd);
    }

    #[test]
    fn garbage_is_corruption() {
        let err = Command::decode(&[0xff, 0x00]).unwrap_err();
        assert!(matches!(err, CoreError::WalCorruption { .. }));
    }
}
