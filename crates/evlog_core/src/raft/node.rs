//! The raft driver task of one replica.
//!
//! Each bootstrapped replica runs one driver. It owns the raft state and is
//! the only writer of the replica's block, so entries are applied in log
//! order without further locking. Everything reaches the driver through one
//! inbox: consensus messages from the host and proposals from
//! [`Replica::append`](super::Replica::append).

use super::log::RaftLog;
use super::message::{Command, LogEntry, MessageBody, RaftMessage};
use super::transport::Host;
use crate::block::Block;
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::meta::{keys, SyncStore};
use crate::types::{BlockId, LeaderInfo, LogIndex, Term};
use crate::wal::{Wal, WalRecord};
use evlog_codec::Entry;
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, trace, warn};

/// Called whenever the leader or term seen by a replica changes.
pub type LeaderCallback = Arc<dyn Fn(LeaderInfo) + Send + Sync>;

type Completion = oneshot::Sender<CoreResult<Vec<u64>>>;

/// Input of a driver.
pub(crate) enum Event {
    Message(RaftMessage),
    Propose {
        stime: i64,
        entries: Vec<Vec<u8>>,
        reply: Completion,
    },
}

/// Raft role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Follows a leader.
    Follower,
    /// Campaigning.
    Candidate,
    /// Accepts appends.
    Leader,
}

/// What a replica currently believes about its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RaftStatus {
    /// Own role.
    pub role: Role,
    /// Current term.
    pub term: Term,
    /// Known leader.
    pub leader: Option<BlockId>,
}

impl Default for RaftStatus {
    fn default() -> Self {
        Self {
            role: Role::Follower,
            term: 0,
            leader: None,
        }
    }
}

/// Term and vote, persisted in the sync store before any reply depends on
/// them.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct HardState {
    pub term: Term,
    pub vote: Option<BlockId>,
}

/// Everything a driver is started with.
pub(crate) struct NodeParts {
    pub id: BlockId,
    pub members: Vec<BlockId>,
    pub config: Config,
    pub log: RaftLog,
    pub block: Arc<Block>,
    pub wal: Arc<Wal>,
    pub store: Arc<SyncStore>,
    pub host: Arc<Host>,
    pub status: Arc<RwLock<RaftStatus>>,
    pub on_leader: Option<LeaderCallback>,
    pub campaign_now: bool,
}

/// Starts the driver.
///
/// The driver stops when `close` fires or its sender is dropped. Pending
/// proposals then fail with [`CoreError::Closed`].
pub(crate) fn spawn(
    parts: NodeParts,
    inbox: mpsc::Receiver<Event>,
    close: oneshot::Receiver<()>,
) -> CoreResult<JoinHandle<()>> {
    let campaign_now = parts.campaign_now;
    let node = Node::new(parts)?;
    Ok(tokio::spawn(node.run(inbox, close, campaign_now)))
}

struct Node {
    id: BlockId,
    peers: Vec<BlockId>,
    quorum: usize,
    config: Config,
    log: RaftLog,
    block: Arc<Block>,
    wal: Arc<Wal>,
    store: Arc<SyncStore>,
    host: Arc<Host>,
    status: Arc<RwLock<RaftStatus>>,
    on_leader: Option<LeaderCallback>,

    role: Role,
    term: Term,
    vote: Option<BlockId>,
    leader: Option<BlockId>,
    commit: LogIndex,
    applied: LogIndex,
    next_index: HashMap<BlockId, LogIndex>,
    match_index: HashMap<BlockId, LogIndex>,
    votes: HashSet<BlockId>,
    elapsed: u32,
    election_timeout: u32,
    pending: BTreeMap<LogIndex, Completion>,
    reported: (Option<BlockId>, Term),
}

impl Node {
    fn new(parts: NodeParts) -> CoreResult<Self> {
        let hard: HardState = parts
            .store
            .get(&keys::hard_state(parts.id))?
            .unwrap_or_default();
        let applied = parts.block.last_mark();
        if applied > parts.log.last_index() {
            warn!(
                block_id = %parts.id,
                applied,
                last_index = parts.log.last_index(),
                "block is ahead of the raft log"
            );
        }
        let peers: Vec<BlockId> = parts
            .members
            .iter()
            .copied()
            .filter(|m| *m != parts.id)
            .collect();
        let quorum = parts.members.len() / 2 + 1;

        let mut node = Self {
            id: parts.id,
            peers,
            quorum,
            config: parts.config,
            log: parts.log,
            block: parts.block,
            wal: parts.wal,
            store: parts.store,
            host: parts.host,
            status: parts.status,
            on_leader: parts.on_leader,
            role: Role::Follower,
            term: hard.term,
            vote: hard.vote,
            leader: None,
            commit: applied,
            applied,
            next_index: HashMap::new(),
            match_index: HashMap::new(),
            votes: HashSet::new(),
            elapsed: 0,
            election_timeout: 0,
            pending: BTreeMap::new(),
            reported: (None, hard.term),
        };
        node.reset_election_timer();
        Ok(node)
    }

    async fn run(
        mut self,
        mut inbox: mpsc::Receiver<Event>,
        mut close: oneshot::Receiver<()>,
        campaign_now: bool,
    ) {
        info!(
            block_id = %self.id,
            term = self.term,
            members = self.peers.len() + 1,
            applied = self.applied,
            "raft driver started"
        );
        if campaign_now {
            if let Err(e) = self.campaign().await {
                error!(block_id = %self.id, error = %e, "initial election failed");
            }
        }

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            let result = tokio::select! {
                _ = &mut close => break,
                event = inbox.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => break,
                },
                _ = ticker.tick() => self.tick().await,
            };
            if let Err(e) = result {
                if matches!(e, CoreError::Closed(_)) {
                    debug!(block_id = %self.id, error = %e, "raft driver stopping");
                    break;
                }
                error!(block_id = %self.id, error = %e, "raft driver error");
            }
        }

        for (_, reply) in std::mem::take(&mut self.pending) {
            let _ = reply.send(Err(CoreError::Closed("replica")));
        }
        info!(block_id = %self.id, term = self.term, "raft driver stopped");
    }

    async fn handle_event(&mut self, event: Event) -> CoreResult<()> {
        match event {
            Event::Message(message) => self.handle_message(message).await,
            Event::Propose {
                stime,
                entries,
                reply,
            } => self.propose(stime, entries, reply).await,
        }
    }

    async fn tick(&mut self) -> CoreResult<()> {
        self.elapsed += 1;
        if self.role == Role::Leader {
            if self.elapsed >= self.config.heartbeat_ticks.max(1) {
                self.elapsed = 0;
                self.broadcast_append()?;
            }
        } else if self.elapsed >= self.election_timeout {
            self.campaign().await?;
        }
        Ok(())
    }

    fn reset_election_timer(&mut self) {
        let base = self.config.election_ticks.max(1);
        self.elapsed = 0;
        self.election_timeout = rand::thread_rng().gen_range(base..base * 2);
    }

    fn persist_hard_state(&self) -> CoreResult<()> {
        self.store.put(
            &keys::hard_state(self.id),
            &HardState {
                term: self.term,
                vote: self.vote,
            },
        )
    }

    /// Mirrors role, term and leader into the shared status and reports
    /// leadership changes.
    fn publish(&mut self) {
        *self.status.write() = RaftStatus {
            role: self.role,
            term: self.term,
            leader: self.leader,
        };
        if self.reported != (self.leader, self.term) {
            self.reported = (self.leader, self.term);
            if let Some(callback) = &self.on_leader {
                callback(LeaderInfo {
                    block: self.id,
                    leader: self.leader,
                    term: self.term,
                });
            }
        }
    }

    fn send(&self, to: BlockId, body: MessageBody) {
        self.host.send(RaftMessage {
            from: self.id,
            to,
            term: self.term,
            body,
        });
    }

    async fn campaign(&mut self) -> CoreResult<()> {
        self.role = Role::Candidate;
        self.term += 1;
        self.vote = Some(self.id);
        self.leader = None;
        self.votes = HashSet::from([self.id]);
        self.reset_election_timer();
        self.persist_hard_state()?;
        self.publish();
        info!(block_id = %self.id, term = self.term, "starting election");

        if self.votes.len() >= self.quorum {
            return self.become_leader().await;
        }
        let last_index = self.log.last_index();
        let last_term = self.log.last_term();
        for peer in self.peers.clone() {
            self.send(
                peer,
                MessageBody::RequestVote {
                    last_index,
                    last_term,
                },
            );
        }
        Ok(())
    }

    async fn become_leader(&mut self) -> CoreResult<()> {
        self.role = Role::Leader;
        self.leader = Some(self.id);
        self.elapsed = 0;
        let next = self.log.last_index() + 1;
        for peer in &self.peers {
            self.next_index.insert(*peer, next);
            self.match_index.insert(*peer, 0);
        }
        info!(block_id = %self.id, term = self.term, "elected leader");
        self.publish();

        // Entries of earlier terms only commit once an entry of this term does.
        let noop = Command::Noop.encode()?;
        self.append_local(noop).await?;
        self.broadcast_append()?;
        self.advance_commit()
    }

    /// Steps down to follower of `leader`, adopting `term` if it is newer.
    fn become_follower(&mut self, term: Term, leader: Option<BlockId>) -> CoreResult<()> {
        let was_leader = self.role == Role::Leader;
        if term > self.term {
            self.term = term;
            self.vote = None;
            self.persist_hard_state()?;
        }
        self.role = Role::Follower;
        self.leader = leader;
        if was_leader {
            info!(block_id = %self.id, term = self.term, "stepped down");
            for (_, reply) in std::mem::take(&mut self.pending) {
                let _ = reply.send(Err(CoreError::NotLeader {
                    block: self.id,
                    leader,
                }));
            }
        }
        self.publish();
        Ok(())
    }

    async fn propose(&mut self, stime: i64, entries: Vec<Vec<u8>>, reply: Completion) -> CoreResult<()> {
        if self.role != Role::Leader {
            let _ = reply.send(Err(CoreError::NotLeader {
                block: self.id,
                leader: self.leader,
            }));
            return Ok(());
        }
        let command = match (Command::Append { stime, entries }).encode() {
            Ok(command) => command,
            Err(e) => {
                let _ = reply.send(Err(e));
                return Ok(());
            }
        };
        let index = match self.append_local(command).await {
            Ok(index) => index,
            Err(e) => {
                let closed = matches!(e, CoreError::Closed(_));
                let _ = reply.send(Err(e));
                return if closed { Err(CoreError::Closed("WAL")) } else { Ok(()) };
            }
        };
        self.pending.insert(index, reply);
        self.broadcast_append()?;
        self.advance_commit()
    }

    /// Writes a new entry of the current term to the WAL and the log.
    async fn append_local(&mut self, command: Vec<u8>) -> CoreResult<LogIndex> {
        let index = self.log.last_index() + 1;
        self.write_entries(vec![LogEntry {
            term: self.term,
            index,
            command,
        }])
        .await?;
        Ok(index)
    }

    async fn write_entries(&mut self, entries: Vec<LogEntry>) -> CoreResult<()> {
        let positions: Vec<(LogIndex, Term)> = entries.iter().map(|e| (e.index, e.term)).collect();
        let records = entries
            .into_iter()
            .map(|e| WalRecord {
                block: self.id,
                term: e.term,
                index: e.index,
                data: e.command,
            })
            .collect();
        let offsets = self.wal.append(records).await?;
        for ((index, term), offset) in positions.into_iter().zip(offsets) {
            self.log.put(index, term, offset)?;
        }
        Ok(())
    }

    fn broadcast_append(&self) -> CoreResult<()> {
        for peer in &self.peers {
            self.send_append(*peer)?;
        }
        Ok(())
    }

    fn send_append(&self, peer: BlockId) -> CoreResult<()> {
        let next = self
            .next_index
            .get(&peer)
            .copied()
            .unwrap_or(self.log.last_index() + 1)
            .max(1);
        let prev_index = next - 1;
        let prev_term = self.log.term_at(prev_index).unwrap_or(0);
        let entries = self
            .log
            .entries(&self.wal, self.id, next, self.config.max_entries_per_message)?;
        self.send(
            peer,
            MessageBody::AppendEntries {
                prev_index,
                prev_term,
                entries,
                leader_commit: self.commit,
            },
        );
        Ok(())
    }

    /// Commits the highest current-term index stored on a majority.
    fn advance_commit(&mut self) -> CoreResult<()> {
        if self.role != Role::Leader {
            return Ok(());
        }
        let mut n = self.log.last_index();
        while n > self.commit && self.log.term_at(n) == Some(self.term) {
            let acks = 1 + self.match_index.values().filter(|m| **m >= n).count();
            if acks >= self.quorum {
                trace!(block_id = %self.id, commit = n, "commit advanced");
                self.commit = n;
                break;
            }
            n -= 1;
        }
        self.apply_committed()
    }

    fn apply_committed(&mut self) -> CoreResult<()> {
        while self.applied < self.commit {
            let index = self.applied + 1;
            let entry = self.log.entry(&self.wal, self.id, index)?;
            let result = match Command::decode(&entry.command)? {
                Command::Noop => Ok(Vec::new()),
                Command::Append { stime, entries } => self.apply_append(index, stime, &entries),
            };
            if let Err(e) = &result {
                if !e.is_segment_full() {
                    error!(block_id = %self.id, index, error = %e, "apply failed");
                }
            }
            self.applied = index;
            if let Some(reply) = self.pending.remove(&index) {
                let _ = reply.send(result);
            }
        }
        Ok(())
    }

    fn apply_append(&self, index: LogIndex, stime: i64, raw: &[Vec<u8>]) -> CoreResult<Vec<u64>> {
        let entries = raw
            .iter()
            .map(|bytes| Entry::decode(bytes))
            .collect::<Result<Vec<_>, _>>()?;
        self.block.apply(index, stime, &entries)
    }

    async fn handle_message(&mut self, message: RaftMessage) -> CoreResult<()> {
        let RaftMessage {
            from, term, body, ..
        } = message;
        if !self.peers.contains(&from) {
            debug!(block_id = %self.id, from = %from, "message from non-member dropped");
            return Ok(());
        }
        if term > self.term {
            let leader = matches!(body, MessageBody::AppendEntries { .. }).then_some(from);
            self.become_follower(term, leader)?;
        }

        match body {
            MessageBody::RequestVote {
                last_index,
                last_term,
            } => self.on_request_vote(from, term, last_index, last_term),
            MessageBody::RequestVoteReply { granted } => {
                if self.role == Role::Candidate && term == self.term && granted {
                    self.votes.insert(from);
                    if self.votes.len() >= self.quorum {
                        return self.become_leader().await;
                    }
                }
                Ok(())
            }
            MessageBody::AppendEntries {
                prev_index,
                prev_term,
                entries,
                leader_commit,
            } => {
                self.on_append_entries(from, term, prev_index, prev_term, entries, leader_commit)
                    .await
            }
            MessageBody::AppendEntriesReply {
                success,
                match_index,
                conflict_index,
            } => self.on_append_reply(from, term, success, match_index, conflict_index),
        }
    }

    fn on_request_vote(
        &mut self,
        from: BlockId,
        term: Term,
        last_index: LogIndex,
        last_term: Term,
    ) -> CoreResult<()> {
        let up_to_date = last_term > self.log.last_term()
            || (last_term == self.log.last_term() && last_index >= self.log.last_index());
        let granted = term == self.term && self.vote.map_or(true, |v| v == from) && up_to_date;
        if granted {
            if self.vote.is_none() {
                self.vote = Some(from);
                self.persist_hard_state()?;
            }
            self.reset_election_timer();
        }
        debug!(block_id = %self.id, candidate = %from, term, granted, "vote requested");
        self.send(from, MessageBody::RequestVoteReply { granted });
        Ok(())
    }

    async fn on_append_entries(
        &mut self,
        from: BlockId,
        term: Term,
        prev_index: LogIndex,
        prev_term: Term,
        entries: Vec<LogEntry>,
        leader_commit: LogIndex,
    ) -> CoreResult<()> {
        let reject = |conflict_index| MessageBody::AppendEntriesReply {
            success: false,
            match_index: 0,
            conflict_index,
        };
        if term < self.term {
            self.send(from, reject(0));
            return Ok(());
        }
        if self.role != Role::Follower || self.leader != Some(from) {
            self.become_follower(term, Some(from))?;
        }
        self.reset_election_timer();

        if prev_index > self.log.last_index() {
            self.send(from, reject(self.log.last_index() + 1));
            return Ok(());
        }
        if self.log.term_at(prev_index) != Some(prev_term) {
            self.send(from, reject(self.log.first_index_of_term_at(prev_index)));
            return Ok(());
        }

        let last_new = prev_index + entries.len() as LogIndex;
        let fresh: Vec<LogEntry> = entries
            .into_iter()
            .skip_while(|e| self.log.term_at(e.index) == Some(e.term))
            .collect();
        if let Some(first) = fresh.first() {
            if first.index <= self.commit {
                return Err(CoreError::wal_corruption(format!(
                    "leader {from} rewrites committed index {} of {}",
                    first.index, self.id
                )));
            }
            self.log.truncate_from(first.index);
            self.write_entries(fresh).await?;
        }

        let target = leader_commit.min(last_new);
        if target > self.commit {
            self.commit = target;
        }
        self.apply_committed()?;
        self.send(
            from,
            MessageBody::AppendEntriesReply {
                success: true,
                match_index: last_new,
                conflict_index: 0,
            },
        );
        Ok(())
    }

    fn on_append_reply(
        &mut self,
        from: BlockId,
        term: Term,
        success: bool,
        match_index: LogIndex,
        conflict_index: LogIndex,
    ) -> CoreResult<()> {
        if self.role != Role::Leader || term != self.term {
            return Ok(());
        }
        if success {
            let matched = self.match_index.entry(from).or_insert(0);
            *matched = (*matched).max(match_index);
            let matched = *matched;
            self.next_index.insert(from, matched + 1);
            self.advance_commit()?;
            if matched < self.log.last_index() {
                self.send_append(from)?;
            }
        } else {
            let next = self.next_index.get(&from).copied().unwrap_or(1);
            let retry = conflict_index.max(1).min(next.saturating_sub(1).max(1));
            trace!(block_id = %self.id, peer = %from, retry, "append rejected, backing off");
            self.next_index.insert(from, retry);
            self.send_append(from)?;
        }
        Ok(())
    }
}
