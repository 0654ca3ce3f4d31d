//! A block wrapped in a raft group.

use super::log::RaftLog;
use super::node::{self, Event, NodeParts, RaftStatus};
use crate::block::{Block, SeekKeyFlag, StoredEntry};
use crate::engine::Shared;
use crate::error::{CoreError, CoreResult};
use crate::meta::{keys, BlockMeta};
use crate::types::{now_millis, BlockId, Peer, SegmentHealthInfo};
use evlog_codec::Entry;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

struct Driver {
    inbox: mpsc::Sender<Event>,
    close: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

/// One replica of a block.
///
/// A replica starts detached: reads work, appends fail with
/// [`CoreError::NotBootstrapped`]. [`Replica::bootstrap`] records the peer
/// set and starts the raft driver; from then on the leader accepts
/// appends and every member applies committed entries to its block.
pub struct Replica {
    id: BlockId,
    block: Arc<Block>,
    shared: Arc<Shared>,
    peers: RwLock<Vec<Peer>>,
    log: Mutex<Option<RaftLog>>,
    driver: Mutex<Option<Driver>>,
    status: Arc<RwLock<RaftStatus>>,
}

impl Replica {
    pub(crate) fn new(shared: Arc<Shared>, block: Block, peers: Vec<Peer>, log: RaftLog) -> Self {
        let callback = shared.on_archived.read().clone();
        if let Some(callback) = callback {
            block.set_archived_callback(callback);
        }
        Self {
            id: block.id(),
            block: Arc::new(block),
            shared,
            peers: RwLock::new(peers),
            log: Mutex::new(Some(log)),
            driver: Mutex::new(None),
            status: Arc::new(RwLock::new(RaftStatus::default())),
        }
    }

    /// Block id, which is also the replica id.
    #[must_use]
    pub fn id(&self) -> BlockId {
        self.id
    }

    /// The wrapped block.
    #[must_use]
    pub fn block(&self) -> &Arc<Block> {
        &self.block
    }

    /// Current raft group, empty before bootstrap.
    #[must_use]
    pub fn peers(&self) -> Vec<Peer> {
        self.peers.read().clone()
    }

    /// Whether the raft driver is running.
    #[must_use]
    pub fn is_bootstrapped(&self) -> bool {
        self.driver.lock().is_some()
    }

    /// Role, term and leader as seen by this replica.
    #[must_use]
    pub fn raft_status(&self) -> RaftStatus {
        *self.status.read()
    }

    /// Joins the raft group `peers` and starts the driver.
    ///
    /// Every peer endpoint is registered in the resolver. A single-member
    /// group, or the member with the lowest id, campaigns right away.
    /// Bootstrapping a running replica again is a no-op.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidArgument`] if `peers` does not contain this
    /// replica, or a metadata write error.
    pub fn bootstrap(&self, peers: Vec<Peer>) -> CoreResult<()> {
        if self.is_bootstrapped() {
            debug!(block_id = %self.id, "replica already bootstrapped");
            return Ok(());
        }
        if !peers.iter().any(|p| p.id == self.id) {
            return Err(CoreError::invalid_argument(format!(
                "peer set does not contain replica {}",
                self.id
            )));
        }
        let resolver = self.shared.host.resolver();
        for peer in &peers {
            resolver.register(peer.id, peer.endpoint.clone());
        }

        let meta: Option<BlockMeta> = self.shared.sync_store.get(&keys::block_meta(self.id))?;
        let meta = BlockMeta {
            capacity: self.block.capacity(),
            wal_start: meta.map_or(0, |m| m.wal_start),
            peers: peers.clone(),
        };
        self.shared.sync_store.put(&keys::block_meta(self.id), &meta)?;

        let lowest = peers.iter().map(|p| p.id).min() == Some(self.id);
        *self.peers.write() = peers;
        info!(block_id = %self.id, members = meta.peers.len(), "replica bootstrapped");
        self.start(lowest)
    }

    /// Starts the driver over the persisted peer set.
    pub(crate) fn start(&self, campaign_now: bool) -> CoreResult<()> {
        let mut driver = self.driver.lock();
        if driver.is_some() {
            return Ok(());
        }
        let members: Vec<BlockId> = self.peers.read().iter().map(|p| p.id).collect();
        let log = self.log.lock().take().unwrap_or_default();
        let (inbox, events) = mpsc::channel(self.shared.config.inbox_capacity.max(1));
        let (close, closed) = oneshot::channel();
        let parts = NodeParts {
            id: self.id,
            campaign_now: campaign_now || members.len() == 1,
            members,
            config: self.shared.config.clone(),
            log,
            block: Arc::clone(&self.block),
            wal: Arc::clone(&self.shared.wal),
            store: Arc::clone(&self.shared.sync_store),
            host: Arc::clone(&self.shared.host),
            status: Arc::clone(&self.status),
            on_leader: self.shared.on_leader.read().clone(),
        };
        let handle = node::spawn(parts, events, closed)?;
        self.shared.host.register(self.id, inbox.clone());
        *driver = Some(Driver {
            inbox,
            close,
            handle,
        });
        Ok(())
    }

    /// Replicates `entries` and returns their sequence numbers once a
    /// majority has committed them and they are applied here.
    ///
    /// # Errors
    ///
    /// - [`CoreError::NotBootstrapped`] before bootstrap
    /// - [`CoreError::NotLeader`] on a follower
    /// - [`CoreError::SegmentFull`] once the block is archived
    /// - [`CoreError::Timeout`] if no commit happens in time
    /// - [`CoreError::Closed`] if the replica closes meanwhile
    pub async fn append(&self, entries: Vec<Entry>) -> CoreResult<Vec<u64>> {
        if entries.is_empty() {
            return Ok(Vec::new());
        }
        if self.block.is_archived() {
            return Err(CoreError::SegmentFull { block: self.id });
        }
        let inbox = self
            .driver
            .lock()
            .as_ref()
            .map(|d| d.inbox.clone())
            .ok_or(CoreError::NotBootstrapped(self.id))?;

        let (reply, result) = oneshot::channel();
        let event = Event::Propose {
            stime: now_millis(),
            entries: entries.iter().map(Entry::encode).collect(),
            reply,
        };
        inbox
            .send(event)
            .await
            .map_err(|_| CoreError::Closed("replica"))?;
        match tokio::time::timeout(self.shared.config.proposal_timeout, result).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CoreError::Closed("replica")),
            Err(_) => Err(CoreError::Timeout(self.id)),
        }
    }

    /// Reads up to `num` committed entries from `seq`.
    ///
    /// # Errors
    ///
    /// See [`Block::read`].
    pub fn read(&self, seq: u64, num: usize) -> CoreResult<Vec<StoredEntry>> {
        self.block.read(seq, num)
    }

    /// Seeks the committed store-time index.
    ///
    /// # Errors
    ///
    /// See [`Block::seek`].
    pub fn seek(&self, start: u64, key: &[u8], flag: SeekKeyFlag) -> CoreResult<u64> {
        self.block.seek(start, key, flag)
    }

    /// Health snapshot for the controller.
    #[must_use]
    pub fn status(&self) -> SegmentHealthInfo {
        let stats = self.block.statistics();
        let raft = self.raft_status();
        SegmentHealthInfo {
            id: self.id,
            capacity: stats.capacity,
            size: stats.size,
            event_number: stats.entry_count,
            is_full: stats.archived,
            first_event_time: stats.first_entry_stime,
            last_event_time: stats.last_entry_stime,
            leader: raft.leader,
            term: raft.term,
        }
    }

    /// Marks the block as pending evacuation. The mark is soft state and
    /// reaches disk with the next async-store flush.
    ///
    /// # Errors
    ///
    /// [`CoreError::Closed`] after shutdown started.
    pub fn mark_inactive(&self) -> CoreResult<()> {
        self.shared.async_store.put(&keys::inactive(self.id), &true)
    }

    /// Whether [`Replica::mark_inactive`] was called.
    #[must_use]
    pub fn is_inactive(&self) -> bool {
        matches!(
            self.shared.async_store.get::<bool>(&keys::inactive(self.id)),
            Ok(Some(true))
        )
    }

    /// Stops the driver and syncs the block. Data and metadata stay.
    ///
    /// # Errors
    ///
    /// A storage error from the final sync.
    pub async fn close(&self) -> CoreResult<()> {
        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            self.shared.host.unregister(self.id);
            let _ = driver.close.send(());
            drop(driver.inbox);
            if let Err(e) = driver.handle.await {
                warn!(block_id = %self.id, error = %e, "raft driver ended abnormally");
            }
        }
        self.block.sync()
    }

    /// Closes the replica and erases its block and metadata.
    ///
    /// # Errors
    ///
    /// Storage or metadata errors.
    pub async fn delete(&self) -> CoreResult<()> {
        self.close().await?;
        Block::destroy(self.shared.volume.as_ref(), self.id)?;
        self.shared.sync_store.delete_prefix(&keys::block_scope(self.id))?;
        self.shared.async_store.delete_prefix(&keys::block_scope(self.id))?;
        self.shared.host.resolver().unregister(self.id);
        info!(block_id = %self.id, "replica deleted");
        Ok(())
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("id", &self.id)
            .field("bootstrapped", &self.is_bootstrapped())
            .field("status", &self.raft_status())
            .finish_non_exhaustive()
    }
}
