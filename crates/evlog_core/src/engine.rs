//! Node-level storage engine: the volume, the shared WAL, both metadata
//! stores and the replicas built on them.

use crate::block::{block_file_name, parse_block_file_name, ArchivedCallback, Block};
use crate::config::Config;
use crate::error::{CoreError, CoreResult};
use crate::meta::{keys, AsyncStore, BlockMeta, SyncStore, ASYNC_STORE_FILE, SYNC_STORE_FILE};
use crate::raft::{Host, LeaderCallback, RaftLog, Replica};
use crate::types::BlockId;
use crate::wal::Wal;
use evlog_storage::Volume;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Backend name of the WAL.
pub const WAL_FILE: &str = "raft.wal";

/// State shared by the engine and every replica.
pub(crate) struct Shared {
    pub config: Config,
    pub volume: Arc<dyn Volume>,
    pub wal: Arc<Wal>,
    pub sync_store: Arc<SyncStore>,
    pub async_store: Arc<AsyncStore>,
    pub host: Arc<Host>,
    pub on_leader: RwLock<Option<LeaderCallback>>,
    pub on_archived: RwLock<Option<ArchivedCallback>>,
}

/// Storage engine of one segment server.
///
/// Opening replays the WAL into per-block raft logs; [`Engine::recover`]
/// then reopens every block listed in the sync store and restarts the
/// drivers of activated ones.
pub struct Engine {
    shared: Arc<Shared>,
    recovered: Mutex<HashMap<BlockId, RaftLog>>,
}

impl Engine {
    /// Opens the stores and replays the WAL.
    ///
    /// # Errors
    ///
    /// Storage errors or corruption in the WAL or the metadata stores.
    pub fn open(volume: Arc<dyn Volume>, host: Arc<Host>, config: Config) -> CoreResult<Self> {
        let sync_store = Arc::new(SyncStore::open(volume.open(SYNC_STORE_FILE)?)?);
        let async_store = Arc::new(AsyncStore::open(volume.open(ASYNC_STORE_FILE)?)?);
        let metas = load_metas(&sync_store)?;

        let mut logs: HashMap<BlockId, RaftLog> = HashMap::new();
        let mut skipped = 0usize;
        let wal = Wal::open(volume.open(WAL_FILE)?, config.wal_sync, |offset, record| {
            match metas.get(&record.block) {
                Some(meta) if offset >= meta.wal_start => logs
                    .entry(record.block)
                    .or_default()
                    .put(record.index, record.term, offset),
                _ => {
                    skipped += 1;
                    Ok(())
                }
            }
        })?;
        info!(
            blocks = metas.len(),
            logs = logs.len(),
            skipped,
            "storage engine opened"
        );

        Ok(Self {
            shared: Arc::new(Shared {
                config,
                volume,
                wal: Arc::new(wal),
                sync_store,
                async_store,
                host,
                on_leader: RwLock::new(None),
                on_archived: RwLock::new(None),
            }),
            recovered: Mutex::new(logs),
        })
    }

    /// Installs the leadership callback handed to every replica started
    /// afterwards.
    pub fn set_leader_callback(&self, callback: LeaderCallback) {
        *self.shared.on_leader.write() = Some(callback);
    }

    /// Installs the archival callback handed to every block opened or
    /// created afterwards.
    pub fn set_archived_callback(&self, callback: ArchivedCallback) {
        *self.shared.on_archived.write() = Some(callback);
    }

    /// Reopens every known block. Activated replicas restart their raft
    /// driver, so this must run inside a tokio runtime.
    ///
    /// Metadata whose block file is gone is dropped; block files without
    /// metadata are left alone and reported.
    ///
    /// # Errors
    ///
    /// Block corruption or storage errors.
    pub fn recover(&self) -> CoreResult<Vec<Arc<Replica>>> {
        let metas = load_metas(&self.shared.sync_store)?;
        let mut logs = std::mem::take(&mut *self.recovered.lock());
        let volume = self.shared.volume.as_ref();

        let known: HashSet<BlockId> = metas.keys().copied().collect();
        for name in volume.list()? {
            if let Some(id) = parse_block_file_name(&name) {
                if !known.contains(&id) {
                    warn!(block_id = %id, file = %name, "block file without metadata");
                }
            }
        }

        let mut replicas = Vec::with_capacity(metas.len());
        for (id, meta) in metas {
            if !volume.exists(&block_file_name(id)) {
                warn!(block_id = %id, "metadata without block file, dropping");
                self.shared.sync_store.delete_prefix(&keys::block_scope(id))?;
                continue;
            }
            let block = Block::open(volume, id)?;
            let activated = !meta.peers.is_empty();
            for peer in &meta.peers {
                self.shared.host.resolver().register(peer.id, peer.endpoint.clone());
            }
            let replica = Replica::new(
                Arc::clone(&self.shared),
                block,
                meta.peers,
                logs.remove(&id).unwrap_or_default(),
            );
            if activated {
                replica.start(false)?;
            }
            debug!(block_id = %id, activated, "replica recovered");
            replicas.push(Arc::new(replica));
        }
        info!(replicas = replicas.len(), "replicas recovered");
        Ok(replicas)
    }

    /// Creates block `id` with `capacity` bytes and its detached replica.
    ///
    /// # Errors
    ///
    /// [`CoreError::InvalidArgument`] for id 0,
    /// [`CoreError::AlreadyExists`] if the block is known, or storage
    /// errors.
    pub fn create_replica(&self, id: BlockId, capacity: u64) -> CoreResult<Arc<Replica>> {
        if id.is_zero() {
            return Err(CoreError::invalid_argument("block id 0 is reserved"));
        }
        let key = keys::block_meta(id);
        if self.shared.sync_store.get::<BlockMeta>(&key)?.is_some() {
            return Err(CoreError::AlreadyExists(id));
        }
        let block = Block::create(self.shared.volume.as_ref(), id, capacity)?;
        let meta = BlockMeta {
            capacity,
            wal_start: self.shared.wal.size()?,
            peers: Vec::new(),
        };
        self.shared.sync_store.put(&key, &meta)?;
        info!(block_id = %id, capacity, "replica created");
        Ok(Arc::new(Replica::new(
            Arc::clone(&self.shared),
            block,
            Vec::new(),
            RaftLog::new(),
        )))
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.shared.config
    }

    /// The shared WAL.
    #[must_use]
    pub fn wal(&self) -> &Arc<Wal> {
        &self.shared.wal
    }

    /// The sync metadata store.
    #[must_use]
    pub fn sync_store(&self) -> &Arc<SyncStore> {
        &self.shared.sync_store
    }

    /// The async metadata store.
    #[must_use]
    pub fn async_store(&self) -> &Arc<AsyncStore> {
        &self.shared.async_store
    }

    /// The raft host.
    #[must_use]
    pub fn host(&self) -> &Arc<Host> {
        &self.shared.host
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("volume", &self.shared.volume)
            .field("host", &self.shared.host)
            .finish_non_exhaustive()
    }
}

fn load_metas(store: &SyncStore) -> CoreResult<HashMap<BlockId, BlockMeta>> {
    let mut metas = HashMap::new();
    for key in store.keys_with_prefix(keys::BLOCK_PREFIX) {
        if let Some(id) = keys::parse_block_meta(&key) {
            if let Some(meta) = store.get::<BlockMeta>(&key)? {
                metas.insert(id, meta);
            }
        }
    }
    Ok(metas)
}
