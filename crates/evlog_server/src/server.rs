//! The segment server: block lifecycle, replication wiring and reads.

use crate::config::ServerConfig;
use crate::controller::{ControllerClient, SegmentInfo};
use crate::error::{ErrorKind, ServerError, ServerResult};
use crate::heartbeat::{HeartbeatTask, Reporter};
use crate::metrics::BlockMetrics;
use crate::polling::PollingManager;
use crate::rpc::{self, NetworkOutbound};
use dashmap::DashMap;
use evlog_codec::{to_entry, to_event, CloudEvent, Entry};
use evlog_core::block::{stime_key, SeekKeyFlag};
use evlog_core::{BlockId, CoreError, Engine, Host, LeaderInfo, Peer, Replica, Resolver};
use evlog_storage::{FileVolume, Volume};
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Lifecycle of a [`SegmentServer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    /// Constructed, nothing loaded.
    Created,
    /// Storage recovered, not serving yet.
    Started,
    /// Serving requests.
    Running,
    /// Shut down.
    Stopped,
}

impl fmt::Display for ServerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Started => "started",
            Self::Running => "running",
            Self::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

/// A segment server.
///
/// Hosts the blocks of one volume, replicates them with their peers on
/// other servers and answers client reads, including long-polling reads at
/// the tail of a block.
///
/// Call [`initialize`](Self::initialize), then [`start`](Self::start)
/// (done by `initialize` itself in debug mode), then
/// [`serve`](Self::serve) a listener. [`stop`](Self::stop) shuts
/// everything down.
pub struct SegmentServer {
    config: ServerConfig,
    local_addr: String,
    volume: Arc<dyn Volume>,
    host: Arc<Host>,
    resolver: Arc<Resolver>,
    engine: RwLock<Option<Arc<Engine>>>,
    replicas: Arc<DashMap<BlockId, Arc<Replica>>>,
    creating: Arc<Mutex<HashSet<BlockId>>>,
    polling: PollingManager,
    metrics: BlockMetrics,
    reporter: Reporter,
    state: RwLock<ServerState>,
    leader_tx: mpsc::Sender<LeaderInfo>,
    leader_rx: Mutex<Option<mpsc::Receiver<LeaderInfo>>>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl SegmentServer {
    /// Server over the volume directory named in `config`.
    ///
    /// # Errors
    ///
    /// Internal if the volume cannot be opened or is locked by another
    /// process.
    pub fn new(config: ServerConfig, controller: Arc<dyn ControllerClient>) -> ServerResult<Self> {
        let volume = FileVolume::open_dir(&config.volume.dir).map_err(|e| {
            ServerError::internal(format!("cannot open volume at {}", config.volume.dir.display()))
                .with_source(e)
        })?;
        Ok(Self::with_volume(config, Arc::new(volume), controller))
    }

    /// Server over an already opened volume.
    pub fn with_volume(
        config: ServerConfig,
        volume: Arc<dyn Volume>,
        controller: Arc<dyn ControllerClient>,
    ) -> Self {
        let local_addr = config.local_address();
        let resolver = Arc::new(Resolver::new());
        let host = Arc::new(Host::new(local_addr.clone(), Arc::clone(&resolver)));
        let (shutdown, shutdown_rx) = watch::channel(false);
        host.set_outbound(Arc::new(NetworkOutbound::new(shutdown.subscribe())));
        let (leader_tx, leader_rx) = mpsc::channel(config.leader_channel_capacity.max(1));
        let reporter = Reporter {
            controller,
            server_id: Arc::new(AtomicU64::new(0)),
            volume_id: config.volume.id,
            address: local_addr.clone(),
            shutdown: shutdown_rx,
        };

        Self {
            config,
            local_addr,
            volume,
            host,
            resolver,
            engine: RwLock::new(None),
            replicas: Arc::new(DashMap::new()),
            creating: Arc::new(Mutex::new(HashSet::new())),
            polling: PollingManager::new(),
            metrics: BlockMetrics::new(),
            reporter,
            state: RwLock::new(ServerState::Created),
            leader_tx,
            leader_rx: Mutex::new(Some(leader_rx)),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Loads storage, recovers replicas and registers with the controller.
    ///
    /// In debug mode registration is skipped, a random server id is used
    /// and the server goes straight to [`ServerState::Running`].
    ///
    /// # Errors
    ///
    /// ServiceState unless freshly created, storage errors from recovery,
    /// or controller errors from registration.
    pub async fn initialize(&self) -> ServerResult<()> {
        let state = self.status();
        if state != ServerState::Created {
            return Err(ServerError::service_state(format!(
                "initialize failed, current state: {state}"
            )));
        }

        let engine = self.load_engine()?;
        for replica in engine.recover()? {
            self.replicas.insert(replica.id(), replica);
        }
        *self.engine.write() = Some(engine);
        *self.state.write() = ServerState::Started;
        info!(
            volume_id = self.config.volume.id,
            replicas = self.replicas.len(),
            "segment server recovered"
        );

        if self.config.debug_mode {
            let id = rand::thread_rng().gen_range(1..(1u64 << 48));
            self.reporter.server_id.store(id, Ordering::Relaxed);
            warn!(server_id = id, "debug mode, controller registration skipped");
            return self.start().await;
        }
        self.register_self().await
    }

    fn load_engine(&self) -> ServerResult<Arc<Engine>> {
        let engine = Engine::open(
            Arc::clone(&self.volume),
            Arc::clone(&self.host),
            self.config.engine_config(),
        )?;

        let leader_tx = self.leader_tx.clone();
        engine.set_leader_callback(Arc::new(move |info: LeaderInfo| {
            if info.leader != Some(info.block) {
                return;
            }
            if let Err(e) = leader_tx.try_send(info) {
                debug!(block_id = %info.block, term = info.term, error = %e, "leader change dropped");
            }
        }));

        let reporter = self.reporter.clone();
        engine.set_archived_callback(Arc::new(move |stats| reporter.report_archived(stats)));
        Ok(Arc::new(engine))
    }

    async fn register_self(&self) -> ServerResult<()> {
        let controller = &self.reporter.controller;
        controller.wait_for_ready().await?;
        let registered = controller
            .register_segment_server(&self.local_addr, self.config.volume.id, self.config.volume.capacity)
            .await?;
        self.reporter
            .server_id
            .store(registered.server_id, Ordering::Relaxed);
        info!(
            server_id = registered.server_id,
            segments = registered.segments.len(),
            "registered with controller"
        );
        self.reconcile_segments(registered.segments.values());
        Ok(())
    }

    fn reconcile_segments<'a>(&self, segments: impl Iterator<Item = &'a SegmentInfo>) {
        for segment in segments {
            if segment.replicas.is_empty() {
                continue;
            }
            let local = segment
                .replicas
                .iter()
                .find(|(_, replica)| replica.volume_id == self.config.volume.id);
            if local.is_none() {
                warn!(
                    segment_id = segment.id,
                    eventlog_id = segment.eventlog_id,
                    "segment has no replica on this volume"
                );
                continue;
            }
            self.register_replicas(segment);
        }
    }

    fn register_replicas(&self, segment: &SegmentInfo) {
        for (&id, replica) in &segment.replicas {
            let endpoint = if !replica.endpoint.is_empty() {
                replica.endpoint.clone()
            } else if replica.volume_id == self.config.volume.id {
                self.local_addr.clone()
            } else {
                info!(
                    block_id = %id,
                    segment_id = segment.id,
                    volume_id = replica.volume_id,
                    "replica is offline"
                );
                continue;
            };
            self.resolver.register(id, endpoint);
        }
    }

    /// Starts the background tasks and moves to [`ServerState::Running`].
    ///
    /// # Errors
    ///
    /// ServiceState unless initialized.
    pub async fn start(&self) -> ServerResult<()> {
        let state = self.status();
        if state != ServerState::Started {
            return Err(ServerError::service_state(format!(
                "start failed, current state: {state}"
            )));
        }

        let mut tasks = Vec::new();
        if !self.config.debug_mode {
            let heartbeat = HeartbeatTask::new(
                self.reporter.clone(),
                Arc::clone(&self.replicas),
                self.config.heartbeat_interval(),
            );
            tasks.push(tokio::spawn(heartbeat.run()));
            if let Some(rx) = self.leader_rx.lock().take() {
                tasks.push(tokio::spawn(self.reporter.clone().report_leaders(rx)));
            }
        }
        if let Some(engine) = self.engine.read().clone() {
            tasks.push(tokio::spawn(flush_async_store(
                engine,
                self.shutdown.subscribe(),
            )));
        }
        self.tasks.lock().extend(tasks);

        *self.state.write() = ServerState::Running;
        info!(address = %self.local_addr, "segment server running");
        Ok(())
    }

    /// Serves RPCs on `listener` until [`stop`](Self::stop).
    ///
    /// # Errors
    ///
    /// Internal if the listener is unusable.
    pub async fn serve(self: &Arc<Self>, listener: TcpListener) -> ServerResult<()> {
        rpc::serve(
            Arc::clone(self),
            listener,
            self.shutdown.subscribe(),
            self.config.force_stop_timeout(),
        )
        .await
    }

    /// Shuts the server down.
    ///
    /// Replicas close first, then the WAL and both metadata stores, then
    /// background tasks, the raft transport and the controller client.
    /// [`serve`](Self::serve) returns once its connections drained.
    ///
    /// # Errors
    ///
    /// ServiceState unless running.
    pub async fn stop(&self) -> ServerResult<()> {
        {
            let mut state = self.state.write();
            if *state != ServerState::Running {
                return Err(ServerError::service_state(format!(
                    "the server isn't running, current state: {}",
                    *state
                )));
            }
            *state = ServerState::Stopped;
        }
        self.polling.close();

        let replicas: Vec<Arc<Replica>> = self.replicas.iter().map(|e| Arc::clone(e.value())).collect();
        for replica in replicas {
            if let Err(e) = replica.close().await {
                warn!(block_id = %replica.id(), error = %e, "replica close failed");
            }
        }

        let engine = self.engine.read().clone();
        if let Some(engine) = engine {
            engine.wal().close();
            if let Err(e) = engine.async_store().close() {
                warn!(error = %e, "async store close failed");
            }
            let wal = Arc::clone(engine.wal());
            if let Err(e) = tokio::task::spawn_blocking(move || wal.wait()).await {
                warn!(error = %e, "WAL drain failed");
            }
            engine.sync_store().close();
        }

        let _ = self.shutdown.send(true);
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        self.host.stop();
        self.reporter.controller.close().await;
        info!("segment server stopped");
        Ok(())
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn status(&self) -> ServerState {
        *self.state.read()
    }

    /// Per-block traffic counters.
    #[must_use]
    pub fn metrics(&self) -> &BlockMetrics {
        &self.metrics
    }

    /// Address other servers and clients use to reach this one.
    #[must_use]
    pub fn local_address(&self) -> &str {
        &self.local_addr
    }

    /// Id assigned by the controller, or the synthetic one in debug mode.
    #[must_use]
    pub fn server_id(&self) -> u64 {
        self.reporter.server_id.load(Ordering::Relaxed)
    }

    /// Ids of the hosted blocks, sorted.
    #[must_use]
    pub fn block_ids(&self) -> Vec<BlockId> {
        let mut ids: Vec<BlockId> = self.replicas.iter().map(|e| *e.key()).collect();
        ids.sort_unstable();
        ids
    }

    /// Endpoints of the replicas this server exchanges raft traffic with.
    #[must_use]
    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    /// Registry of suspended tail reads.
    #[must_use]
    pub fn polling(&self) -> &PollingManager {
        &self.polling
    }

    pub(crate) fn host(&self) -> &Arc<Host> {
        &self.host
    }

    /// Creates block `id` with `size` bytes of capacity.
    ///
    /// # Errors
    ///
    /// InvalidRequest for id 0, ServiceState unless running,
    /// ResourceAlreadyExist if the block is hosted already.
    pub async fn create_block(&self, id: BlockId, size: u64) -> ServerResult<()> {
        if id.is_zero() {
            return Err(ServerError::invalid_request("block id can not be 0"));
        }
        self.check_state()?;
        let engine = self.engine()?;

        {
            let mut creating = self.creating.lock();
            if self.replicas.contains_key(&id) || !creating.insert(id) {
                return Err(ServerError::new(
                    ErrorKind::ResourceAlreadyExist,
                    format!("block {id} already exists"),
                ));
            }
        }

        // The block file and its metadata are written on the blocking pool.
        // The registry only sees the finished replica.
        let replicas = Arc::clone(&self.replicas);
        let creating = Arc::clone(&self.creating);
        let created = tokio::task::spawn_blocking(move || {
            let created = engine
                .create_replica(id, size)
                .map(|replica| {
                    replicas.insert(id, replica);
                });
            creating.lock().remove(&id);
            created
        })
        .await
        .map_err(|e| ServerError::internal(format!("create of block {id} was interrupted")).with_source(e))?;
        created.map_err(|e| core_error("create", id, e))?;
        info!(block_id = %id, capacity = size, "block created");
        Ok(())
    }

    /// Deletes block `id` and everything stored for it.
    ///
    /// # Errors
    ///
    /// ServiceState unless running, ResourceNotFound for an unknown block.
    pub async fn remove_block(&self, id: BlockId) -> ServerResult<()> {
        self.check_state()?;
        let Some((_, replica)) = self.replicas.remove(&id) else {
            return Err(ServerError::not_found(format!("block {id} not found")));
        };
        self.polling.forget(id);
        self.metrics.forget(id);
        replica.delete().await.map_err(|e| core_error("remove", id, e))?;
        info!(block_id = %id, "block removed");
        Ok(())
    }

    /// Forms the replica group of a segment.
    ///
    /// `replicas` maps every member block to the endpoint of its server.
    /// The member hosted here is the one whose endpoint is this server's
    /// address. An empty map is accepted and ignored.
    ///
    /// # Errors
    ///
    /// ServiceState unless running, ResourceNotFound if no member is hosted
    /// here.
    pub async fn activate_segment(
        &self,
        eventlog_id: u64,
        segment_id: u64,
        replicas: BTreeMap<BlockId, String>,
    ) -> ServerResult<()> {
        self.check_state()?;
        if replicas.is_empty() {
            info!(eventlog_id, segment_id, "no replicas to activate");
            return Ok(());
        }

        let Some(local) = replicas
            .iter()
            .find(|(_, endpoint)| **endpoint == self.local_addr)
            .map(|(id, _)| *id)
        else {
            return Err(ServerError::not_found(format!(
                "segment {segment_id} has no replica on {}",
                self.local_addr
            )));
        };
        let replica = self.replica(local)?;
        let peers: Vec<Peer> = replicas
            .into_iter()
            .map(|(id, endpoint)| Peer::new(id, endpoint))
            .collect();
        replica
            .bootstrap(peers)
            .map_err(|e| core_error("activate", local, e))?;
        info!(eventlog_id, segment_id, block_id = %local, "segment activated");
        Ok(())
    }

    /// Marks block `id` as pending evacuation. Unknown blocks are ignored.
    ///
    /// # Errors
    ///
    /// ServiceState unless running.
    pub async fn inactivate_segment(&self, id: BlockId) -> ServerResult<()> {
        self.check_state()?;
        match self.replicas.get(&id).map(|e| Arc::clone(e.value())) {
            Some(replica) => {
                replica
                    .mark_inactive()
                    .map_err(|e| core_error("inactivate", id, e))?;
                info!(block_id = %id, "block inactivated");
            }
            None => info!(block_id = %id, "inactivate of unknown block ignored"),
        }
        Ok(())
    }

    /// Appends `events` to block `id` through its replica group.
    ///
    /// Returns the sequence numbers of the events, after the group
    /// committed them.
    ///
    /// # Errors
    ///
    /// InvalidRequest for an empty batch, ServiceState unless running,
    /// ResourceNotFound, SegmentFull, NotLeader, or Internal for storage
    /// failures.
    pub async fn append_to_block(&self, id: BlockId, events: Vec<CloudEvent>) -> ServerResult<Vec<u64>> {
        if events.is_empty() {
            return Err(ServerError::invalid_request("event list is empty"));
        }
        self.check_state()?;
        let replica = self.replica(id)?;

        let entries: Vec<Entry> = events.into_iter().map(to_entry).collect();
        let count = entries.len();
        let bytes: usize = entries.iter().map(Entry::encoded_len).sum();

        let offsets = replica
            .append(entries)
            .await
            .map_err(|e| core_error("append", id, e))?;
        self.metrics.record_write(id, count, bytes);
        self.polling.new_message_arrived(id);
        Ok(offsets)
    }

    /// Reads up to `num` events of block `id` from `seq`.
    ///
    /// At the tail, a non-zero `polling_timeout` waits once for new data
    /// and reads again.
    ///
    /// # Errors
    ///
    /// ServiceState unless running, ResourceNotFound, OffsetOnEnd at the
    /// tail, or Cancelled when the server stops during the wait.
    pub async fn read_from_block(
        &self,
        id: BlockId,
        seq: u64,
        num: usize,
        polling_timeout: Duration,
    ) -> ServerResult<Vec<CloudEvent>> {
        self.check_state()?;
        let replica = self.replica(id)?;

        match self.read_events(&replica, seq, num) {
            Err(e) if is_tail(&e) && !polling_timeout.is_zero() && !replica.block().is_archived() => {}
            other => return other,
        }

        let Some(waiter) = self.polling.add(id) else {
            return Err(offset_on_end(id, seq));
        };
        // An append may have landed before the waiter was registered.
        match self.read_events(&replica, seq, num) {
            Err(e) if is_tail(&e) => {}
            other => return other,
        }

        let mut shutdown = self.shutdown.subscribe();
        tokio::select! {
            _ = waiter.notified() => self.read_events(&replica, seq, num),
            _ = tokio::time::sleep(polling_timeout) => Err(offset_on_end(id, seq)),
            _ = shutdown.changed() => Err(ServerError::new(ErrorKind::Cancelled, "server is stopping")),
        }
    }

    fn read_events(&self, replica: &Replica, seq: u64, num: usize) -> ServerResult<Vec<CloudEvent>> {
        let stored = replica
            .read(seq, num)
            .map_err(|e| core_error("read", replica.id(), e))?;
        let bytes: usize = stored.iter().map(|s| s.entry.encoded_len()).sum();
        self.metrics.record_read(replica.id(), stored.len(), bytes);
        Ok(stored
            .iter()
            .map(|s| to_event(&s.entry, s.seq, s.stime))
            .collect())
    }

    /// Offset of the first event of block `id` stored at or after `stime`
    /// (milliseconds). Returns 0 when no event is older.
    ///
    /// # Errors
    ///
    /// ServiceState unless running, ResourceNotFound.
    pub async fn lookup_offset_in_block(&self, id: BlockId, stime: i64) -> ServerResult<u64> {
        self.check_state()?;
        let replica = self.replica(id)?;
        match replica.seek(0, &stime_key(stime), SeekKeyFlag::BeforeKey) {
            Ok(pos) => Ok(pos + 1),
            Err(CoreError::NotFound { .. }) => Ok(0),
            Err(e) => Err(core_error("lookup", id, e)),
        }
    }

    fn check_state(&self) -> ServerResult<()> {
        let state = self.status();
        if state != ServerState::Running {
            return Err(ServerError::service_state(format!(
                "the server isn't ready to work, current state: {state}"
            )));
        }
        Ok(())
    }

    fn engine(&self) -> ServerResult<Arc<Engine>> {
        self.engine
            .read()
            .clone()
            .ok_or_else(|| ServerError::service_state("storage engine not loaded"))
    }

    /// The replica hosting block `id`.
    ///
    /// # Errors
    ///
    /// ResourceNotFound for an unknown block.
    pub fn replica(&self, id: BlockId) -> ServerResult<Arc<Replica>> {
        self.replicas
            .get(&id)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| ServerError::not_found(format!("block {id} not found")))
    }
}

impl fmt::Debug for SegmentServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SegmentServer")
            .field("address", &self.local_addr)
            .field("state", &self.status())
            .field("blocks", &self.replicas.len())
            .finish_non_exhaustive()
    }
}

/// Maps a failure of `op` on block `id`.
///
/// Outcomes a client can act on keep their kind. Anything else is logged and
/// answered as Internal.
fn core_error(op: &'static str, id: BlockId, err: CoreError) -> ServerError {
    match &err {
        CoreError::SegmentFull { .. } => {
            debug!(block_id = %id, operation = op, "block is full");
            err.into()
        }
        CoreError::NotLeader { .. }
        | CoreError::NotBootstrapped(_)
        | CoreError::InvalidArgument { .. }
        | CoreError::NotFound { .. }
        | CoreError::AlreadyExists(_)
        | CoreError::OffsetOnEnd { .. }
        | CoreError::Closed(_) => err.into(),
        _ => {
            error!(block_id = %id, operation = op, error = %err, "storage operation failed");
            ServerError::internal(format!("{op} on block {id} failed")).with_source(err)
        }
    }
}

fn is_tail(err: &ServerError) -> bool {
    err.kind() == ErrorKind::OffsetOnEnd
}

fn offset_on_end(block: BlockId, seq: u64) -> ServerError {
    CoreError::OffsetOnEnd { block, seq }.into()
}

async fn flush_async_store(engine: Arc<Engine>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(engine.config().async_flush_interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = ticker.tick() => {}
        }
        if let Err(e) = engine.async_store().flush() {
            warn!(error = %e, "async store flush failed");
        }
    }
}
