//! Server configuration.

use crate::error::{ServerError, ServerResult};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable that turns on debug mode.
pub const DEBUG_MODE_ENV: &str = "SEGMENT_SERVER_DEBUG_MODE";

/// The volume a server stores its blocks in.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct VolumeConfig {
    /// Volume id, unique in the cluster.
    pub id: u64,
    /// Directory holding blocks, WAL and metadata.
    pub dir: PathBuf,
    /// Bytes the controller may place on this volume.
    pub capacity: u64,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            id: 0,
            dir: PathBuf::from("./data/volume"),
            capacity: 1 << 30,
        }
    }
}

/// Configuration for the segment server.
///
/// Loaded from JSON; every field is optional. Durations are given in
/// milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// IP the server listens on and advertises.
    pub ip: String,
    /// Port the server listens on.
    pub port: u16,
    /// Storage volume.
    pub volume: VolumeConfig,
    /// Controller endpoints, tried in order.
    pub controller_addresses: Vec<String>,
    /// Period of controller heartbeats.
    pub heartbeat_interval_ms: u64,
    /// Buffered leadership changes awaiting report.
    pub leader_channel_capacity: usize,
    /// Grace period for in-flight requests at shutdown.
    pub force_stop_timeout_ms: u64,
    /// Skip controller registration and heartbeats.
    pub debug_mode: bool,
    /// Fsync the WAL before acknowledging.
    pub wal_sync: bool,
    /// Raft tick period.
    pub raft_tick_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            ip: "127.0.0.1".into(),
            port: 11811,
            volume: VolumeConfig::default(),
            controller_addresses: vec!["127.0.0.1:2048".into()],
            heartbeat_interval_ms: 1000,
            leader_channel_capacity: 256,
            force_stop_timeout_ms: 30_000,
            debug_mode: false,
            wal_sync: true,
            raft_tick_ms: 100,
        }
    }
}

impl ServerConfig {
    /// Default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Reads a JSON configuration file.
    ///
    /// # Errors
    ///
    /// `InvalidRequest` if the file cannot be read or parsed.
    pub fn load(path: &Path) -> ServerResult<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            ServerError::invalid_request(format!("cannot read {}", path.display())).with_source(e)
        })?;
        serde_json::from_str(&text).map_err(|e| {
            ServerError::invalid_request(format!("cannot parse {}", path.display())).with_source(e)
        })
    }

    /// Turns on debug mode if [`DEBUG_MODE_ENV`] is `true` (any case).
    pub fn with_env(mut self) -> Self {
        if std::env::var(DEBUG_MODE_ENV).is_ok_and(|v| v.eq_ignore_ascii_case("true")) {
            self.debug_mode = true;
        }
        self
    }

    /// Sets the listen address.
    pub fn with_address(mut self, ip: impl Into<String>, port: u16) -> Self {
        self.ip = ip.into();
        self.port = port;
        self
    }

    /// Sets the volume.
    pub fn with_volume(mut self, id: u64, dir: impl Into<PathBuf>, capacity: u64) -> Self {
        self.volume = VolumeConfig {
            id,
            dir: dir.into(),
            capacity,
        };
        self
    }

    /// Sets the controller endpoints.
    pub fn with_controllers(mut self, addresses: Vec<String>) -> Self {
        self.controller_addresses = addresses;
        self
    }

    /// Sets debug mode.
    pub fn with_debug_mode(mut self, debug: bool) -> Self {
        self.debug_mode = debug;
        self
    }

    /// Sets the heartbeat period.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Settings suited to tests: fast raft ticks, no fsync.
    pub fn for_testing() -> Self {
        Self {
            wal_sync: false,
            raft_tick_ms: 10,
            heartbeat_interval_ms: 50,
            force_stop_timeout_ms: 1000,
            ..Self::default()
        }
    }

    /// Address advertised to peers and the controller.
    pub fn local_address(&self) -> String {
        format!("{}:{}", self.ip, self.port)
    }

    /// Heartbeat period.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms.max(1))
    }

    /// Shutdown grace period.
    pub fn force_stop_timeout(&self) -> Duration {
        Duration::from_millis(self.force_stop_timeout_ms)
    }

    /// Storage engine settings derived from this configuration.
    pub fn engine_config(&self) -> evlog_core::Config {
        let tick = Duration::from_millis(self.raft_tick_ms.max(1));
        let config = evlog_core::Config::new()
            .wal_sync(self.wal_sync)
            .tick_interval(tick);
        if self.raft_tick_ms < 50 {
            config.election_ticks(5).heartbeat_ticks(1)
        } else {
            config
        }
    }
}
