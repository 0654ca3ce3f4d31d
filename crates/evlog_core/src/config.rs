//! Engine configuration.

use std::time::Duration;

/// Tunables for the WAL, metadata stores and raft drivers.
#[derive(Debug, Clone)]
pub struct Config {
    /// Whether WAL writes are fsynced before they are acknowledged.
    pub wal_sync: bool,

    /// Period of one raft tick.
    pub tick_interval: Duration,

    /// Base election timeout in ticks. The actual timeout is drawn from
    /// `[election_ticks, 2 * election_ticks)`.
    pub election_ticks: u32,

    /// Leader heartbeat period in ticks.
    pub heartbeat_ticks: u32,

    /// Maximum log entries carried by one AppendEntries message.
    pub max_entries_per_message: usize,

    /// Capacity of each replica's inbox.
    pub inbox_capacity: usize,

    /// How long an append waits for commit before giving up.
    pub proposal_timeout: Duration,

    /// Flush period of the async metadata store.
    pub async_flush_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            wal_sync: true,
            tick_interval: Duration::from_millis(100),
            election_ticks: 10,
            heartbeat_ticks: 2,
            max_entries_per_message: 64,
            inbox_capacity: 1024,
            proposal_timeout: Duration::from_secs(10),
            async_flush_interval: Duration::from_secs(1),
        }
    }
}

impl Config {
    /// Default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether WAL writes are fsynced.
    #[must_use]
    pub const fn wal_sync(mut self, value: bool) -> Self {
        self.wal_sync = value;
        self
    }

    /// Sets the raft tick period.
    #[must_use]
    pub const fn tick_interval(mut self, value: Duration) -> Self {
        self.tick_interval = value;
        self
    }

    /// Sets the base election timeout in ticks.
    #[must_use]
    pub const fn election_ticks(mut self, value: u32) -> Self {
        self.election_ticks = value;
        self
    }

    /// Sets the heartbeat period in ticks.
    #[must_use]
    pub const fn heartbeat_ticks(mut self, value: u32) -> Self {
        self.heartbeat_ticks = value;
        self
    }

    /// Sets the AppendEntries batch limit.
    #[must_use]
    pub const fn max_entries_per_message(mut self, value: usize) -> Self {
        self.max_entries_per_message = value;
        self
    }

    /// Sets the proposal timeout.
    #[must_use]
    pub const fn proposal_timeout(mut self, value: Duration) -> Self {
        self.proposal_timeout = value;
        self
    }

    /// Sets the async store flush period.
    #[must_use]
    pub const fn async_flush_interval(mut self, value: Duration) -> Self {
        self.async_flush_interval = value;
        self
    }

    /// Settings for tests: no fsync and a fast clock.
    #[must_use]
    pub fn for_testing() -> Self {
        Self::default()
            .wal_sync(false)
            .tick_interval(Duration::from_millis(10))
            .election_ticks(5)
            .heartbeat_ticks(1)
            .proposal_timeout(Duration::from_secs(5))
    }
}
