//! Background reporting to the controller.
//!
//! Three kinds of reports leave a segment server:
//!
//! - a periodic heartbeat with the health of every replica,
//! - a leader report whenever a local replica wins an election,
//! - a block-full report when a block is archived.
//!
//! All of them are best effort. Failures are logged and the next report
//! carries fresher state anyway. Every task observes the server's shutdown
//! signal.

use crate::controller::{ControllerClient, HeartbeatRequest, LeaderReport};
use dashmap::DashMap;
use evlog_core::block::Statistics;
use evlog_core::{now_millis, BlockId, LeaderInfo, Replica, SegmentHealthInfo};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Identity and channel shared by every report.
#[derive(Clone)]
pub(crate) struct Reporter {
    pub controller: Arc<dyn ControllerClient>,
    pub server_id: Arc<AtomicU64>,
    pub volume_id: u64,
    pub address: String,
    pub shutdown: watch::Receiver<bool>,
}

impl Reporter {
    fn request(&self, health_info: Vec<SegmentHealthInfo>) -> HeartbeatRequest {
        HeartbeatRequest {
            server_id: self.server_id.load(Ordering::Relaxed),
            volume_id: self.volume_id,
            health_info,
            report_time: now_millis(),
            server_addr: self.address.clone(),
        }
    }

    /// Sends a block-full report on a detached task.
    pub(crate) fn report_archived(&self, stats: Statistics) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(block_id = %stats.id, "no runtime to report archived block");
            return;
        };
        let block = stats.id;
        let request = self.request(vec![health_of(stats)]);
        let controller = Arc::clone(&self.controller);
        let mut shutdown = self.shutdown.clone();
        runtime.spawn(async move {
            tokio::select! {
                _ = shutdown.changed() => {}
                result = controller.report_block_is_full(request) => match result {
                    Ok(()) => info!(block_id = %block, "reported archived block"),
                    Err(e) => debug!(block_id = %block, error = %e, "archived block report failed"),
                },
            }
        });
    }

    /// Forwards leadership changes until shutdown or until every sender is
    /// gone.
    pub(crate) async fn report_leaders(mut self, mut changes: mpsc::Receiver<LeaderInfo>) {
        loop {
            let info = tokio::select! {
                _ = self.shutdown.changed() => break,
                info = changes.recv() => match info {
                    Some(info) => info,
                    None => break,
                },
            };
            let report = LeaderReport {
                leader_id: info.block,
                term: info.term,
            };
            tokio::select! {
                _ = self.shutdown.changed() => break,
                result = self.controller.report_segment_leader(report) => {
                    if let Err(e) = result {
                        debug!(block_id = %info.block, term = info.term, error = %e, "leader report failed");
                    } else {
                        debug!(block_id = %info.block, term = info.term, "leader reported");
                    }
                }
            }
        }
        debug!("leader reporter stopped");
    }
}

/// Health of an archived block. Raft state is not known at that point.
fn health_of(stats: Statistics) -> SegmentHealthInfo {
    SegmentHealthInfo {
        id: stats.id,
        capacity: stats.capacity,
        size: stats.size,
        event_number: stats.entry_count,
        is_full: stats.archived,
        first_event_time: stats.first_entry_stime,
        last_event_time: stats.last_entry_stime,
        leader: None,
        term: 0,
    }
}

/// Periodic health report of every replica.
pub(crate) struct HeartbeatTask {
    reporter: Reporter,
    replicas: Arc<DashMap<BlockId, Arc<Replica>>>,
    interval: Duration,
}

impl HeartbeatTask {
    pub(crate) fn new(
        reporter: Reporter,
        replicas: Arc<DashMap<BlockId, Arc<Replica>>>,
        interval: Duration,
    ) -> Self {
        Self {
            reporter,
            replicas,
            interval,
        }
    }

    pub(crate) async fn run(mut self) {
        info!(
            server_id = self.reporter.server_id.load(Ordering::Relaxed),
            interval_ms = self.interval.as_millis() as u64,
            "heartbeat task started"
        );

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut sent: u64 = 0;
        let mut failures: u64 = 0;

        loop {
            tokio::select! {
                _ = self.reporter.shutdown.changed() => break,
                _ = ticker.tick() => {}
            }

            let snapshot: Vec<Arc<Replica>> = self
                .replicas
                .iter()
                .map(|entry| Arc::clone(entry.value()))
                .collect();
            let request = self
                .reporter
                .request(snapshot.iter().map(|replica| replica.status()).collect());

            let result = tokio::select! {
                _ = self.reporter.shutdown.changed() => break,
                result = self.reporter.controller.heartbeat(request) => result,
            };
            match result {
                Ok(()) => {
                    sent += 1;
                    failures = 0;
                    debug!(count = sent, replicas = snapshot.len(), "heartbeat sent");
                }
                Err(e) => {
                    failures += 1;
                    warn!(error = %e, failures, "heartbeat failed");
                }
            }
        }

        info!(total_heartbeats = sent, "heartbeat task stopped");
    }
}
