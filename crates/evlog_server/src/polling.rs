//! Long-poll coordination for tail reads.

use dashmap::DashMap;
use evlog_core::BlockId;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::oneshot;
use tracing::debug;

/// One suspended tail read.
///
/// Resolves when new data may be available. A wake is only a hint: the
/// reader must read again and may still find nothing.
#[derive(Debug)]
pub struct Waiter {
    rx: oneshot::Receiver<()>,
}

impl Waiter {
    /// Waits for a wake. Returns immediately if the manager is gone.
    pub async fn notified(self) {
        let _ = self.rx.await;
    }
}

/// Per-block registry of suspended readers.
#[derive(Debug, Default)]
pub struct PollingManager {
    waiters: DashMap<BlockId, Vec<oneshot::Sender<()>>>,
    closed: AtomicBool,
}

impl PollingManager {
    /// Empty manager.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a reader of `block`. Returns `None` once the manager is
    /// closed.
    pub fn add(&self, block: BlockId) -> Option<Waiter> {
        let mut waiters = self.waiters.entry(block).or_default();
        if self.closed.load(Ordering::SeqCst) {
            return None;
        }
        waiters.retain(|tx| !tx.is_closed());
        let (tx, rx) = oneshot::channel();
        waiters.push(tx);
        Some(Waiter { rx })
    }

    /// Wakes every reader of `block`. Never blocks.
    pub fn new_message_arrived(&self, block: BlockId) {
        if let Some((_, waiters)) = self.waiters.remove(&block) {
            for tx in waiters {
                let _ = tx.send(());
            }
        }
    }

    /// Drops the readers of a removed block. They wake and find it gone.
    pub fn forget(&self, block: BlockId) {
        self.waiters.remove(&block);
    }

    /// Number of readers registered for `block`, stale ones included.
    pub fn waiting(&self, block: BlockId) -> usize {
        self.waiters.get(&block).map_or(0, |w| w.len())
    }

    /// Refuses new readers and wakes all current ones.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let blocks: Vec<BlockId> = self.waiters.iter().map(|e| *e.key()).collect();
        for block in blocks {
            self.new_message_arrived(block);
        }
        debug!("polling manager closed");
    }
}
