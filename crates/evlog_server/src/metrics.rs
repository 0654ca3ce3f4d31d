//! Per-block traffic counters.

use dashmap::DashMap;
use evlog_core::BlockId;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

#[derive(Debug, Default)]
struct Counters {
    write_events: AtomicU64,
    write_bytes: AtomicU64,
    read_events: AtomicU64,
    read_bytes: AtomicU64,
}

/// Snapshot of one block's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlockTraffic {
    /// Events appended.
    pub write_events: u64,
    /// Encoded bytes appended.
    pub write_bytes: u64,
    /// Events read.
    pub read_events: u64,
    /// Encoded bytes read.
    pub read_bytes: u64,
}

/// Write and read counters of every block on the server.
#[derive(Debug, Default)]
pub struct BlockMetrics {
    blocks: DashMap<BlockId, Counters>,
}

impl BlockMetrics {
    /// Empty metrics.
    pub fn new() -> Self {
        Self::default()
    }

    /// Counts an append.
    pub fn record_write(&self, block: BlockId, events: usize, bytes: usize) {
        let counters = self.blocks.entry(block).or_default();
        let total = counters.write_events.fetch_add(events as u64, Ordering::Relaxed) + events as u64;
        counters.write_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
        debug!(block_id = %block, events, bytes, total, "block write");
    }

    /// Counts a read.
    pub fn record_read(&self, block: BlockId, events: usize, bytes: usize) {
        let counters = self.blocks.entry(block).or_default();
        counters.read_events.fetch_add(events as u64, Ordering::Relaxed);
        counters.read_bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Counters of `block`; zero if it saw no traffic.
    pub fn get(&self, block: BlockId) -> BlockTraffic {
        self.blocks
            .get(&block)
            .map(|c| BlockTraffic {
                write_events: c.write_events.load(Ordering::Relaxed),
                write_bytes: c.write_bytes.load(Ordering::Relaxed),
                read_events: c.read_events.load(Ordering::Relaxed),
                read_bytes: c.read_bytes.load(Ordering::Relaxed),
            })
            .unwrap_or_default()
    }

    /// Drops the counters of a removed block.
    pub fn forget(&self, block: BlockId) {
        self.blocks.remove(&block);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate_per_block() {
        let metrics = BlockMetrics::new();
        metrics.record_write(BlockId::new(1), 3, 300);
        metrics.record_write(BlockId::new(1), 1, 50);
        metrics.record_read(BlockId::new(1), 2, 200);
        metrics.record_write(BlockId::new(2), 1, 10);

        let one = metrics.get(BlockId::new(1));
        assert_eq!(one.write_events, 4);
        assert_eq!(one.write_bytes, 350);
        assert_eq!(one.read_events, 2);
        assert_eq!(metrics.get(BlockId::new(2)).write_events, 1);

        metrics.forget(BlockId::new(1));
        assert_eq!(metrics.get(BlockId::new(1)), BlockTraffic::default());
    }
}
