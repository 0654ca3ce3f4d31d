//! Shared fixtures for the segment server tests.

#![allow(dead_code)]

use async_trait::async_trait;
use evlog_codec::{AttributeValue, CloudEvent, EventData, BLOCK_OFFSET_ATTR};
use evlog_server::{
    ControllerClient, HeartbeatRequest, LeaderReport, RegisterResponse, SegmentInfo, SegmentServer,
    ServerConfig, ServerResult, ServerState,
};
use evlog_storage::{StorageBackend, StorageResult, Volume};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Controller that records every call.
#[derive(Default)]
pub struct MockController {
    pub server_id: u64,
    pub segments: BTreeMap<u64, SegmentInfo>,
    pub registrations: Mutex<Vec<(String, u64, u64)>>,
    pub heartbeats: Mutex<Vec<HeartbeatRequest>>,
    pub leaders: Mutex<Vec<LeaderReport>>,
    pub full_reports: Mutex<Vec<HeartbeatRequest>>,
    pub closed: Mutex<bool>,
}

impl MockController {
    pub fn new(server_id: u64) -> Self {
        Self {
            server_id,
            ..Self::default()
        }
    }
}

#[async_trait]
impl ControllerClient for MockController {
    async fn wait_for_ready(&self) -> ServerResult<()> {
        Ok(())
    }

    async fn register_segment_server(
        &self,
        address: &str,
        volume_id: u64,
        capacity: u64,
    ) -> ServerResult<RegisterResponse> {
        self.registrations
            .lock()
            .push((address.to_string(), volume_id, capacity));
        Ok(RegisterResponse {
            server_id: self.server_id,
            segments: self.segments.clone(),
        })
    }

    async fn heartbeat(&self, request: HeartbeatRequest) -> ServerResult<()> {
        self.heartbeats.lock().push(request);
        Ok(())
    }

    async fn report_segment_leader(&self, report: LeaderReport) -> ServerResult<()> {
        self.leaders.lock().push(report);
        Ok(())
    }

    async fn report_block_is_full(&self, request: HeartbeatRequest) -> ServerResult<()> {
        self.full_reports.lock().push(request);
        Ok(())
    }

    async fn close(&self) {
        *self.closed.lock() = true;
    }
}

/// Volume whose `open` of one backend stalls like a slow disk.
#[derive(Debug)]
pub struct SlowVolume {
    inner: Arc<dyn Volume>,
    slow_name: String,
    delay: Duration,
    opening: AtomicBool,
}

impl SlowVolume {
    pub fn new(inner: Arc<dyn Volume>, slow_name: impl Into<String>, delay: Duration) -> Self {
        Self {
            inner,
            slow_name: slow_name.into(),
            delay,
            opening: AtomicBool::new(false),
        }
    }

    /// Whether the slow open has started.
    pub fn opening(&self) -> bool {
        self.opening.load(Ordering::SeqCst)
    }
}

impl Volume for SlowVolume {
    fn open(&self, name: &str) -> StorageResult<Box<dyn StorageBackend>> {
        if name == self.slow_name {
            self.opening.store(true, Ordering::SeqCst);
            std::thread::sleep(self.delay);
        }
        self.inner.open(name)
    }

    fn exists(&self, name: &str) -> bool {
        self.inner.exists(name)
    }

    fn remove(&self, name: &str) -> StorageResult<()> {
        self.inner.remove(name)
    }

    fn list(&self) -> StorageResult<Vec<String>> {
        self.inner.list()
    }
}

pub fn test_config(port: u16) -> ServerConfig {
    ServerConfig::for_testing()
        .with_address("127.0.0.1", port)
        .with_volume(1, "unused", 1 << 30)
}

/// Initialized and started server over `volume`.
pub async fn running_server(
    config: ServerConfig,
    volume: Arc<dyn Volume>,
    controller: Arc<MockController>,
) -> Arc<SegmentServer> {
    let server = Arc::new(SegmentServer::with_volume(config, volume, controller));
    server.initialize().await.unwrap();
    if server.status() != ServerState::Running {
        server.start().await.unwrap();
    }
    server
}

pub fn event(i: usize) -> CloudEvent {
    CloudEvent::new(format!("evt-{i}"), "/tests", "test.event")
        .with_data(EventData::Binary(vec![i as u8; 64]))
        .with_attribute("shard", AttributeValue::String(format!("s{}", i % 3)))
}

pub fn block_offset(event: &CloudEvent) -> Option<&str> {
    event.attributes.get(BLOCK_OFFSET_ATTR).and_then(AttributeValue::as_str)
}

pub async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
