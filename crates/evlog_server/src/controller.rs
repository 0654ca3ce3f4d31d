//! Client side of the cluster controller contract.

use crate::error::{ServerError, ServerResult, WireError};
use crate::protocol::{read_frame, write_frame};
use async_trait::async_trait;
use evlog_core::{BlockId, SegmentHealthInfo, Term};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Periodic report of every replica on a server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRequest {
    /// Server id assigned at registration.
    pub server_id: u64,
    /// Volume of the server.
    pub volume_id: u64,
    /// One entry per replica.
    pub health_info: Vec<SegmentHealthInfo>,
    /// Milliseconds since the Unix epoch.
    pub report_time: i64,
    /// Advertised address.
    pub server_addr: String,
}

/// A replica became leader.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderReport {
    /// The new leader.
    pub leader_id: BlockId,
    /// Its term.
    pub term: Term,
}

/// Placement of one replica of a segment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaInfo {
    /// Volume hosting the replica.
    pub volume_id: u64,
    /// Endpoint of the hosting server; empty when offline.
    pub endpoint: String,
}

/// A segment as known to the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentInfo {
    /// Segment id.
    pub id: u64,
    /// Owning event log.
    pub eventlog_id: u64,
    /// Replicas by block id.
    pub replicas: BTreeMap<BlockId, ReplicaInfo>,
}

/// Outcome of registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// Id assigned to the server.
    pub server_id: u64,
    /// Segments with a replica on this server's volume.
    pub segments: BTreeMap<u64, SegmentInfo>,
}

/// What a segment server needs from the controller.
#[async_trait]
pub trait ControllerClient: Send + Sync {
    /// Blocks until the controller answers.
    async fn wait_for_ready(&self) -> ServerResult<()>;

    /// Announces the server and learns its id and segments.
    async fn register_segment_server(
        &self,
        address: &str,
        volume_id: u64,
        capacity: u64,
    ) -> ServerResult<RegisterResponse>;

    /// Periodic health report.
    async fn heartbeat(&self, request: HeartbeatRequest) -> ServerResult<()>;

    /// Reports a leadership change.
    async fn report_segment_leader(&self, report: LeaderReport) -> ServerResult<()>;

    /// Reports that a block was archived.
    async fn report_block_is_full(&self, request: HeartbeatRequest) -> ServerResult<()>;

    /// Releases connections.
    async fn close(&self);
}

/// Controller operations on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerRequest {
    /// Readiness probe.
    Ping,
    /// See [`ControllerClient::register_segment_server`].
    RegisterSegmentServer {
        /// Advertised address.
        address: String,
        /// Volume id.
        volume_id: u64,
        /// Volume capacity.
        capacity: u64,
    },
    /// See [`ControllerClient::heartbeat`].
    Heartbeat(HeartbeatRequest),
    /// See [`ControllerClient::report_segment_leader`].
    ReportSegmentLeader(LeaderReport),
    /// See [`ControllerClient::report_block_is_full`].
    ReportBlockIsFull(HeartbeatRequest),
}

/// Controller answers on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControllerResponse {
    /// Success without payload.
    Ok,
    /// Registration result.
    Registered(RegisterResponse),
    /// Failure.
    Error(WireError),
}

/// [`ControllerClient`] speaking the frame protocol to a controller.
///
/// One connection is kept open and used for one call at a time. Endpoints
/// are tried in order whenever a new connection is needed.
pub struct RemoteController {
    addresses: Vec<String>,
    ready_timeout: Duration,
    conn: Mutex<Option<TcpStream>>,
}

impl RemoteController {
    /// Client for the controllers at `addresses`.
    pub fn new(addresses: Vec<String>) -> Self {
        Self {
            addresses,
            ready_timeout: Duration::from_secs(60),
            conn: Mutex::new(None),
        }
    }

    /// Sets how long [`ControllerClient::wait_for_ready`] keeps trying.
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    async fn connect(&self) -> ServerResult<TcpStream> {
        let mut last = None;
        for address in &self.addresses {
            match TcpStream::connect(address).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    debug!(address = %address, "connected to controller");
                    return Ok(stream);
                }
                Err(e) => last = Some(e),
            }
        }
        let err = ServerError::internal("no controller reachable");
        Err(match last {
            Some(e) => err.with_source(e),
            None => err,
        })
    }

    async fn call(&self, request: ControllerRequest) -> ServerResult<ControllerResponse> {
        let mut conn = self.conn.lock().await;
        if conn.is_none() {
            *conn = Some(self.connect().await?);
        }
        let Some(stream) = conn.as_mut() else {
            return Err(ServerError::internal("controller connection unavailable"));
        };
        let result = async {
            write_frame(stream, &request).await?;
            read_frame::<_, ControllerResponse>(stream).await
        }
        .await;
        match result {
            Ok(Some(ControllerResponse::Error(e))) => Err(e.into()),
            Ok(Some(response)) => Ok(response),
            Ok(None) => {
                *conn = None;
                Err(ServerError::internal("controller closed the connection"))
            }
            Err(e) => {
                *conn = None;
                Err(ServerError::internal("controller call failed").with_source(e))
            }
        }
    }

    async fn call_ok(&self, request: ControllerRequest) -> ServerResult<()> {
        match self.call(request).await? {
            ControllerResponse::Ok => Ok(()),
            other => Err(ServerError::internal(format!(
                "unexpected controller response {other:?}"
            ))),
        }
    }
}

#[async_trait]
impl ControllerClient for RemoteController {
    async fn wait_for_ready(&self) -> ServerResult<()> {
        let deadline = tokio::time::Instant::now() + self.ready_timeout;
        let mut attempts = 0u32;
        loop {
            match self.call_ok(ControllerRequest::Ping).await {
                Ok(()) => {
                    info!(attempts, "controller is ready");
                    return Ok(());
                }
                Err(e) if tokio::time::Instant::now() < deadline => {
                    attempts += 1;
                    if attempts % 10 == 1 {
                        warn!(error = %e, attempts, "controller not ready, retrying");
                    }
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn register_segment_server(
        &self,
        address: &str,
        volume_id: u64,
        capacity: u64,
    ) -> ServerResult<RegisterResponse> {
        let request = ControllerRequest::RegisterSegmentServer {
            address: address.to_string(),
            volume_id,
            capacity,
        };
        match self.call(request).await? {
            ControllerResponse::Registered(response) => Ok(response),
            other => Err(ServerError::internal(format!(
                "unexpected controller response {other:?}"
            ))),
        }
    }

    async fn heartbeat(&self, request: HeartbeatRequest) -> ServerResult<()> {
        self.call_ok(ControllerRequest::Heartbeat(request)).await
    }

    async fn report_segment_leader(&self, report: LeaderReport) -> ServerResult<()> {
        self.call_ok(ControllerRequest::ReportSegmentLeader(report)).await
    }

    async fn report_block_is_full(&self, request: HeartbeatRequest) -> ServerResult<()> {
        self.call_ok(ControllerRequest::ReportBlockIsFull(request)).await
    }

    async fn close(&self) {
        if self.conn.lock().await.take().is_some() {
            debug!("controller connection closed");
        }
    }
}

impl std::fmt::Debug for RemoteController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteController")
            .field("addresses", &self.addresses)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use tokio::net::TcpListener;

    async fn fake_controller() -> (String, tokio::task::JoinHandle<Vec<ControllerRequest>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut seen = Vec::new();
            while let Some(request) = read_frame::<_, ControllerRequest>(&mut stream).await.unwrap() {
                let response = match &request {
                    ControllerRequest::RegisterSegmentServer { .. } => {
                        ControllerResponse::Registered(RegisterResponse {
                            server_id: 77,
                            segments: BTreeMap::new(),
                        })
                    }
                    ControllerRequest::ReportSegmentLeader(_) => ControllerResponse::Error(WireError {
                        kind: ErrorKind::ResourceNotFound,
                        message: "unknown segment".into(),
                    }),
                    _ => ControllerResponse::Ok,
                };
                seen.push(request);
                write_frame(&mut stream, &response).await.unwrap();
            }
            seen
        });
        (addr, handle)
    }

    #[tokio::test]
    async fn remote_controller_round_trip() {
        let (addr, server) = fake_controller().await;
        let client = RemoteController::new(vec!["127.0.0.1:1".into(), addr]);

        client.wait_for_ready().await.unwrap();
        let registered = client
            .register_segment_server("127.0.0.1:11811", 3, 1 << 20)
            .await
            .unwrap();
        assert_eq!(registered.server_id, 77);

        let err = client
            .report_segment_leader(LeaderReport {
                leader_id: BlockId::new(5),
                term: 2,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ResourceNotFound);

        client.close().await;
        let seen = server.await.unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0], ControllerRequest::Ping);
    }

    #[tokio::test]
    async fn unreachable_controller_times_out() {
        let client = RemoteController::new(vec!["127.0.0.1:1".into()])
            .with_ready_timeout(Duration::from_millis(100));
        let err = client.wait_for_ready().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);
    }
}
