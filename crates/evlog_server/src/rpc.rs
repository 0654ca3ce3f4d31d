//! TCP transport: the request listener, the client and the raft outbound.

use crate::error::{ErrorKind, ServerError, ServerResult};
use crate::protocol::{read_frame, write_frame, Frame, Request, Response};
use crate::server::SegmentServer;
use dashmap::DashMap;
use evlog_codec::CloudEvent;
use evlog_core::{BlockId, Outbound, RaftMessage};
use std::backtrace::Backtrace;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once};
use std::time::Duration;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

const CONNECTION_QUEUE: usize = 256;
const OUTBOUND_QUEUE: usize = 1024;

/// Accepts connections until `shutdown` fires, then drains them.
///
/// Open connections stop reading new requests and finish the ones in
/// flight. Whatever is still running after `force_stop` is aborted.
pub(crate) async fn serve(
    server: Arc<SegmentServer>,
    listener: TcpListener,
    mut shutdown: watch::Receiver<bool>,
    force_stop: Duration,
) -> ServerResult<()> {
    let addr = listener
        .local_addr()
        .map_err(|e| ServerError::internal("listener has no address").with_source(e))?;
    if *shutdown.borrow() {
        return Ok(());
    }
    info!(address = %addr, "segment server listening");

    let mut connections = JoinSet::new();
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    debug!(peer = %peer, "connection accepted");
                    connections.spawn(handle_connection(
                        Arc::clone(&server),
                        stream,
                        shutdown.clone(),
                    ));
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }
    drop(listener);

    let drain = async { while connections.join_next().await.is_some() {} };
    if tokio::time::timeout(force_stop, drain).await.is_err() {
        warn!(remaining = connections.len(), "graceful stop timed out, aborting connections");
        connections.abort_all();
        while connections.join_next().await.is_some() {}
    }
    info!("segment server listener stopped");
    Ok(())
}

async fn handle_connection(
    server: Arc<SegmentServer>,
    stream: TcpStream,
    mut shutdown: watch::Receiver<bool>,
) {
    let (mut reader, writer) = stream.into_split();
    let (tx, rx) = mpsc::channel::<Frame>(CONNECTION_QUEUE);
    let writer_task = tokio::spawn(write_loop(writer, rx));

    loop {
        let frame = tokio::select! {
            _ = shutdown.changed() => break,
            frame = read_frame::<_, Frame>(&mut reader) => frame,
        };
        match frame {
            Ok(Some(Frame::Request { id, request })) => {
                let server = Arc::clone(&server);
                let tx = tx.clone();
                tokio::spawn(async move {
                    let name = request.name();
                    let handler = async move { dispatch(&server, request).await };
                    let response = run_request(name, handler).await;
                    let _ = tx.send(Frame::Response { id, response }).await;
                });
            }
            Ok(Some(Frame::Raft(message))) => {
                if !server.host().deliver(message) {
                    debug!("raft message dropped");
                }
            }
            Ok(Some(Frame::Response { id, .. })) => {
                warn!(request_id = id, "unexpected response frame from client");
            }
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "connection read failed");
                break;
            }
        }
    }

    // In-flight requests hold sender clones; the writer ends after the last.
    drop(tx);
    let _ = writer_task.await;
}

async fn write_loop(mut writer: OwnedWriteHalf, mut rx: mpsc::Receiver<Frame>) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_frame(&mut writer, &frame).await {
            debug!(error = %e, "connection write failed");
            break;
        }
    }
}

tokio::task_local! {
    static PANIC_TRACE: Arc<parking_lot::Mutex<Option<String>>>;
}

/// Records the backtrace of panics raised inside a request task.
///
/// Panics elsewhere go to the previously installed hook.
fn install_panic_hook() {
    static INSTALL: Once = Once::new();
    INSTALL.call_once(|| {
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            let recorded = PANIC_TRACE.try_with(|slot| {
                *slot.lock() = Some(Backtrace::force_capture().to_string());
            });
            if recorded.is_err() {
                previous(info);
            }
        }));
    });
}

/// Runs one request on its own task so a panic is contained.
async fn run_request<F>(name: &'static str, handler: F) -> Response
where
    F: Future<Output = Response> + Send + 'static,
{
    install_panic_hook();
    let trace = Arc::new(parking_lot::Mutex::new(None));
    match tokio::spawn(PANIC_TRACE.scope(Arc::clone(&trace), handler)).await {
        Ok(response) => response,
        Err(e) if e.is_panic() => {
            let payload = e.into_panic();
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            let backtrace = trace
                .lock()
                .take()
                .unwrap_or_else(|| "<not captured>".to_string());
            error!(method = name, panic = %message, backtrace = %backtrace, "request handler panicked");
            Response::Error(ServerError::internal(format!("{name} panicked")).to_wire())
        }
        Err(_) => Response::Error(ServerError::new(ErrorKind::Cancelled, "request cancelled").to_wire()),
    }
}

async fn dispatch(server: &SegmentServer, request: Request) -> Response {
    #[cfg(test)]
    tests::panic_on_marked_block(&request);

    let result = match request {
        Request::CreateBlock { id, size } => server.create_block(id, size).await.map(|()| Response::Ok),
        Request::RemoveBlock { id } => server.remove_block(id).await.map(|()| Response::Ok),
        Request::ActivateSegment {
            eventlog_id,
            segment_id,
            replicas,
        } => server
            .activate_segment(eventlog_id, segment_id, replicas)
            .await
            .map(|()| Response::Ok),
        Request::InactivateSegment { id } => server.inactivate_segment(id).await.map(|()| Response::Ok),
        Request::AppendToBlock { id, events } => server.append_to_block(id, events).await.map(Response::Offsets),
        Request::ReadFromBlock {
            id,
            seq,
            num,
            polling_timeout_ms,
        } => server
            .read_from_block(id, seq, num as usize, Duration::from_millis(u64::from(polling_timeout_ms)))
            .await
            .map(Response::Events),
        Request::LookupOffsetInBlock { id, stime } => {
            server.lookup_offset_in_block(id, stime).await.map(Response::Offset)
        }
    };
    result.unwrap_or_else(|e| Response::Error(e.to_wire()))
}

type Pending = Arc<DashMap<u64, oneshot::Sender<Response>>>;

/// Client of a segment server.
///
/// Requests may be issued concurrently over the one connection; responses
/// are matched by id.
pub struct SegmentClient {
    writer: Mutex<OwnedWriteHalf>,
    pending: Pending,
    next_id: AtomicU64,
    reader: JoinHandle<()>,
}

impl SegmentClient {
    /// Connects to the server at `address`.
    ///
    /// # Errors
    ///
    /// Internal if the connection cannot be established.
    pub async fn connect(address: &str) -> ServerResult<Self> {
        let stream = TcpStream::connect(address)
            .await
            .map_err(|e| ServerError::internal(format!("cannot connect to {address}")).with_source(e))?;
        let _ = stream.set_nodelay(true);
        let (mut reader, writer) = stream.into_split();
        let pending: Pending = Arc::new(DashMap::new());

        let routes = Arc::clone(&pending);
        let reader = tokio::spawn(async move {
            loop {
                match read_frame::<_, Frame>(&mut reader).await {
                    Ok(Some(Frame::Response { id, response })) => {
                        if let Some((_, tx)) = routes.remove(&id) {
                            let _ = tx.send(response);
                        }
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => break,
                    Err(e) => {
                        debug!(error = %e, "client read failed");
                        break;
                    }
                }
            }
            routes.clear();
        });

        Ok(Self {
            writer: Mutex::new(writer),
            pending,
            next_id: AtomicU64::new(1),
            reader,
        })
    }

    /// Sends `request` and waits for its response.
    ///
    /// # Errors
    ///
    /// The server's error, or Internal if the connection failed.
    pub async fn call(&self, request: Request) -> ServerResult<Response> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);
        {
            let mut writer = self.writer.lock().await;
            if let Err(e) = write_frame(&mut *writer, &Frame::Request { id, request }).await {
                self.pending.remove(&id);
                return Err(ServerError::internal("request write failed").with_source(e));
            }
        }
        match rx.await {
            Ok(Response::Error(e)) => Err(e.into()),
            Ok(response) => Ok(response),
            Err(_) => Err(ServerError::internal("connection closed before response")),
        }
    }

    /// See [`SegmentServer::create_block`].
    pub async fn create_block(&self, id: BlockId, size: u64) -> ServerResult<()> {
        self.call(Request::CreateBlock { id, size }).await.and_then(expect_ok)
    }

    /// See [`SegmentServer::remove_block`].
    pub async fn remove_block(&self, id: BlockId) -> ServerResult<()> {
        self.call(Request::RemoveBlock { id }).await.and_then(expect_ok)
    }

    /// See [`SegmentServer::activate_segment`].
    pub async fn activate_segment(
        &self,
        eventlog_id: u64,
        segment_id: u64,
        replicas: BTreeMap<BlockId, String>,
    ) -> ServerResult<()> {
        self.call(Request::ActivateSegment {
            eventlog_id,
            segment_id,
            replicas,
        })
        .await
        .and_then(expect_ok)
    }

    /// See [`SegmentServer::inactivate_segment`].
    pub async fn inactivate_segment(&self, id: BlockId) -> ServerResult<()> {
        self.call(Request::InactivateSegment { id }).await.and_then(expect_ok)
    }

    /// See [`SegmentServer::append_to_block`].
    pub async fn append_to_block(&self, id: BlockId, events: Vec<CloudEvent>) -> ServerResult<Vec<u64>> {
        match self.call(Request::AppendToBlock { id, events }).await? {
            Response::Offsets(offsets) => Ok(offsets),
            other => Err(unexpected(&other)),
        }
    }

    /// See [`SegmentServer::read_from_block`].
    pub async fn read_from_block(
        &self,
        id: BlockId,
        seq: u64,
        num: u32,
        polling_timeout: Duration,
    ) -> ServerResult<Vec<CloudEvent>> {
        let polling_timeout_ms = u32::try_from(polling_timeout.as_millis()).unwrap_or(u32::MAX);
        let request = Request::ReadFromBlock {
            id,
            seq,
            num,
            polling_timeout_ms,
        };
        match self.call(request).await? {
            Response::Events(events) => Ok(events),
            other => Err(unexpected(&other)),
        }
    }

    /// See [`SegmentServer::lookup_offset_in_block`].
    pub async fn lookup_offset_in_block(&self, id: BlockId, stime: i64) -> ServerResult<u64> {
        match self.call(Request::LookupOffsetInBlock { id, stime }).await? {
            Response::Offset(offset) => Ok(offset),
            other => Err(unexpected(&other)),
        }
    }
}

impl Drop for SegmentClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl std::fmt::Debug for SegmentClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentClient")
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

fn expect_ok(response: Response) -> ServerResult<()> {
    match response {
        Response::Ok => Ok(()),
        other => Err(unexpected(&other)),
    }
}

fn unexpected(response: &Response) -> ServerError {
    ServerError::internal(format!("unexpected response {response:?}"))
}

/// Ships raft messages to remote servers.
///
/// Each endpoint gets a queue and a task owning the connection. Messages
/// are dropped when the queue is full or the peer is unreachable; raft
/// retransmits.
pub(crate) struct NetworkOutbound {
    links: DashMap<String, mpsc::Sender<RaftMessage>>,
    shutdown: watch::Receiver<bool>,
}

impl NetworkOutbound {
    pub(crate) fn new(shutdown: watch::Receiver<bool>) -> Self {
        Self {
            links: DashMap::new(),
            shutdown,
        }
    }

    fn link(&self, endpoint: &str) -> mpsc::Sender<RaftMessage> {
        if let Some(tx) = self.links.get(endpoint) {
            if !tx.is_closed() {
                return tx.clone();
            }
        }
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        self.links.insert(endpoint.to_string(), tx.clone());
        tokio::spawn(link_loop(endpoint.to_string(), rx, self.shutdown.clone()));
        tx
    }
}

impl Outbound for NetworkOutbound {
    fn send(&self, endpoint: &str, message: RaftMessage) {
        if *self.shutdown.borrow() {
            return;
        }
        if let Err(e) = self.link(endpoint).try_send(message) {
            debug!(endpoint, error = %e, "raft message dropped");
        }
    }
}

async fn link_loop(endpoint: String, mut rx: mpsc::Receiver<RaftMessage>, mut shutdown: watch::Receiver<bool>) {
    let mut conn: Option<TcpStream> = None;
    loop {
        let message = tokio::select! {
            _ = shutdown.changed() => break,
            message = rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };
        if conn.is_none() {
            match TcpStream::connect(&endpoint).await {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    debug!(endpoint = %endpoint, "raft link connected");
                    conn = Some(stream);
                }
                Err(e) => {
                    debug!(endpoint = %endpoint, error = %e, "raft link unreachable");
                    continue;
                }
            }
        }
        if let Some(stream) = conn.as_mut() {
            if let Err(e) = write_frame(stream, &Frame::Raft(message)).await {
                debug!(endpoint = %endpoint, error = %e, "raft link broken");
                conn = None;
            }
        }
    }
    debug!(endpoint = %endpoint, "raft link closed");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::controller::RemoteController;
    use evlog_storage::MemoryVolume;

    /// Lookups on this block panic inside the request handler.
    const PANICKING_BLOCK: u64 = 0xdead;

    #[allow(clippy::panic)]
    pub(super) fn panic_on_marked_block(request: &Request) {
        if let Request::LookupOffsetInBlock { id, .. } = request {
            if id.as_u64() == PANICKING_BLOCK {
                panic!("lookup hit block {id}");
            }
        }
    }

    async fn failing_handler() -> Response {
        panic!("handler failed");
    }

    #[tokio::test]
    async fn panicking_handler_answers_internal() {
        let response = run_request("LookupOffsetInBlock", failing_handler()).await;
        match response {
            Response::Error(e) => {
                assert_eq!(e.kind, ErrorKind::Internal);
                assert_eq!(e.message, "LookupOffsetInBlock panicked");
            }
            other => panic!("unexpected response {other:?}"),
        }

        let response = run_request("LookupOffsetInBlock", async { Response::Offset(3) }).await;
        assert!(matches!(response, Response::Offset(3)));
    }

    #[tokio::test]
    async fn backtrace_is_taken_at_the_panic_site() {
        install_panic_hook();
        let trace = Arc::new(parking_lot::Mutex::new(None));
        let joined = tokio::spawn(PANIC_TRACE.scope(Arc::clone(&trace), failing_handler())).await;
        assert!(joined.unwrap_err().is_panic());
        assert!(trace.lock().is_some());
    }

    #[tokio::test]
    async fn server_keeps_serving_after_a_panic() {
        let config = ServerConfig::for_testing().with_debug_mode(true);
        let server = Arc::new(SegmentServer::with_volume(
            config,
            Arc::new(MemoryVolume::new()),
            Arc::new(RemoteController::new(Vec::new())),
        ));
        server.initialize().await.unwrap();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let serving = {
            let server = Arc::clone(&server);
            tokio::spawn(async move { server.serve(listener).await })
        };

        let client = SegmentClient::connect(&address).await.unwrap();
        let err = client
            .lookup_offset_in_block(BlockId::new(PANICKING_BLOCK), 0)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Internal);

        client.create_block(BlockId::new(5), 4096).await.unwrap();
        assert_eq!(client.lookup_offset_in_block(BlockId::new(5), 0).await.unwrap(), 0);

        server.stop().await.unwrap();
        serving.await.unwrap().unwrap();
    }
}
