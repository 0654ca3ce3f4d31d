//! Routing of raft messages between replicas.
//!
//! The [`Resolver`] maps block ids to the address of the server hosting
//! them. The [`Host`] owns the inboxes of the replicas running on this
//! server: a message for a local replica goes straight into its inbox,
//! anything else is handed to the [`Outbound`] sender installed by the
//! network layer.

use super::message::RaftMessage;
use super::node::Event;
use crate::types::BlockId;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, trace};

/// Block id to endpoint map shared by every replica on the server.
#[derive(Debug, Default)]
pub struct Resolver {
    endpoints: DashMap<BlockId, String>,
}

impl Resolver {
    /// Empty resolver.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Maps `id` to `endpoint`, replacing any previous mapping.
    pub fn register(&self, id: BlockId, endpoint: impl Into<String>) {
        let endpoint = endpoint.into();
        trace!(block_id = %id, endpoint = %endpoint, "peer registered");
        self.endpoints.insert(id, endpoint);
    }

    /// Forgets `id`.
    pub fn unregister(&self, id: BlockId) {
        self.endpoints.remove(&id);
    }

    /// Endpoint of `id`.
    #[must_use]
    pub fn resolve(&self, id: BlockId) -> Option<String> {
        self.endpoints.get(&id).map(|e| e.value().clone())
    }
}

/// Sends raft messages to other servers.
///
/// Implementations must not block; delivery is best effort and raft
/// retransmits on its own.
pub trait Outbound: Send + Sync {
    /// Sends `message` to the server at `endpoint`.
    fn send(&self, endpoint: &str, message: RaftMessage);
}

/// Per-server message router.
pub struct Host {
    local_addr: String,
    resolver: Arc<Resolver>,
    inboxes: DashMap<BlockId, mpsc::Sender<Event>>,
    outbound: RwLock<Option<Arc<dyn Outbound>>>,
    stopped: AtomicBool,
}

impl Host {
    /// Creates a host for the server listening on `local_addr`.
    pub fn new(local_addr: impl Into<String>, resolver: Arc<Resolver>) -> Self {
        Self {
            local_addr: local_addr.into(),
            resolver,
            inboxes: DashMap::new(),
            outbound: RwLock::new(None),
            stopped: AtomicBool::new(false),
        }
    }

    /// Address of this server.
    #[must_use]
    pub fn local_addr(&self) -> &str {
        &self.local_addr
    }

    /// Shared resolver.
    #[must_use]
    pub fn resolver(&self) -> &Arc<Resolver> {
        &self.resolver
    }

    /// Installs the sender used for replicas on other servers.
    pub fn set_outbound(&self, outbound: Arc<dyn Outbound>) {
        *self.outbound.write() = Some(outbound);
    }

    /// Delivers a message that arrived for a local replica. Returns whether
    /// it was queued; a full or missing inbox drops it.
    pub fn deliver(&self, message: RaftMessage) -> bool {
        if self.stopped.load(Ordering::Acquire) {
            return false;
        }
        let Some(inbox) = self.inboxes.get(&message.to).map(|i| i.value().clone()) else {
            trace!(block_id = %message.to, "no local replica for message");
            return false;
        };
        match inbox.try_send(Event::Message(message)) {
            Ok(()) => true,
            Err(e) => {
                debug!(error = %e, "raft message dropped");
                false
            }
        }
    }

    /// Routes `message` to its recipient.
    pub(crate) fn send(&self, message: RaftMessage) {
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        if self.inboxes.contains_key(&message.to) {
            self.deliver(message);
            return;
        }
        let Some(endpoint) = self.resolver.resolve(message.to) else {
            debug!(block_id = %message.to, "no endpoint for peer, message dropped");
            return;
        };
        let outbound = self.outbound.read().clone();
        match outbound {
            Some(outbound) => outbound.send(&endpoint, message),
            None => debug!(endpoint = %endpoint, "no outbound transport, message dropped"),
        }
    }

    pub(crate) fn register(&self, id: BlockId, inbox: mpsc::Sender<Event>) {
        self.inboxes.insert(id, inbox);
    }

    pub(crate) fn unregister(&self, id: BlockId) {
        self.inboxes.remove(&id);
    }

    /// Stops routing. Messages sent afterwards are dropped.
    pub fn stop(&self) {
        if !self.stopped.swap(true, Ordering::AcqRel) {
            self.inboxes.clear();
            debug!(addr = %self.local_addr, "raft host stopped");
        }
    }
}

impl std::fmt::Debug for Host {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Host")
            .field("local_addr", &self.local_addr)
            .field("replicas", &self.inboxes.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::message::MessageBody;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Capture(Mutex<Vec<(String, RaftMessage)>>);

    impl Outbound for Capture {
        fn send(&self, endpoint: &str, message: RaftMessage) {
            self.0.lock().push((endpoint.to_string(), message));
        }
    }

    fn vote(to: u64) -> RaftMessage {
        RaftMessage {
            from: BlockId::new(1),
            to: BlockId::new(to),
            term: 1,
            body: MessageBody::RequestVoteReply { granted: true },
        }
    }

    #[tokio::test]
    async fn local_replicas_short_circuit() {
        let host = Host::new("127.0.0.1:1", Arc::new(Resolver::new()));
        let (tx, mut rx) = mpsc::channel(4);
        host.register(BlockId::new(2), tx);
        host.send(vote(2));
        assert!(matches!(rx.recv().await, Some(Event::Message(m)) if m.to == BlockId::new(2)));
    }

    #[test]
    fn remote_replicas_use_outbound() {
        let resolver = Arc::new(Resolver::new());
        resolver.register(BlockId::new(3), "10.0.0.3:2048");
        let host = Host::new("127.0.0.1:1", resolver);
        let capture = Arc::new(Capture::default());
        host.set_outbound(capture.clone());

        host.send(vote(3));
        host.send(vote(4));
        let sent = capture.0.lock();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "10.0.0.3:2048");
    }

    #[test]
    fn stopped_host_drops_everything() {
        let host = Host::new("127.0.0.1:1", Arc::new(Resolver::new()));
        let (tx, _rx) = mpsc::channel(4);
        host.register(BlockId::new(2), tx);
        host.stop();
        assert!(!host.deliver(vote(2)));
    }
}
