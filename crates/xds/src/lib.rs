//! Keel discovery server.
//!
//! Each subscriber stream runs in its own task. A stream is either scoped to one resource
//! type or aggregated (ADS) over all types of the node. Per type the stream keeps a small
//! state machine: a push moves it to awaiting-ack, the matching ACK or NACK moves it back to
//! open. NACKs are charged to the version of the pending nonce and hold further pushes for a
//! backoff delay.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use keel_core::{wire::Node, ResourceType, UNKNOWN};
use keel_feedback::{Backoff, FeedbackStore};
use keel_snapshot::SnapshotCache;
use tokio::sync::watch;

mod stream;
mod tcp;

pub use stream::StreamError;
pub use tcp::{serve_tcp, MAX_FRAME_BYTES};

/// Node metadata keys consulted, in order, for the subscriber instance.
pub const INSTANCE_KEYS: [&str; 3] = ["instance", "pod_name", "POD_NAME"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamMode {
    /// All types for one node over one stream.
    Aggregated,
    /// One resource type per stream.
    Typed(ResourceType),
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub nonce_ttl: Duration,
    pub backoff: Backoff,
    pub response_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { nonce_ttl: Duration::from_secs(30), backoff: Backoff::default(), response_queue: 64 }
    }
}

/// Identity of the subscriber behind a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscriber {
    pub node_id: String,
    pub instance: String,
}

impl Subscriber {
    /// Degrades to [`UNKNOWN`] for missing pieces instead of rejecting the stream.
    pub fn from_node(node: Option<&Node>) -> Self {
        let node_id = node.map(|n| n.id.trim()).filter(|s| !s.is_empty()).unwrap_or(UNKNOWN).to_string();
        let instance = node
            .and_then(|n| INSTANCE_KEYS.iter().find_map(|k| n.metadata.get(*k)))
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .unwrap_or(UNKNOWN)
            .to_string();
        Self { node_id, instance }
    }
}

pub struct DiscoveryServer {
    cache: Arc<SnapshotCache>,
    feedback: Arc<FeedbackStore>,
    cfg: ServerConfig,
    shutdown_tx: watch::Sender<bool>,
}

impl DiscoveryServer {
    pub fn new(cache: Arc<SnapshotCache>, feedback: Arc<FeedbackStore>, cfg: ServerConfig) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self { cache, feedback, cfg, shutdown_tx }
    }

    pub fn cache(&self) -> &Arc<SnapshotCache> { &self.cache }
    pub fn feedback(&self) -> &Arc<FeedbackStore> { &self.feedback }
    pub fn config(&self) -> &ServerConfig { &self.cfg }

    /// Ask every stream to stop at its next turn. In-flight sends complete first.
    pub fn shutdown(&self) { self.shutdown_tx.send_replace(true); }

    pub fn is_shutting_down(&self) -> bool { *self.shutdown_tx.borrow() }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> { self.shutdown_tx.subscribe() }
}
