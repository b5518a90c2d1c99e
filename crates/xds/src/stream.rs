//! Per-stream state for aggregated discovery.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use crate::{NodeHash, TypeUrl};

/// Unique identifier for a discovery stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(u64);

impl StreamId {
    /// Generate a new unique stream ID.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream-{}", self.0)
    }
}

/// Generate a nonce for a discovery response.
///
/// Format is `{timestamp_hex}-{counter_hex}`, unique within the process.
pub fn generate_nonce() -> String {
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let count = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("{timestamp:x}-{count:x}")
}

/// What the client has asked for on one type URL.
#[derive(Debug, Clone, Default)]
pub struct Subscription {
    /// Requested names; empty means all resources of the type.
    pub names: Vec<String>,
    /// Version of the last response sent, or acknowledged at stream start.
    pub sent_version: Option<String>,
    /// Nonce of the last response sent.
    pub nonce: Option<String>,
    /// Whether a request is waiting for a response.
    pub open: bool,
}

impl Subscription {
    /// Whether `nonce` answers the latest response.
    ///
    /// An empty nonce (first request of a type) is always current.
    pub fn is_current(&self, nonce: &str) -> bool {
        nonce.is_empty() || self.nonce.as_deref() == Some(nonce)
    }
}

/// State of one aggregated discovery stream.
///
/// Owned by the stream task, so no interior locking.
#[derive(Debug)]
pub struct StreamContext {
    id: StreamId,
    node: Option<(String, NodeHash)>,
    created_at: Instant,
    requests: u64,
    responses: u64,
    subscriptions: HashMap<TypeUrl, Subscription>,
}

impl Default for StreamContext {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamContext {
    /// Create a context for a new stream.
    pub fn new() -> Self {
        Self {
            id: StreamId::next(),
            node: None,
            created_at: Instant::now(),
            requests: 0,
            responses: 0,
            subscriptions: HashMap::new(),
        }
    }

    /// The stream ID.
    #[inline]
    pub fn id(&self) -> StreamId {
        self.id
    }

    /// The node ID, once identified.
    pub fn node_id(&self) -> Option<&str> {
        self.node.as_ref().map(|(id, _)| id.as_str())
    }

    /// The node hash, once identified.
    pub fn node_hash(&self) -> Option<NodeHash> {
        self.node.as_ref().map(|(_, hash)| *hash)
    }

    /// Record the node identity from the first request.
    pub fn set_node(&mut self, node_id: impl Into<String>) -> NodeHash {
        let node_id = node_id.into();
        let hash = NodeHash::from_id(&node_id);
        self.node = Some((node_id, hash));
        hash
    }

    /// Subscription state for a type, created on first use.
    pub fn subscription(&mut self, type_url: &TypeUrl) -> &mut Subscription {
        self.subscriptions.entry(type_url.clone()).or_default()
    }

    /// Types with a request waiting for a response.
    pub fn open_types(&self) -> Vec<TypeUrl> {
        let mut types: Vec<_> = self
            .subscriptions
            .iter()
            .filter(|(_, sub)| sub.open)
            .map(|(type_url, _)| type_url.clone())
            .collect();
        types.sort();
        types
    }

    /// Record a request.
    pub fn record_request(&mut self) {
        self.requests += 1;
    }

    /// Record a response.
    pub fn record_response(&mut self) {
        self.responses += 1;
    }

    /// Requests received.
    #[inline]
    pub fn request_count(&self) -> u64 {
        self.requests
    }

    /// Responses sent.
    #[inline]
    pub fn response_count(&self) -> u64 {
        self.responses
    }

    /// Stream age.
    #[inline]
    pub fn duration(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}
