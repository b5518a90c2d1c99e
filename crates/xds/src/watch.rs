//! Watch system for snapshot update notifications.
//!
//! Every open discovery stream holds a [`Watch`] on its node. Publishing a
//! snapshot wakes all watches on that node; a stream that falls behind only
//! misses intermediate snapshots, never the latest one, because it re-reads
//! the cache when woken.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::{NodeHash, Snapshot};

/// Unique identifier for a watch subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WatchId(u64);

impl WatchId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for WatchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "watch-{}", self.0)
    }
}

/// A subscription to snapshot updates for one node.
///
/// Dropping the watch unsubscribes it; the manager prunes it on the next
/// notification.
#[derive(Debug)]
pub struct Watch {
    id: WatchId,
    receiver: mpsc::Receiver<Arc<Snapshot>>,
}

impl Watch {
    /// The watch identifier.
    #[inline]
    pub fn id(&self) -> WatchId {
        self.id
    }

    /// Wait for the next snapshot update.
    ///
    /// Returns `None` once the manager is gone.
    pub async fn recv(&mut self) -> Option<Arc<Snapshot>> {
        self.receiver.recv().await
    }
}

#[derive(Debug, Clone)]
struct WatchSender {
    id: WatchId,
    sender: mpsc::Sender<Arc<Snapshot>>,
}

/// Manager for watch subscriptions.
#[derive(Debug)]
pub struct WatchManager {
    watches: std::sync::Mutex<HashMap<NodeHash, Vec<WatchSender>>>,
    channel_buffer: usize,
}

impl Default for WatchManager {
    fn default() -> Self {
        Self::new()
    }
}

impl WatchManager {
    /// Create a watch manager with the default channel buffer.
    pub fn new() -> Self {
        Self::with_buffer_size(16)
    }

    /// Create a watch manager with a custom channel buffer size.
    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            watches: std::sync::Mutex::new(HashMap::new()),
            channel_buffer: buffer_size.max(1),
        }
    }

    /// Subscribe to updates for a node.
    pub fn create_watch(&self, node: NodeHash) -> Watch {
        let id = WatchId::next();
        let (sender, receiver) = mpsc::channel(self.channel_buffer);

        self.watches
            .lock()
            .expect("watch lock poisoned")
            .entry(node)
            .or_default()
            .push(WatchSender { id, sender });

        debug!(watch_id = %id, node = %node, "created watch");
        Watch { id, receiver }
    }

    /// Notify all watches for a node, pruning closed ones.
    pub fn notify(&self, node: NodeHash, snapshot: Arc<Snapshot>) -> usize {
        let senders: Vec<WatchSender> = {
            let watches = self.watches.lock().expect("watch lock poisoned");
            watches.get(&node).cloned().unwrap_or_default()
        };

        let mut closed = Vec::new();
        for sender in &senders {
            match sender.sender.try_send(Arc::clone(&snapshot)) {
                Ok(()) => {}
                // The receiver already has a pending wake-up.
                Err(mpsc::error::TrySendError::Full(_)) => {
                    trace!(watch_id = %sender.id, "watch channel full, skipping update");
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(sender.id),
            }
        }

        if !closed.is_empty() {
            let mut watches = self.watches.lock().expect("watch lock poisoned");
            if let Some(senders) = watches.get_mut(&node) {
                senders.retain(|s| !closed.contains(&s.id));
            }
            debug!(count = closed.len(), "removed closed watches");
        }

        senders.len() - closed.len()
    }

    /// Number of live watches for a node.
    pub fn watch_count(&self, node: NodeHash) -> usize {
        let watches = self.watches.lock().expect("watch lock poisoned");
        watches.get(&node).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn notify_wakes_watch() {
        let manager = WatchManager::new();
        let node = NodeHash::from_id("client");

        let mut watch = manager.create_watch(node);
        let delivered = manager.notify(node, Arc::new(Snapshot::builder().version("v1").build()));

        assert_eq!(delivered, 1);
        assert_eq!(watch.recv().await.unwrap().version(), "v1");
    }

    #[tokio::test]
    async fn dropped_watch_is_pruned() {
        let manager = WatchManager::new();
        let node = NodeHash::from_id("client");

        let watch = manager.create_watch(node);
        assert_eq!(manager.watch_count(node), 1);
        drop(watch);

        manager.notify(node, Arc::new(Snapshot::builder().version("v1").build()));
        assert_eq!(manager.watch_count(node), 0);
    }

    #[tokio::test]
    async fn full_channel_keeps_watch() {
        let manager = WatchManager::with_buffer_size(1);
        let node = NodeHash::from_id("client");
        let mut watch = manager.create_watch(node);

        for v in ["v1", "v2", "v3"] {
            manager.notify(node, Arc::new(Snapshot::builder().version(v).build()));
        }

        assert_eq!(manager.watch_count(node), 1);
        assert_eq!(watch.recv().await.unwrap().version(), "v1");
    }

    #[test]
    fn other_nodes_are_not_notified() {
        let manager = WatchManager::new();
        let _watch = manager.create_watch(NodeHash::from_id("client"));

        let delivered = manager.notify(
            NodeHash::from_id("server"),
            Arc::new(Snapshot::builder().version("v1").build()),
        );
        assert_eq!(delivered, 0);
    }
}
