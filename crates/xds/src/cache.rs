//! Per-node snapshot cache.
//!
//! The cache stores the latest snapshot for each node, keyed by the hash of
//! the node ID, and wakes open discovery streams when it changes.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, trace};

use crate::snapshot::Snapshot;
use crate::watch::{Watch, WatchManager};
use crate::NodeHash;

/// Trait for xDS snapshot caches.
pub trait Cache: Send + Sync {
    /// Get the current snapshot for a node.
    fn get_snapshot(&self, node: NodeHash) -> Option<Arc<Snapshot>>;

    /// Replace the snapshot for a node and notify its watches.
    fn set_snapshot(&self, node: NodeHash, snapshot: Snapshot);

    /// Remove the snapshot for a node.
    fn clear_snapshot(&self, node: NodeHash);
}

/// Snapshot cache backed by `DashMap`.
///
/// `DashMap` references are never held across notification or an `.await`.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    snapshots: DashMap<NodeHash, Arc<Snapshot>>,
    watches: WatchManager,
}

impl SnapshotCache {
    /// Create an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to snapshot changes for a node.
    ///
    /// The watch only sees future updates; read the current snapshot with
    /// [`Cache::get_snapshot`] after creating it.
    #[inline]
    pub fn create_watch(&self, node: NodeHash) -> Watch {
        self.watches.create_watch(node)
    }

    /// Number of live watches for a node.
    #[inline]
    pub fn watch_count(&self, node: NodeHash) -> usize {
        self.watches.watch_count(node)
    }

    /// Number of nodes with a snapshot.
    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    /// Whether no node has a snapshot.
    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }
}

impl Cache for SnapshotCache {
    fn get_snapshot(&self, node: NodeHash) -> Option<Arc<Snapshot>> {
        let result = self.snapshots.get(&node).map(|r| Arc::clone(&*r));
        trace!(node = %node, hit = result.is_some(), "snapshot lookup");
        result
    }

    fn set_snapshot(&self, node: NodeHash, snapshot: Snapshot) {
        let snapshot = Arc::new(snapshot);
        self.snapshots.insert(node, Arc::clone(&snapshot));

        let woken = self.watches.notify(node, Arc::clone(&snapshot));
        debug!(
            node = %node,
            version = %snapshot.version(),
            resources = snapshot.total_resources(),
            watches = woken,
            "set snapshot"
        );
    }

    fn clear_snapshot(&self, node: NodeHash) {
        if self.snapshots.remove(&node).is_some() {
            debug!(node = %node, "cleared snapshot");
        }
    }
}
