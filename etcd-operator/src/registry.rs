//! Process-wide map from cluster identity to its tracker.

use crate::cluster::{ClusterTracker, Collaborators};
use crate::crd::EtcdCluster;
use crate::error::OperatorResult;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use std::sync::Arc;
use tokio::sync::Mutex;

/// A tracker shared between the registry and the pass running on it.
pub type SharedTracker = Arc<Mutex<ClusterTracker>>;

/// Trackers keyed by `namespace/name`.
///
/// Lookups and inserts for different clusters run concurrently. Trackers
/// are never evicted.
pub struct ClusterRegistry {
    trackers: DashMap<String, SharedTracker>,
    deps: Arc<Collaborators>,
}

impl ClusterRegistry {
    /// Create an empty registry whose trackers use `deps`.
    pub fn new(deps: Arc<Collaborators>) -> Self {
        Self {
            trackers: DashMap::new(),
            deps,
        }
    }

    /// Return the tracker for `cluster`, and whether it existed before.
    ///
    /// A new tracker is created from the resource; if that fails nothing is
    /// stored. An existing tracker receives the resource through its update
    /// path.
    pub async fn observe(&self, cluster: &EtcdCluster) -> OperatorResult<(SharedTracker, bool)> {
        let key = cluster.key();
        let existing = match self.trackers.entry(key.clone()) {
            Entry::Occupied(entry) => entry.get().clone(),
            Entry::Vacant(entry) => {
                let tracker = ClusterTracker::new(cluster, self.deps.clone())?;
                tracing::info!(cluster = %key, "Tracking new cluster");
                let tracker = Arc::new(Mutex::new(tracker));
                entry.insert(tracker.clone());
                return Ok((tracker, false));
            }
        };

        existing.lock().await.handle_update(cluster);
        Ok((existing, true))
    }

    /// Tracker for a key, if any.
    pub fn get(&self, key: &str) -> Option<SharedTracker> {
        self.trackers.get(key).map(|r| Arc::clone(&r))
    }

    /// Number of tracked clusters.
    pub fn len(&self) -> usize {
        self.trackers.len()
    }

    /// Whether no cluster is tracked.
    pub fn is_empty(&self) -> bool {
        self.trackers.is_empty()
    }
}
