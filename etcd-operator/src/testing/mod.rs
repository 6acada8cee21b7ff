//! In-memory collaborators for tests.
//!
//! Every mock appends to one shared [`CallLog`], so a test can assert on the
//! order of calls across etcd, Kubernetes and status persistence.
//!
//! # Example
//!
//! ```ignore
//! use etcd_operator::testing::{Call, MockCollaborators};
//!
//! let mocks = MockCollaborators::new();
//! let deps = mocks.collaborators();
//! // run a pass with `deps`, then:
//! assert!(mocks.log.calls().iter().all(|c| !c.is_mutation()));
//! ```

mod etcd;
mod stores;
mod workloads;

pub use etcd::MockEtcdAdmin;
pub use stores::{MockSecrets, MockStatusStore};
pub use workloads::{MockWorkloads, running_pod};

use crate::cluster::Collaborators;
use crate::crd::ClusterPhase;
use parking_lot::Mutex;
use std::sync::Arc;

/// One recorded collaborator call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    /// etcd member list.
    ListMembers,
    /// etcd member add.
    AddMember {
        /// Peer URL registered.
        peer_url: String,
    },
    /// etcd member remove.
    RemoveMember {
        /// Member id.
        id: u64,
    },
    /// Pod list.
    ListPods,
    /// Pod create.
    CreatePod {
        /// Pod name.
        name: String,
    },
    /// Pod delete.
    DeletePod {
        /// Pod name.
        name: String,
    },
    /// Claim create.
    CreatePvc {
        /// Claim name.
        name: String,
    },
    /// Claim delete.
    DeletePvc {
        /// Claim name.
        name: String,
    },
    /// In-place image swap.
    UpgradePod {
        /// Pod name.
        name: String,
        /// Version written.
        version: String,
    },
    /// Service create.
    CreateService {
        /// Service name.
        name: String,
    },
    /// Event record.
    RecordEvent {
        /// Event reason.
        reason: String,
    },
    /// Status write.
    PersistStatus {
        /// Phase written.
        phase: ClusterPhase,
    },
    /// Secret read.
    ReadSecret {
        /// Secret name.
        name: String,
    },
}

impl Call {
    /// Whether the call changes etcd membership or Kubernetes objects.
    pub fn is_mutation(&self) -> bool {
        matches!(
            self,
            Call::AddMember { .. }
                | Call::RemoveMember { .. }
                | Call::CreatePod { .. }
                | Call::DeletePod { .. }
                | Call::CreatePvc { .. }
                | Call::DeletePvc { .. }
                | Call::UpgradePod { .. }
                | Call::CreateService { .. }
        )
    }
}

/// Shared, ordered record of collaborator calls.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<Call>>>,
}

impl CallLog {
    /// Create an empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a call.
    pub fn record(&self, call: Call) {
        self.calls.lock().push(call);
    }

    /// Snapshot of all calls so far.
    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }

    /// Calls that mutate etcd or Kubernetes.
    pub fn mutations(&self) -> Vec<Call> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.is_mutation())
            .cloned()
            .collect()
    }

    /// Index of the first call matching `pred`.
    pub fn position(&self, pred: impl Fn(&Call) -> bool) -> Option<usize> {
        self.calls.lock().iter().position(pred)
    }

    /// Number of calls matching `pred`.
    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().iter().filter(|c| pred(c)).count()
    }

    /// Forget all calls.
    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

/// All four mocks wired to one call log.
pub struct MockCollaborators {
    /// Shared call log.
    pub log: CallLog,
    /// Pods, claims, services and events.
    pub workloads: Arc<MockWorkloads>,
    /// etcd membership.
    pub etcd: Arc<MockEtcdAdmin>,
    /// TLS secrets.
    pub secrets: Arc<MockSecrets>,
    /// Status writes.
    pub status: Arc<MockStatusStore>,
}

impl MockCollaborators {
    /// Fresh mocks with empty state.
    pub fn new() -> Self {
        let log = CallLog::new();
        Self {
            workloads: Arc::new(MockWorkloads::new(log.clone())),
            etcd: Arc::new(MockEtcdAdmin::new(log.clone())),
            secrets: Arc::new(MockSecrets::new(log.clone())),
            status: Arc::new(MockStatusStore::new(log.clone())),
            log,
        }
    }

    /// Collaborators handing out these mocks.
    pub fn collaborators(&self) -> Arc<Collaborators> {
        Arc::new(Collaborators {
            workloads: self.workloads.clone(),
            etcd: self.etcd.clone(),
            secrets: self.secrets.clone(),
            status_store: self.status.clone(),
            event_source: "etcd-operator-test".to_string(),
        })
    }
}

impl Default for MockCollaborators {
    fn default() -> Self {
        Self::new()
    }
}
