//! Per-cluster state tracking.
//!
//! A [`ClusterTracker`] owns one cluster's resolved desired spec, its
//! observed status, the last known etcd membership and the client TLS
//! context. It is mutated only by the update path and by one pass at a time;
//! callers serialize access per cluster.

mod reconcile;
mod setup;

pub use reconcile::{PolledPods, Progress, has_quorum};
pub use setup::SetupError;

use crate::crd::{EtcdCluster, EtcdClusterSpec, EtcdClusterStatus};
use crate::error::{OperatorError, OperatorResult};
use crate::etcd::{EtcdAdmin, TlsContext};
use crate::k8s::{MemberEvent, StatusStore, Workloads, new_member_event};
use crate::member::{MAX_NAME_LENGTH, Member, MemberSet, unique_member_name};
use crate::security::SecretStore;
use kube::ResourceExt;
use std::sync::Arc;

/// External systems a tracker talks to.
pub struct Collaborators {
    /// Pods, claims, services and events.
    pub workloads: Arc<dyn Workloads>,
    /// etcd membership API.
    pub etcd: Arc<dyn EtcdAdmin>,
    /// Source of the operator's client certificates.
    pub secrets: Arc<dyn SecretStore>,
    /// Persistence of observed status.
    pub status_store: Arc<dyn StatusStore>,
    /// Component name stamped on recorded events.
    pub event_source: String,
}

/// State of one etcd cluster.
pub struct ClusterTracker {
    cluster: EtcdCluster,
    spec: EtcdClusterSpec,
    status: EtcdClusterStatus,
    persisted: Option<EtcdClusterStatus>,
    members: MemberSet,
    members_stale: bool,
    tls: Option<TlsContext>,
    set_up: bool,
    deps: Arc<Collaborators>,
}

impl ClusterTracker {
    /// Create a tracker for a newly observed cluster.
    ///
    /// Names too long to leave room for member suffixes are rejected.
    pub fn new(cluster: &EtcdCluster, deps: Arc<Collaborators>) -> OperatorResult<Self> {
        let name = cluster.name_any();
        if name.len() > MAX_NAME_LENGTH {
            return Err(OperatorError::Fatal(format!(
                "cluster name {} is longer than {} characters",
                name, MAX_NAME_LENGTH
            )));
        }

        Ok(Self {
            spec: cluster.spec.resolved(&name),
            status: cluster.status.clone().unwrap_or_default(),
            persisted: cluster.status.clone(),
            cluster: cluster.clone(),
            members: MemberSet::new(),
            members_stale: true,
            tls: None,
            set_up: false,
            deps,
        })
    }

    /// Cluster name.
    pub fn name(&self) -> String {
        self.cluster.name_any()
    }

    /// Cluster namespace.
    pub fn namespace(&self) -> String {
        self.cluster.namespace().unwrap_or_default()
    }

    /// Resolved desired spec.
    pub fn spec(&self) -> &EtcdClusterSpec {
        &self.spec
    }

    /// Observed status, including changes not yet persisted.
    pub fn status(&self) -> &EtcdClusterStatus {
        &self.status
    }

    /// Known etcd membership.
    pub fn members(&self) -> &MemberSet {
        &self.members
    }

    /// Whether membership must be re-read from etcd before the next decision.
    pub fn members_stale(&self) -> bool {
        self.members_stale
    }

    /// Force a membership refresh on the next pass.
    pub fn mark_members_stale(&mut self) {
        self.members_stale = true;
    }

    /// Whether setup has run to completion, successfully or not.
    pub fn is_set_up(&self) -> bool {
        self.set_up
    }

    /// Feed a newer version of the resource into the tracker.
    ///
    /// Only size, paused and version matter. A change is stored and applied
    /// by the next pass; other edits are ignored.
    pub fn handle_update(&mut self, cluster: &EtcdCluster) {
        let name = self.name();
        let new_spec = cluster.spec.resolved(&name);

        if new_spec.same_shape(&self.spec) {
            if new_spec != self.spec {
                tracing::info!(
                    cluster = %name,
                    namespace = %self.namespace(),
                    "Ignoring update that changes no size, paused or version"
                );
            }
            return;
        }

        if let Err(e) = new_spec.validate() {
            tracing::error!(cluster = %name, error = %e, "Rejecting cluster update");
            self.status.set_reason(e.to_string());
            return;
        }

        log_spec_update(&name, &self.spec, &new_spec);
        self.cluster = cluster.clone();
        self.spec = new_spec;
    }

    /// Pause control in the observed status.
    pub fn pause_control(&mut self) {
        self.status.pause_control();
    }

    /// Resume control in the observed status.
    pub fn resume_control(&mut self) {
        self.status.resume_control();
    }

    /// Write the status unless it equals what was last written.
    pub async fn persist_status(&mut self) -> OperatorResult<()> {
        if self.persisted.as_ref() == Some(&self.status) {
            return Ok(());
        }
        self.deps
            .status_store
            .persist(&self.cluster, &self.status)
            .await?;
        self.persisted = Some(self.status.clone());
        Ok(())
    }

    /// A fresh member of this cluster with a unique name.
    fn new_member(&self) -> Member {
        self.member_named(unique_member_name(&self.name()))
    }

    /// A member of this cluster with the cluster's TLS flags and domain.
    fn member_named(&self, name: impl Into<String>) -> Member {
        Member {
            name: name.into(),
            namespace: self.namespace(),
            id: None,
            secure_peer: self.spec.is_secure_peer(),
            secure_client: self.spec.is_secure_client(),
            cluster_domain: self.spec.cluster_domain().to_string(),
        }
    }

    /// Record a member event. Failures are logged only.
    async fn record_event(&self, member: &str, event: MemberEvent) {
        let record = new_member_event(&self.cluster, member, &event, &self.deps.event_source);
        if let Err(e) = self
            .deps
            .workloads
            .record_event(&self.namespace(), record)
            .await
        {
            tracing::error!(
                cluster = %self.name(),
                member = %member,
                reason = event.reason(),
                error = %e,
                "Failed to record member event"
            );
        }
    }
}

fn log_spec_update(cluster: &str, old: &EtcdClusterSpec, new: &EtcdClusterSpec) {
    let render = |spec: &EtcdClusterSpec| {
        serde_json::to_string_pretty(spec).unwrap_or_else(|e| format!("<unprintable spec: {}>", e))
    };
    tracing::info!(
        cluster = %cluster,
        old_spec = %render(old),
        new_spec = %render(new),
        "Cluster spec updated"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockCollaborators;

    fn cluster(name: &str, size: usize) -> EtcdCluster {
        let mut c = EtcdCluster::new(
            name,
            EtcdClusterSpec {
                size,
                ..Default::default()
            },
        );
        c.metadata.namespace = Some("default".into());
        c
    }

    #[test]
    fn long_names_are_fatal() {
        let mocks = MockCollaborators::new();
        let name = "a".repeat(MAX_NAME_LENGTH + 1);
        let err = ClusterTracker::new(&cluster(&name, 3), mocks.collaborators())
            .err()
            .unwrap();
        assert!(err.is_fatal());

        let name = "a".repeat(MAX_NAME_LENGTH);
        assert!(ClusterTracker::new(&cluster(&name, 3), mocks.collaborators()).is_ok());
    }

    #[test]
    fn update_applies_only_shape_changes() {
        let mocks = MockCollaborators::new();
        let mut tracker = ClusterTracker::new(&cluster("ex", 3), mocks.collaborators()).unwrap();

        let mut incidental = cluster("ex", 3);
        incidental.spec.repository = "mirror.local/etcd".into();
        tracker.handle_update(&incidental);
        assert_eq!(tracker.spec().repository, crate::crd::DEFAULT_REPOSITORY);

        tracker.handle_update(&cluster("ex", 5));
        assert_eq!(tracker.spec().size, 5);
        assert!(mocks.log.calls().is_empty());
    }

    #[test]
    fn invalid_update_keeps_old_spec() {
        let mocks = MockCollaborators::new();
        let mut tracker = ClusterTracker::new(&cluster("ex", 3), mocks.collaborators()).unwrap();

        tracker.handle_update(&cluster("ex", 9));
        assert_eq!(tracker.spec().size, 3);
        assert!(tracker.status().reason.contains("size"));
    }

    #[test]
    fn members_inherit_cluster_settings() {
        let mocks = MockCollaborators::new();
        let mut c = cluster("ex", 3);
        c.spec.pod = Some(crate::crd::PodPolicy {
            cluster_domain: ".cluster.local".into(),
            ..Default::default()
        });
        let tracker = ClusterTracker::new(&c, mocks.collaborators()).unwrap();
        let m = tracker.new_member();
        assert!(m.name.starts_with("ex-"));
        assert_eq!(m.cluster_domain, ".cluster.local");
        assert!(!m.secure_client);
    }
}
