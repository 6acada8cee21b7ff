//! Kubernetes side of the operator.
//!
//! [`Workloads`] covers every pod, claim, service and event call the
//! reconciler makes; [`StatusStore`] persists the observed status. Both have
//! kube-backed implementations here and in-memory fakes in
//! [`crate::testing`].

mod client;
mod resources;

pub use client::{KubeStatusStore, KubeWorkloads};
pub use resources::{
    APP_LABEL, JoinMode, VERSION_ANNOTATION, client_service_name, cluster_labels,
    cluster_selector, new_client_service, new_etcd_pod, new_etcd_pvc, new_member_event,
    new_peer_service,
};

use crate::crd::{EtcdCluster, EtcdClusterStatus};
use crate::error::OperatorResult;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, PersistentVolumeClaim, Pod, Service};

/// Phase a pod reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    /// Containers started.
    Running,
    /// Not yet scheduled or started.
    Pending,
    /// Succeeded, Failed or Unknown.
    Other,
}

/// The parts of a pod the reconciler reasons about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodInfo {
    /// Pod name, equal to the member name.
    pub name: String,
    /// Pod namespace.
    pub namespace: String,
    /// UID of the first owner reference.
    pub owner_uid: Option<String>,
    /// Whether a deletion timestamp is set.
    pub deleting: bool,
    /// Reported phase.
    pub phase: PodPhase,
    /// Whether the Ready condition is True.
    pub ready: bool,
    /// Version recorded in the `etcd.version` annotation.
    pub version: Option<String>,
}

impl From<&Pod> for PodInfo {
    fn from(pod: &Pod) -> Self {
        let status = pod.status.as_ref();
        let phase = match status.and_then(|s| s.phase.as_deref()) {
            Some("Running") => PodPhase::Running,
            Some("Pending") => PodPhase::Pending,
            _ => PodPhase::Other,
        };
        let ready = status
            .and_then(|s| s.conditions.as_ref())
            .is_some_and(|conditions| {
                conditions
                    .iter()
                    .any(|c| c.type_ == "Ready" && c.status == "True")
            });

        PodInfo {
            name: pod.metadata.name.clone().unwrap_or_default(),
            namespace: pod.metadata.namespace.clone().unwrap_or_default(),
            owner_uid: pod
                .metadata
                .owner_references
                .as_ref()
                .and_then(|refs| refs.first())
                .map(|r| r.uid.clone()),
            deleting: pod.metadata.deletion_timestamp.is_some(),
            phase,
            ready,
            version: pod
                .metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(VERSION_ANNOTATION))
                .cloned(),
        }
    }
}

/// Member lifecycle events recorded on the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberEvent {
    /// A member joined.
    Added,
    /// A member was removed on scale down.
    Removed,
    /// A dead member was removed and will be replaced.
    Replacing,
    /// A member moved to a new version.
    Upgraded {
        /// Version before the swap.
        from: String,
        /// Version after the swap.
        to: String,
    },
}

impl MemberEvent {
    /// Event reason.
    pub fn reason(&self) -> &'static str {
        match self {
            MemberEvent::Added => "New Member Added",
            MemberEvent::Removed => "Member Removed",
            MemberEvent::Replacing => "Replacing Dead Member",
            MemberEvent::Upgraded { .. } => "Member Upgraded",
        }
    }

    /// Event message for `member`.
    pub fn message(&self, member: &str) -> String {
        match self {
            MemberEvent::Added => format!("New member {} added to cluster", member),
            MemberEvent::Removed => {
                format!("Existing member {} removed from the cluster", member)
            }
            MemberEvent::Replacing => format!("The dead member {} is being replaced", member),
            MemberEvent::Upgraded { from, to } => {
                format!("Member {} upgraded from {} to {}", member, from, to)
            }
        }
    }
}

/// Pods, claims, services and events of etcd clusters.
///
/// Deletes treat a missing object as success; service creation treats an
/// existing service as success.
#[async_trait]
pub trait Workloads: Send + Sync {
    /// Pods carrying the cluster's labels.
    async fn list_pods(&self, namespace: &str, cluster: &str) -> OperatorResult<Vec<PodInfo>>;

    /// Create a member pod.
    async fn create_pod(&self, namespace: &str, pod: Pod) -> OperatorResult<()>;

    /// Delete a member pod.
    async fn delete_pod(&self, namespace: &str, name: &str) -> OperatorResult<()>;

    /// Create a member data claim.
    async fn create_pvc(&self, namespace: &str, pvc: PersistentVolumeClaim) -> OperatorResult<()>;

    /// Delete a member data claim.
    async fn delete_pvc(&self, namespace: &str, name: &str) -> OperatorResult<()>;

    /// Swap the image of a running pod and record the new version.
    async fn upgrade_pod(
        &self,
        namespace: &str,
        name: &str,
        image: &str,
        version: &str,
    ) -> OperatorResult<()>;

    /// Create a service.
    async fn create_service(&self, namespace: &str, service: Service) -> OperatorResult<()>;

    /// Record an event.
    async fn record_event(&self, namespace: &str, event: Event) -> OperatorResult<()>;
}

/// Persistence of observed status.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Write `status` as the status of `cluster`.
    async fn persist(&self, cluster: &EtcdCluster, status: &EtcdClusterStatus) -> OperatorResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference, Time};
    use std::collections::BTreeMap;

    #[test]
    fn pod_info_reads_owner_phase_and_version() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("ex-abc".into()),
                namespace: Some("default".into()),
                owner_references: Some(vec![OwnerReference {
                    uid: "uid-1".into(),
                    ..Default::default()
                }]),
                annotations: Some(BTreeMap::from([(
                    VERSION_ANNOTATION.to_string(),
                    "3.5.9".to_string(),
                )])),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some("Running".into()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".into(),
                    status: "True".into(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        };

        let info = PodInfo::from(&pod);
        assert_eq!(info.name, "ex-abc");
        assert_eq!(info.owner_uid.as_deref(), Some("uid-1"));
        assert_eq!(info.phase, PodPhase::Running);
        assert!(info.ready);
        assert!(!info.deleting);
        assert_eq!(info.version.as_deref(), Some("3.5.9"));
    }

    #[test]
    fn pod_info_defaults() {
        let pod = Pod {
            metadata: ObjectMeta {
                name: Some("ex-abc".into()),
                deletion_timestamp: Some(Time(chrono::Utc::now())),
                ..Default::default()
            },
            ..Default::default()
        };
        let info = PodInfo::from(&pod);
        assert_eq!(info.phase, PodPhase::Other);
        assert!(info.deleting);
        assert!(info.owner_uid.is_none());
        assert!(!info.ready);
    }

    #[test]
    fn event_texts() {
        let upgraded = MemberEvent::Upgraded {
            from: "3.4.13".into(),
            to: "3.5.9".into(),
        };
        assert_eq!(upgraded.reason(), "Member Upgraded");
        assert_eq!(
            upgraded.message("ex-a"),
            "Member ex-a upgraded from 3.4.13 to 3.5.9"
        );
        assert_eq!(
            MemberEvent::Replacing.message("ex-b"),
            "The dead member ex-b is being replaced"
        );
    }
}
