//! EtcdCluster Custom Resource Definition.
//!
//! Defines the desired shape of an etcd cluster: size, image, pod policy and
//! TLS policy. The observed side lives in [`super::status`].

use super::status::EtcdClusterStatus;
use crate::error::{OperatorError, OperatorResult};
use k8s_openapi::api::core::v1::{
    Affinity, EnvVar, PersistentVolumeClaimSpec, PodAffinityTerm, PodAntiAffinity,
    PodSecurityContext, ResourceRequirements, Toleration,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, OwnerReference};
use kube::{CustomResource, Resource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Image repository used when the spec leaves it empty.
pub const DEFAULT_REPOSITORY: &str = "quay.io/coreos/etcd";

/// etcd version used when the spec leaves it empty.
pub const DEFAULT_VERSION: &str = "3.5.9";

/// Largest supported cluster size.
pub const MAX_CLUSTER_SIZE: usize = 7;

/// Label key that ties pods to their cluster.
pub const CLUSTER_LABEL: &str = "etcd_cluster";

/// EtcdCluster is the Schema for the etcdclusters API.
///
/// The operator drives the live etcd membership toward `size` members running
/// `version`, one membership or version change per reconciliation pass.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "etcd.database.coreos.com",
    version = "v1beta2",
    kind = "EtcdCluster",
    plural = "etcdclusters",
    shortname = "etcd",
    namespaced,
    status = "EtcdClusterStatus",
    printcolumn = r#"{"name":"Size", "type":"integer", "jsonPath":".spec.size"}"#,
    printcolumn = r#"{"name":"Version", "type":"string", "jsonPath":".status.currentVersion"}"#,
    printcolumn = r#"{"name":"Phase", "type":"string", "jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EtcdClusterSpec {
    /// Expected number of members. Valid range is 1 to 7.
    pub size: usize,

    /// Repository hosting the etcd images. Defaults to `quay.io/coreos/etcd`.
    #[serde(default)]
    pub repository: String,

    /// Expected etcd version in semver form, for example "3.5.9".
    /// A leading "v" is stripped.
    #[serde(default)]
    pub version: String,

    /// Pause operator control of the cluster.
    #[serde(default)]
    pub paused: bool,

    /// Policy for the pods the operator creates.
    /// Changes do not affect pods that already exist.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pod: Option<PodPolicy>,

    /// TLS configuration.
    #[serde(rename = "TLS", default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsPolicy>,
}

/// Policy applied to every etcd pod of the cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PodPolicy {
    /// Labels attached to the pods. `app` and `etcd_*` are reserved.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Node labels a node must carry for the pod to be scheduled on it.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub node_selector: BTreeMap<String, String>,

    /// Scheduling constraints.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub affinity: Option<Affinity>,

    /// Deprecated. Translated into a required pod anti-affinity on the
    /// cluster label when `affinity` is unset.
    #[serde(default)]
    pub anti_affinity: bool,

    /// Resource requirements of the etcd container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resources: Option<ResourceRequirements>,

    /// Pod tolerations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tolerations: Vec<Toleration>,

    /// Extra environment for the etcd container.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub etcd_env: Vec<EnvVar>,

    /// Claim template for the data volume. An emptyDir is used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistent_volume_claim_spec: Option<PersistentVolumeClaimSpec>,

    /// Annotations attached to the pods. `etcd.version` is reserved.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,

    /// Image of the DNS-wait init container.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub busybox_image: Option<String>,

    /// Security context of the pod.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_context: Option<PodSecurityContext>,

    /// Seconds the init container waits for the member DNS name. 0 waits forever.
    #[serde(rename = "DNSTimeoutInSecond", default)]
    pub dns_timeout_in_second: i64,

    /// Cluster domain appended to member host names, e.g. ".cluster.local".
    #[serde(rename = "ClusterDomain", default)]
    pub cluster_domain: String,
}

/// TLS policy of the cluster.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct TlsPolicy {
    /// Statically provisioned certificates.
    #[serde(rename = "static", default, skip_serializing_if = "Option::is_none")]
    pub static_tls: Option<StaticTls>,
}

/// Certificates stored in secrets ahead of time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StaticTls {
    /// Secrets mounted into every member pod.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub member: Option<MemberSecret>,

    /// Secret holding the client certificate the operator uses.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub operator_secret: String,
}

/// Per-member TLS secrets.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MemberSecret {
    /// Secret for peer traffic.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub peer_secret: String,

    /// Secret for client traffic served by the member.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub server_secret: String,
}

impl TlsPolicy {
    fn member(&self) -> Option<&MemberSecret> {
        self.static_tls.as_ref().and_then(|s| s.member.as_ref())
    }
}

impl EtcdClusterSpec {
    /// Return a fully populated copy: repository and version defaulted, the
    /// version stripped of a leading "v", and the legacy anti-affinity flag
    /// turned into an explicit rule keyed by the cluster label.
    pub fn resolved(&self, cluster_name: &str) -> Self {
        let mut spec = self.clone();

        if spec.repository.is_empty() {
            spec.repository = DEFAULT_REPOSITORY.to_string();
        }
        if spec.version.is_empty() {
            spec.version = DEFAULT_VERSION.to_string();
        }
        spec.version = spec.version.trim_start_matches('v').to_string();

        if let Some(pod) = spec.pod.as_mut() {
            if pod.anti_affinity && pod.affinity.is_none() {
                pod.affinity = Some(cluster_anti_affinity(cluster_name));
            }
        }

        spec
    }

    /// Check the fields that can make a cluster unbuildable.
    pub fn validate(&self) -> OperatorResult<()> {
        if self.size < 1 || self.size > MAX_CLUSTER_SIZE {
            return Err(OperatorError::InvalidConfig(format!(
                "size must be between 1 and {}, got {}",
                MAX_CLUSTER_SIZE, self.size
            )));
        }
        // Members serve client TLS from the server secret.
        if self.is_secure_client() && !self.is_secure_server() {
            return Err(OperatorError::InvalidConfig(
                "an operator secret requires member.serverSecret".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether mutation-relevant fields match. Other fields may differ.
    pub fn same_shape(&self, other: &Self) -> bool {
        self.size == other.size && self.paused == other.paused && self.version == other.version
    }

    /// Whether the operator talks to the cluster over TLS.
    pub fn is_secure_client(&self) -> bool {
        self.tls
            .as_ref()
            .and_then(|t| t.static_tls.as_ref())
            .is_some_and(|s| !s.operator_secret.is_empty())
    }

    /// Whether members talk to each other over TLS.
    pub fn is_secure_peer(&self) -> bool {
        self.tls
            .as_ref()
            .and_then(TlsPolicy::member)
            .is_some_and(|m| !m.peer_secret.is_empty())
    }

    /// Whether members serve clients over TLS.
    pub fn is_secure_server(&self) -> bool {
        self.tls
            .as_ref()
            .and_then(TlsPolicy::member)
            .is_some_and(|m| !m.server_secret.is_empty())
    }

    /// Secret holding the operator's client certificate, if any.
    pub fn operator_secret(&self) -> Option<&str> {
        self.tls
            .as_ref()
            .and_then(|t| t.static_tls.as_ref())
            .map(|s| s.operator_secret.as_str())
            .filter(|s| !s.is_empty())
    }

    /// Member TLS secrets, if any.
    pub fn member_secrets(&self) -> Option<&MemberSecret> {
        self.tls.as_ref().and_then(TlsPolicy::member)
    }

    /// Whether member data lives on persistent volume claims.
    pub fn is_pv_enabled(&self) -> bool {
        self.pod
            .as_ref()
            .is_some_and(|p| p.persistent_volume_claim_spec.is_some())
    }

    /// Cluster domain appended to member host names.
    pub fn cluster_domain(&self) -> &str {
        self.pod
            .as_ref()
            .map(|p| p.cluster_domain.as_str())
            .unwrap_or("")
    }

    /// Container image for the configured repository and version.
    pub fn image(&self) -> String {
        image_name(&self.repository, &self.version)
    }
}

/// Container image reference for an etcd version.
pub fn image_name(repository: &str, version: &str) -> String {
    format!("{}:v{}", repository, version)
}

fn cluster_anti_affinity(cluster_name: &str) -> Affinity {
    Affinity {
        pod_anti_affinity: Some(PodAntiAffinity {
            required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                label_selector: Some(LabelSelector {
                    match_labels: Some(BTreeMap::from([(
                        CLUSTER_LABEL.to_string(),
                        cluster_name.to_string(),
                    )])),
                    ..Default::default()
                }),
                topology_key: "kubernetes.io/hostname".to_string(),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

impl EtcdCluster {
    /// Registry key of the cluster: `namespace/name`.
    pub fn key(&self) -> String {
        cluster_key(&self.namespace().unwrap_or_default(), &self.name_any())
    }

    /// Controller owner reference pointing at this cluster.
    pub fn as_owner(&self) -> OwnerReference {
        OwnerReference {
            api_version: EtcdCluster::api_version(&()).to_string(),
            kind: EtcdCluster::kind(&()).to_string(),
            name: self.name_any(),
            uid: self.uid().unwrap_or_default(),
            controller: Some(true),
            ..Default::default()
        }
    }
}

/// Join a namespace and a name into a registry key.
pub fn cluster_key(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}
