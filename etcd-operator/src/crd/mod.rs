//! Custom Resource Definitions for the etcd operator.
//!
//! - [`EtcdCluster`]: desired shape of an etcd cluster, with
//!   [`EtcdClusterStatus`] as its observed state.

mod cluster;
mod status;

pub use cluster::{
    CLUSTER_LABEL, DEFAULT_REPOSITORY, DEFAULT_VERSION, EtcdCluster, EtcdClusterSpec,
    MAX_CLUSTER_SIZE, MemberSecret, PodPolicy, StaticTls, TlsPolicy, cluster_key, image_name,
};
pub use status::{
    ClusterCondition, ClusterPhase, ConditionStatus, ConditionType, EtcdClusterStatus,
    MembersStatus,
};
