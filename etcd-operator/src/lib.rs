//! etcd Kubernetes Operator
//!
//! This crate provides a Kubernetes operator that runs quorum-replicated
//! etcd clusters: it bootstraps a cluster from a single seed member, grows
//! and shrinks it one member at a time, replaces dead members while a
//! majority survives, and swaps member images in place to upgrade.
//!
//! # Custom Resource Definitions
//!
//! - **EtcdCluster**: desired size, version and pod policy of one cluster
//!
//! # Example
//!
//! ```yaml
//! apiVersion: etcd.database.coreos.com/v1beta2
//! kind: EtcdCluster
//! metadata:
//!   name: example
//! spec:
//!   size: 3
//!   version: "3.5.9"
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cluster;
pub mod config;
pub mod controller;
pub mod crd;
pub mod error;
pub mod etcd;
pub mod k8s;
pub mod member;
pub mod registry;
pub mod security;
pub mod testing;

pub use cluster::{ClusterTracker, Collaborators};
pub use config::OperatorConfig;
pub use crd::{EtcdCluster, EtcdClusterSpec, EtcdClusterStatus};
pub use error::{OperatorError, OperatorResult};
pub use registry::ClusterRegistry;
