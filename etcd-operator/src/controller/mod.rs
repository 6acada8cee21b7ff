//! Kubernetes controller for EtcdCluster resources.
//!
//! - [`ClusterController`]: entry point for kube-runtime
//! - [`ensure_setup`] and [`run_pass`]: one pass over a tracked cluster
//!
//! # Usage with kube-runtime
//!
//! ```ignore
//! use etcd_operator::controller::{ClusterController, cluster_error_policy};
//!
//! Controller::new(clusters, watcher_config)
//!     .run(|cluster, ctx| async move {
//!         let controller = ClusterController::new(ctx.clone());
//!         controller.reconcile(cluster).await.map(Into::into)
//!     }, cluster_error_policy, context)
//!     .for_each(|_| futures::future::ready(()))
//!     .await;
//! ```

mod cluster;
mod driver;

pub use cluster::{ClusterController, error_policy as cluster_error_policy};
pub use driver::{ensure_setup, run_pass};

use crate::config::OperatorConfig;
use crate::registry::ClusterRegistry;
use kube::runtime::controller::Action;
use std::time::Duration;

/// Shared context for the controller.
pub struct ControllerContext {
    /// Trackers of every observed cluster.
    pub registry: ClusterRegistry,
    /// Operator settings.
    pub config: OperatorConfig,
}

impl ControllerContext {
    /// Create a new controller context.
    pub fn new(registry: ClusterRegistry, config: OperatorConfig) -> Self {
        Self { registry, config }
    }
}

/// Result type for reconciliation actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Requeue after the specified duration.
    Requeue(Duration),
    /// Wait for the next change of the resource.
    Done,
}

impl ReconcileAction {
    /// Requeue after the periodic interval.
    pub fn requeue_periodic(config: &OperatorConfig) -> Self {
        Self::Requeue(config.reconcile_interval())
    }

    /// Requeue after the short interval used while a cluster is converging.
    pub fn requeue_short(config: &OperatorConfig) -> Self {
        Self::Requeue(config.requeue_interval())
    }
}

impl From<ReconcileAction> for Action {
    fn from(action: ReconcileAction) -> Self {
        match action {
            ReconcileAction::Requeue(duration) => Action::requeue(duration),
            ReconcileAction::Done => Action::await_change(),
        }
    }
}
