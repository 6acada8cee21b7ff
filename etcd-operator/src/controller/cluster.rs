//! EtcdCluster controller.
//!
//! Feeds every observed resource version into the registry and runs one
//! pass over the cluster's tracker.

use super::driver::{ensure_setup, run_pass};
use super::{ControllerContext, ReconcileAction};
use crate::crd::EtcdCluster;
use crate::error::{OperatorError, OperatorResult};
use kube::ResourceExt;
use kube::runtime::controller::Action;
use std::sync::Arc;

/// Controller for EtcdCluster resources.
#[derive(Clone)]
pub struct ClusterController {
    ctx: Arc<ControllerContext>,
}

impl ClusterController {
    /// Create a new cluster controller.
    pub fn new(ctx: Arc<ControllerContext>) -> Self {
        Self { ctx }
    }

    /// Reconcile an EtcdCluster resource.
    ///
    /// 1. Get or create the cluster's tracker, applying spec updates
    /// 2. Set the cluster up if this tracker has not yet
    /// 3. Run one reconciliation pass
    ///
    /// A converging cluster is requeued after the short interval, a steady
    /// one after the periodic interval.
    pub async fn reconcile(&self, cluster: Arc<EtcdCluster>) -> OperatorResult<ReconcileAction> {
        let name = cluster.name_any();
        let namespace = cluster
            .namespace()
            .ok_or_else(|| OperatorError::InvalidConfig("EtcdCluster must be namespaced".into()))?;

        tracing::info!(
            name = %name,
            namespace = %namespace,
            size = cluster.spec.size,
            paused = cluster.spec.paused,
            "Reconciling EtcdCluster"
        );

        let (tracker, existed) = self.ctx.registry.observe(&cluster).await?;
        if !existed {
            tracing::debug!(name = %name, namespace = %namespace, "New tracker created");
        }

        let mut tracker = tracker.lock().await;
        let outcome = match ensure_setup(&mut tracker).await {
            Ok(()) => run_pass(&mut tracker).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(()) => Ok(ReconcileAction::requeue_periodic(&self.ctx.config)),
            Err(OperatorError::NeedRequeue) => Ok(ReconcileAction::requeue_short(&self.ctx.config)),
            Err(e) => Err(e),
        }
    }
}

/// Error policy for the EtcdCluster controller.
///
/// Permanently invalid clusters wait for the next change of the resource;
/// everything else is retried after the periodic interval.
pub fn error_policy(
    cluster: Arc<EtcdCluster>,
    error: &OperatorError,
    ctx: Arc<ControllerContext>,
) -> Action {
    tracing::error!(
        name = %cluster.name_any(),
        namespace = %cluster.namespace().unwrap_or_default(),
        error = %error,
        "Reconciliation error"
    );
    if error.is_fatal() {
        return Action::await_change();
    }
    Action::requeue(ctx.config.reconcile_interval())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::OperatorConfig;
    use crate::crd::EtcdClusterSpec;
    use crate::registry::ClusterRegistry;
    use crate::testing::MockCollaborators;
    use std::time::Duration;

    fn context(mocks: &MockCollaborators) -> Arc<ControllerContext> {
        Arc::new(ControllerContext::new(
            ClusterRegistry::new(mocks.collaborators()),
            OperatorConfig::default(),
        ))
    }

    fn cluster(name: &str) -> Arc<EtcdCluster> {
        let mut c = EtcdCluster::new(
            name,
            EtcdClusterSpec {
                size: 3,
                ..Default::default()
            },
        );
        c.metadata.namespace = Some("default".into());
        c.metadata.uid = Some(format!("{}-uid", name));
        Arc::new(c)
    }

    #[test]
    fn fatal_errors_wait_for_a_change() {
        let mocks = MockCollaborators::new();
        let ctx = context(&mocks);

        let action = error_policy(
            cluster("ex"),
            &OperatorError::Fatal("bad peer url".into()),
            ctx.clone(),
        );
        assert_eq!(action, Action::await_change());

        let action = error_policy(cluster("ex"), &OperatorError::LostQuorum, ctx);
        assert_eq!(action, Action::requeue(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn growing_cluster_is_requeued_soon() {
        let mocks = MockCollaborators::new();
        let ctx = context(&mocks);
        let controller = ClusterController::new(ctx.clone());

        // setup creates the seed, the pass that follows adds a second member
        let action = controller.reconcile(cluster("ex")).await.unwrap();
        assert_eq!(action, ReconcileAction::Requeue(Duration::from_secs(20)));
        assert!(ctx.registry.get("default/ex").is_some());
        assert_eq!(mocks.workloads.created_pods().len(), 2);
        assert_eq!(mocks.workloads.services().len(), 2);
    }

    #[tokio::test]
    async fn cluster_scoped_resource_is_rejected() {
        let mocks = MockCollaborators::new();
        let controller = ClusterController::new(context(&mocks));
        let mut c = (*cluster("ex")).clone();
        c.metadata.namespace = None;

        let err = controller.reconcile(Arc::new(c)).await.unwrap_err();
        assert!(matches!(err, OperatorError::InvalidConfig(_)));
        assert!(mocks.log.calls().is_empty());
    }
}
