//! etcd Kubernetes Operator binary.
//!
//! This binary runs the etcd operator, which manages EtcdCluster custom
//! resources in a Kubernetes cluster.

use etcd_operator::cluster::Collaborators;
use etcd_operator::config::OperatorConfig;
use etcd_operator::controller::{ClusterController, ControllerContext, cluster_error_policy};
use etcd_operator::crd::EtcdCluster;
use etcd_operator::etcd::GatewayClient;
use etcd_operator::k8s::{KubeStatusStore, KubeWorkloads};
use etcd_operator::registry::ClusterRegistry;
use etcd_operator::security::KubeSecretStore;
use futures::StreamExt;
use kube::runtime::Controller;
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::{Api, Client, CustomResourceExt};
use std::sync::Arc;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("etcd_operator=info".parse()?)
                .add_directive("kube=info".parse()?),
        )
        .init();

    // Check for CRD generation mode
    if std::env::args().any(|arg| arg == "--generate-crds") {
        generate_crds()?;
        return Ok(());
    }

    tracing::info!("Starting etcd Kubernetes Operator");

    let config = OperatorConfig::from_env();
    tracing::info!(config = %serde_json::to_string(&config)?, "Operator configuration loaded");

    // Connect to Kubernetes
    let client = Client::try_default().await?;
    tracing::info!("Connected to Kubernetes cluster");

    let deps = Arc::new(Collaborators {
        workloads: Arc::new(KubeWorkloads::new(client.clone())),
        etcd: Arc::new(GatewayClient::new(
            config.dial_timeout(),
            config.request_timeout(),
        )),
        secrets: Arc::new(KubeSecretStore::new(client.clone())),
        status_store: Arc::new(KubeStatusStore::new(client.clone())),
        event_source: config.event_source.clone(),
    });

    let clusters: Api<EtcdCluster> = match config.watch_namespace.as_deref() {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    };

    let ctx = Arc::new(ControllerContext::new(ClusterRegistry::new(deps), config));
    run_cluster_controller(clusters, ctx).await
}

/// Run the EtcdCluster controller until a shutdown signal arrives.
async fn run_cluster_controller(
    clusters: Api<EtcdCluster>,
    ctx: Arc<ControllerContext>,
) -> anyhow::Result<()> {
    tracing::info!("Starting EtcdCluster controller");

    let controller = ClusterController::new(ctx.clone());

    Controller::new(clusters, WatcherConfig::default())
        .shutdown_on_signal()
        .run(
            move |cluster, _ctx| {
                let controller = controller.clone();
                async move { controller.reconcile(cluster).await.map(Action::from) }
            },
            cluster_error_policy,
            ctx,
        )
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    tracing::debug!(
                        cluster = %obj.name,
                        namespace = ?obj.namespace,
                        ?action,
                        "Reconciled cluster"
                    );
                }
                Err(e) => {
                    tracing::error!(error = %e, "Cluster controller stream error");
                }
            }
        })
        .await;

    tracing::info!("EtcdCluster controller stopped");
    Ok(())
}

/// Generate CRD YAML.
fn generate_crds() -> anyhow::Result<()> {
    println!("---");
    println!("{}", serde_yaml::to_string(&EtcdCluster::crd())?);
    Ok(())
}
