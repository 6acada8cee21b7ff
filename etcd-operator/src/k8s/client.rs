//! kube-rs implementations of [`Workloads`] and [`StatusStore`].

use super::{PodInfo, StatusStore, Workloads, VERSION_ANNOTATION, cluster_selector};
use crate::crd::{EtcdCluster, EtcdClusterStatus};
use crate::error::OperatorResult;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, PersistentVolumeClaim, Pod, Service};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Api, ResourceExt};

fn ignore_not_found(result: Result<impl Sized, kube::Error>) -> OperatorResult<()> {
    match result {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(err)) if err.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// [`Workloads`] backed by the Kubernetes API.
#[derive(Clone)]
pub struct KubeWorkloads {
    client: kube::Client,
}

impl KubeWorkloads {
    /// Create workloads access over `client`.
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }

    fn pods(&self, namespace: &str) -> Api<Pod> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl Workloads for KubeWorkloads {
    async fn list_pods(&self, namespace: &str, cluster: &str) -> OperatorResult<Vec<PodInfo>> {
        let pods = self
            .pods(namespace)
            .list(&ListParams::default().labels(&cluster_selector(cluster)))
            .await?;
        Ok(pods.items.iter().map(PodInfo::from).collect())
    }

    async fn create_pod(&self, namespace: &str, pod: Pod) -> OperatorResult<()> {
        tracing::debug!(pod = %pod.name_any(), namespace = %namespace, "Creating member pod");
        self.pods(namespace)
            .create(&PostParams::default(), &pod)
            .await?;
        Ok(())
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> OperatorResult<()> {
        ignore_not_found(self.pods(namespace).delete(name, &DeleteParams::default()).await)
    }

    async fn create_pvc(&self, namespace: &str, pvc: PersistentVolumeClaim) -> OperatorResult<()> {
        let claims: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        tracing::debug!(pvc = %pvc.name_any(), namespace = %namespace, "Creating member PVC");
        claims.create(&PostParams::default(), &pvc).await?;
        Ok(())
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> OperatorResult<()> {
        let claims: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        ignore_not_found(claims.delete(name, &DeleteParams::default()).await)
    }

    async fn upgrade_pod(
        &self,
        namespace: &str,
        name: &str,
        image: &str,
        version: &str,
    ) -> OperatorResult<()> {
        // strategic merge keys containers by name, so only the etcd image changes
        let patch = serde_json::json!({
            "metadata": { "annotations": { VERSION_ANNOTATION: version } },
            "spec": { "containers": [ { "name": "etcd", "image": image } ] }
        });
        self.pods(namespace)
            .patch(name, &PatchParams::default(), &Patch::Strategic(&patch))
            .await?;
        Ok(())
    }

    async fn create_service(&self, namespace: &str, service: Service) -> OperatorResult<()> {
        let services: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        match services.create(&PostParams::default(), &service).await {
            Ok(_) => {
                tracing::info!(name = %service.name_any(), "Created Service");
                Ok(())
            }
            Err(kube::Error::Api(err)) if err.code == 409 => {
                tracing::debug!(name = %service.name_any(), "Service already exists");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn record_event(&self, namespace: &str, event: Event) -> OperatorResult<()> {
        let events: Api<Event> = Api::namespaced(self.client.clone(), namespace);
        events.create(&PostParams::default(), &event).await?;
        Ok(())
    }
}

/// [`StatusStore`] writing the status subresource.
#[derive(Clone)]
pub struct KubeStatusStore {
    client: kube::Client,
}

impl KubeStatusStore {
    /// Create a status store over `client`.
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusStore for KubeStatusStore {
    async fn persist(&self, cluster: &EtcdCluster, status: &EtcdClusterStatus) -> OperatorResult<()> {
        let namespace = cluster.namespace().unwrap_or_default();
        let api: Api<EtcdCluster> = Api::namespaced(self.client.clone(), &namespace);
        let patch = serde_json::json!({
            "status": status
        });

        api.patch_status(&cluster.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
            .await?;

        tracing::debug!(
            cluster = %cluster.name_any(),
            namespace = %namespace,
            phase = %status.phase,
            conditions = status.conditions.len(),
            "Cluster status updated"
        );
        Ok(())
    }
}
