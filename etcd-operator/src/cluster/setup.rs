//! Cluster setup and bootstrap.

use super::ClusterTracker;
use crate::crd::{ClusterPhase, EtcdClusterSpec};
use crate::error::OperatorError;
use crate::k8s::{
    JoinMode, MemberEvent, client_service_name, new_client_service, new_etcd_pod, new_etcd_pvc,
    new_peer_service,
};
use crate::member::{CLIENT_PORT, Member, MemberSet};
use crate::security::load_client_tls;
use thiserror::Error;

/// Why setup stopped.
#[derive(Debug, Error)]
pub enum SetupError {
    /// The operator's client certificates could not be loaded.
    /// Nothing changed; setup can be retried.
    #[error("failed to load etcd client TLS: {0}")]
    Tls(#[source] OperatorError),

    /// The cluster cannot be set up.
    #[error(transparent)]
    Failed(#[from] OperatorError),
}

impl SetupError {
    /// Whether a later attempt may succeed without a phase change.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SetupError::Tls(_))
    }

    /// The underlying error.
    pub fn into_inner(self) -> OperatorError {
        match self {
            SetupError::Tls(e) | SetupError::Failed(e) => e,
        }
    }
}

impl ClusterTracker {
    /// Bring a cluster under management.
    ///
    /// An unset cluster is created with a single seed member. A running
    /// cluster only gets its TLS context. A cluster found mid-creation fails
    /// with [`OperatorError::AlreadyCreating`].
    pub async fn setup(&mut self) -> Result<(), SetupError> {
        let create = match self.status.phase {
            ClusterPhase::Unset => true,
            ClusterPhase::Creating => return Err(OperatorError::AlreadyCreating.into()),
            ClusterPhase::Running => false,
            ClusterPhase::Failed => {
                return Err(OperatorError::UnexpectedState(format!(
                    "unexpected cluster phase: {}",
                    self.status.phase
                ))
                .into());
            }
        };
        if create {
            self.spec.validate()?;
        }

        if let Some(secret) = self.spec.operator_secret() {
            let context = load_client_tls(self.deps.secrets.as_ref(), &self.namespace(), secret)
                .await
                .map_err(SetupError::Tls)?;
            self.tls = Some(context);
        }

        if create {
            self.create().await?;
        }
        Ok(())
    }

    /// Record the outcome of setup so it is not attempted again.
    pub fn finish_setup(&mut self) {
        self.set_up = true;
    }

    /// Create the client and peer services and move the cluster to Running.
    ///
    /// Services that already exist count as created. Other failures are
    /// logged only.
    pub async fn start_running(&mut self) {
        let namespace = self.namespace();
        for service in [
            new_client_service(&self.cluster),
            new_peer_service(&self.cluster),
        ] {
            let service_name = service.metadata.name.clone().unwrap_or_default();
            if let Err(e) = self.deps.workloads.create_service(&namespace, service).await {
                tracing::error!(
                    cluster = %self.name(),
                    service = %service_name,
                    error = %e,
                    "Failed to set up etcd service"
                );
            }
        }

        self.status.service_name = client_service_name(&self.name());
        self.status.client_port = i32::from(CLIENT_PORT);
        self.status.set_phase(ClusterPhase::Running);
        tracing::info!(cluster = %self.name(), "Start running");
    }

    /// Move the cluster to Failed, keeping `reason` in the status.
    pub fn fail(&mut self, reason: impl Into<String>) {
        self.status.set_reason(reason);
        self.status.set_phase(ClusterPhase::Failed);
    }

    async fn create(&mut self) -> Result<(), OperatorError> {
        self.status.set_phase(ClusterPhase::Creating);

        if let Err(e) = self.persist_status().await {
            tracing::error!(
                cluster = %self.name(),
                error = %e,
                "cluster create: failed to update cluster phase (Creating)"
            );
            return Err(e);
        }

        log_cluster_creation(&self.name(), &self.spec);
        self.prepare_seed_member().await
    }

    async fn prepare_seed_member(&mut self) -> Result<(), OperatorError> {
        self.status.set_scaling_up_condition(0, self.spec.size);

        let seed = self.new_member();
        let members: MemberSet = std::iter::once(seed.clone()).collect();
        if let Err(e) = self.create_member_workload(&members, &seed, JoinMode::New).await {
            tracing::error!(
                cluster = %self.name(),
                member = %seed.name,
                error = %e,
                "Failed to create seed member"
            );
            return Err(e);
        }

        self.members = members;
        self.members_stale = false;
        tracing::info!(
            cluster = %self.name(),
            member = %seed.name,
            "Cluster created with seed member"
        );
        self.record_event(&seed.name, MemberEvent::Added).await;

        self.status.size = 1;
        Ok(())
    }

    /// Create the claim (when enabled) and the pod of a member.
    ///
    /// `members` is the membership the new member starts with, itself
    /// included.
    pub(super) async fn create_member_workload(
        &self,
        members: &MemberSet,
        member: &Member,
        join: JoinMode,
    ) -> Result<(), OperatorError> {
        let namespace = self.namespace();

        if let Some(claim_spec) = self
            .spec
            .pod
            .as_ref()
            .and_then(|p| p.persistent_volume_claim_spec.clone())
        {
            let pvc = new_etcd_pvc(member, claim_spec, &self.cluster);
            self.deps.workloads.create_pvc(&namespace, pvc).await?;
        }

        let token = uuid::Uuid::new_v4().to_string();
        let pod = new_etcd_pod(
            member,
            &members.peer_url_pairs(),
            &self.cluster,
            &self.spec,
            join,
            &token,
        );
        self.deps.workloads.create_pod(&namespace, pod).await
    }
}

fn log_cluster_creation(cluster: &str, spec: &EtcdClusterSpec) {
    match serde_json::to_string_pretty(spec) {
        Ok(rendered) => tracing::info!(cluster = %cluster, spec = %rendered, "Creating cluster"),
        Err(e) => tracing::error!(cluster = %cluster, error = %e, "Failed to marshal cluster spec"),
    }
}
