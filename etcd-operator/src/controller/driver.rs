//! One reconciliation pass over a tracked cluster.
//!
//! Callers hold the tracker's lock for the whole pass, so passes of one
//! cluster never interleave.

use crate::cluster::{ClusterTracker, Progress};
use crate::crd::ClusterPhase;
use crate::error::{OperatorError, OperatorResult};

/// Run setup once per tracker.
///
/// A TLS loading failure leaves everything as it was and setup is tried
/// again on the next pass. Any other failure moves the cluster to Failed.
/// On success the services are created and the cluster is Running.
pub async fn ensure_setup(tracker: &mut ClusterTracker) -> OperatorResult<()> {
    if tracker.is_set_up() {
        return Ok(());
    }

    match tracker.setup().await {
        Ok(()) => {
            tracker.start_running().await;
            persist_logged(tracker, "update initial CR status failed").await;
            tracker.finish_setup();
            Ok(())
        }
        Err(e) if e.is_retryable() => {
            tracing::warn!(cluster = %tracker.name(), error = %e, "Cluster setup deferred");
            Err(e.into_inner())
        }
        Err(e) => {
            let e = e.into_inner();
            tracing::error!(cluster = %tracker.name(), error = %e, "Cluster setup failed");
            if tracker.status().phase != ClusterPhase::Failed {
                tracker.fail(e.to_string());
                persist_logged(tracker, "failed to update cluster phase (Failed)").await;
            }
            tracker.finish_setup();
            Err(e)
        }
    }
}

/// Reconcile a set-up cluster once.
///
/// Returns [`OperatorError::NeedRequeue`] while the cluster is still
/// converging: pods are pending, a member was added or removed, or a member
/// was upgraded. Any other error marks membership stale so the next pass
/// re-reads it from etcd.
pub async fn run_pass(tracker: &mut ClusterTracker) -> OperatorResult<()> {
    if tracker.status().phase == ClusterPhase::Failed {
        tracing::debug!(cluster = %tracker.name(), "Skipping failed cluster");
        return Ok(());
    }

    let result = check(tracker).await;
    if let Err(e) = &result {
        if !matches!(e, OperatorError::NeedRequeue) {
            tracing::error!(cluster = %tracker.name(), error = %e, "failed to reconcile");
            tracker.mark_members_stale();
        }
    }
    result
}

async fn check(tracker: &mut ClusterTracker) -> OperatorResult<()> {
    if tracker.spec().paused {
        tracker.pause_control();
        persist_logged(tracker, "paused CR status update failed").await;
        tracing::info!(cluster = %tracker.name(), "control is paused, skipping reconciliation");
        return Ok(());
    }
    tracker.resume_control();

    let pods = tracker.poll_pods().await?;
    if !pods.pending.is_empty() {
        tracing::info!(
            cluster = %tracker.name(),
            running = ?pod_names(&pods.running),
            pending = ?pod_names(&pods.pending),
            "skip reconciliation"
        );
        return Err(OperatorError::NeedRequeue);
    }

    if tracker.members_stale() {
        let known = tracker.running_members(&pods.running);
        if known.is_empty() {
            // No member is left to ask for the membership.
            tracing::warn!(
                cluster = %tracker.name(),
                "no running members to read membership from"
            );
            return Err(OperatorError::LostQuorum);
        }
        tracker.refresh_members(&known).await?;
    }

    let progress = tracker.reconcile(&pods.running).await?;

    tracker.update_member_status(&pods.running);
    persist_logged(tracker, "periodic update CR status failed").await;

    match progress {
        Progress::Steady => Ok(()),
        Progress::MembershipChanged | Progress::Upgraded => Err(OperatorError::NeedRequeue),
    }
}

async fn persist_logged(tracker: &mut ClusterTracker, context: &str) {
    if let Err(e) = tracker.persist_status().await {
        tracing::warn!(cluster = %tracker.name(), error = %e, "{}", context);
    }
}

fn pod_names(pods: &[crate::k8s::PodInfo]) -> Vec<&str> {
    pods.iter().map(|p| p.name.as_str()).collect()
}
