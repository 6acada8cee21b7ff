//! Membership reconciliation and rolling upgrades.
//!
//! Every call makes at most one membership or version change. Larger
//! changes converge over several passes, each re-deriving its decision from
//! freshly polled pods and etcd membership.

use super::ClusterTracker;
use crate::crd::ConditionType;
use crate::error::{OperatorError, OperatorResult};
use crate::k8s::{JoinMode, MemberEvent, PodInfo, PodPhase};
use crate::member::{Member, MemberSet, member_name_from_peer_url};

/// Pods of a cluster split by phase.
#[derive(Debug, Clone, Default)]
pub struct PolledPods {
    /// Pods in the Running phase.
    pub running: Vec<PodInfo>,
    /// Pods in the Pending phase.
    pub pending: Vec<PodInfo>,
}

/// What a reconciliation changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Progress {
    /// Nothing; the cluster matches its spec.
    Steady,
    /// A member was added or removed, or a stray pod deleted.
    MembershipChanged,
    /// One member moved to the desired version.
    Upgraded,
}

/// Whether `live` running members out of `members` still form a majority.
pub fn has_quorum(live: usize, members: usize) -> bool {
    live >= members / 2 + 1
}

impl ClusterTracker {
    /// List the cluster's pods, skipping ones being deleted and ones owned
    /// by something else.
    pub async fn poll_pods(&self) -> OperatorResult<PolledPods> {
        let name = self.name();
        let uid = self.cluster.metadata.uid.clone();
        let pods = self
            .deps
            .workloads
            .list_pods(&self.namespace(), &name)
            .await?;

        let mut polled = PolledPods::default();
        for pod in pods {
            // deleted pods can briefly report Pending
            if pod.deleting {
                continue;
            }
            let Some(owner) = pod.owner_uid.as_deref() else {
                tracing::warn!(cluster = %name, pod = %pod.name, "Ignoring pod without owner");
                continue;
            };
            if Some(owner) != uid.as_deref() {
                tracing::warn!(
                    cluster = %name,
                    pod = %pod.name,
                    owner = %owner,
                    "Ignoring pod owned by another object"
                );
                continue;
            }
            match pod.phase {
                PodPhase::Running => polled.running.push(pod),
                PodPhase::Pending => polled.pending.push(pod),
                PodPhase::Other => {}
            }
        }
        Ok(polled)
    }

    /// Members named after running pods.
    pub fn running_members(&self, pods: &[PodInfo]) -> MemberSet {
        pods.iter().map(|p| self.member_named(p.name.clone())).collect()
    }

    /// Re-read membership from etcd through the endpoints of `known`.
    pub async fn refresh_members(&mut self, known: &MemberSet) -> OperatorResult<()> {
        let listed = self
            .deps
            .etcd
            .list_members(&known.client_urls(), self.tls.as_ref())
            .await?;

        let mut members = MemberSet::new();
        for m in listed {
            let peer_url = m.peer_urls.first().ok_or_else(|| {
                OperatorError::Fatal(format!("etcd member {:x} has no peer URL", m.id))
            })?;
            let mut member = self.member_named(member_name_from_peer_url(peer_url)?);
            member.id = Some(m.id);
            members.add(member);
        }

        tracing::debug!(cluster = %self.name(), members = %members, "Refreshed membership");
        self.members = members;
        self.members_stale = false;
        Ok(())
    }

    /// Drive membership and version toward the spec, one change at a time.
    ///
    /// `pods` are the running pods of the cluster. The status size follows
    /// the membership whatever the outcome.
    pub async fn reconcile(&mut self, pods: &[PodInfo]) -> OperatorResult<Progress> {
        tracing::info!(cluster = %self.name(), "Start reconciling");
        let result = self.reconcile_shape(pods).await;
        self.status.size = self.members.size();
        tracing::info!(cluster = %self.name(), "Finish reconciling");
        result
    }

    async fn reconcile_shape(&mut self, pods: &[PodInfo]) -> OperatorResult<Progress> {
        let running = self.running_members(pods);
        if !running.is_equal(&self.members) || self.members.size() != self.spec.size {
            let changed = self.reconcile_members(&running).await?;
            return Ok(if changed {
                Progress::MembershipChanged
            } else {
                Progress::Steady
            });
        }
        self.status.clear_condition(ConditionType::Scaling);

        let version = self.spec.version.clone();
        if pods.len() == self.spec.size {
            if let Some(outdated) = pods
                .iter()
                .find(|p| p.version.as_deref() != Some(version.as_str()))
            {
                self.status.upgrade_version_to(&version);
                self.upgrade_one_member(outdated).await?;
                return Ok(Progress::Upgraded);
            }
        }
        self.status.clear_condition(ConditionType::Upgrading);
        self.status.set_version(&version);
        self.status.set_ready_condition();
        Ok(Progress::Steady)
    }

    /// Reconcile running pods against etcd membership.
    ///
    /// Stray pods are deleted. With every member running the size is
    /// adjusted; with one dead member and quorum intact the dead member is
    /// removed; below quorum nothing is touched and
    /// [`OperatorError::LostQuorum`] is returned. Returns whether anything
    /// changed.
    pub async fn reconcile_members(&mut self, running: &MemberSet) -> OperatorResult<bool> {
        let name = self.name();
        tracing::info!(cluster = %name, running = %running, "Running members");
        tracing::info!(cluster = %name, members = %self.members, "Cluster membership");

        let unknown = running.diff(&self.members);
        if !unknown.is_empty() {
            tracing::info!(cluster = %name, pods = %unknown, "Removing unexpected pods");
            for m in unknown.iter() {
                self.deps
                    .workloads
                    .delete_pod(&self.namespace(), &m.name)
                    .await?;
            }
        }
        let live = running.diff(&unknown);

        if live.size() == self.members.size() {
            let resized = self.resize().await?;
            return Ok(resized || !unknown.is_empty());
        }

        if !has_quorum(live.size(), self.members.size()) {
            tracing::warn!(
                cluster = %name,
                live = live.size(),
                members = self.members.size(),
                "Lost quorum"
            );
            return Err(OperatorError::LostQuorum);
        }

        tracing::info!(cluster = %name, "Removing one dead member");
        let dead = self.members.diff(&live).pick_one().cloned();
        match dead {
            Some(dead) => {
                self.remove_dead_member(dead).await?;
                Ok(true)
            }
            None => Ok(!unknown.is_empty()),
        }
    }

    /// Add or remove one member toward the desired size. Returns whether a
    /// member changed.
    pub async fn resize(&mut self) -> OperatorResult<bool> {
        let current = self.members.size();
        let desired = self.spec.size;
        if current == desired {
            return Ok(false);
        }
        if current < desired {
            self.add_one_member().await?;
        } else {
            self.remove_one_member().await?;
        }
        Ok(true)
    }

    async fn add_one_member(&mut self) -> OperatorResult<()> {
        self.status
            .set_scaling_up_condition(self.members.size(), self.spec.size);

        let mut member = self.new_member();
        // etcd must know the peer before the new member starts
        let id = self
            .deps
            .etcd
            .add_member(
                &self.members.client_urls(),
                self.tls.as_ref(),
                &member.peer_url(),
            )
            .await
            .inspect_err(|e| {
                tracing::error!(
                    cluster = %self.name(),
                    member = %member.name,
                    error = %e,
                    "Failed to add new member"
                )
            })?;
        member.id = Some(id);
        self.members.add(member.clone());

        let members = self.members.clone();
        if let Err(e) = self
            .create_member_workload(&members, &member, JoinMode::Existing)
            .await
        {
            tracing::error!(
                cluster = %self.name(),
                member = %member.name,
                error = %e,
                "Failed to create member's pod"
            );
            return Err(e);
        }

        tracing::info!(cluster = %self.name(), member = %member.name, id = id, "Added member");
        self.record_event(&member.name, MemberEvent::Added).await;
        Ok(())
    }

    async fn remove_one_member(&mut self) -> OperatorResult<()> {
        self.status
            .set_scaling_down_condition(self.members.size(), self.spec.size);

        match self.members.pick_one().cloned() {
            Some(member) => self.remove_member(member).await,
            None => Ok(()),
        }
    }

    async fn remove_dead_member(&mut self, member: Member) -> OperatorResult<()> {
        tracing::info!(cluster = %self.name(), member = %member.name, "Removing dead member");
        self.record_event(&member.name, MemberEvent::Replacing).await;
        self.remove_member(member).await
    }

    /// Remove a member from etcd, then delete its pod and claim.
    async fn remove_member(&mut self, member: Member) -> OperatorResult<()> {
        let name = self.name();
        let id = match member.id {
            Some(id) => Some(id),
            None => self.resolve_member_id(&member.name).await?,
        };

        match id {
            Some(id) => {
                let removed = self
                    .deps
                    .etcd
                    .remove_member(&self.members.client_urls(), self.tls.as_ref(), id)
                    .await;
                match removed {
                    Ok(()) => {}
                    Err(OperatorError::MemberNotFound(_)) => {
                        tracing::info!(
                            cluster = %name,
                            member = %member.name,
                            "etcd member has already been removed"
                        );
                    }
                    Err(e) => {
                        tracing::error!(
                            cluster = %name,
                            member = %member.name,
                            error = %e,
                            "Remove member failed"
                        );
                        return Err(e);
                    }
                }
            }
            None => tracing::info!(
                cluster = %name,
                member = %member.name,
                "Member is not registered with etcd"
            ),
        }

        self.members.remove(&member.name);
        self.record_event(&member.name, MemberEvent::Removed).await;

        let namespace = self.namespace();
        self.deps
            .workloads
            .delete_pod(&namespace, &member.name)
            .await?;
        if self.spec.is_pv_enabled() {
            self.deps
                .workloads
                .delete_pvc(&namespace, &member.pvc_name())
                .await?;
        }

        tracing::info!(cluster = %name, member = %member.name, id = ?id, "Removed member");
        Ok(())
    }

    /// Look up the etcd id of a member known only by name.
    async fn resolve_member_id(&self, member_name: &str) -> OperatorResult<Option<u64>> {
        let listed = self
            .deps
            .etcd
            .list_members(&self.members.client_urls(), self.tls.as_ref())
            .await?;

        for m in listed {
            if let Some(peer_url) = m.peer_urls.first() {
                if member_name_from_peer_url(peer_url)? == member_name {
                    return Ok(Some(m.id));
                }
            }
        }
        Ok(None)
    }

    async fn upgrade_one_member(&mut self, pod: &PodInfo) -> OperatorResult<()> {
        let version = self.spec.version.clone();
        self.status.set_upgrading_condition(&version);

        let from = pod.version.clone().unwrap_or_default();
        tracing::info!(
            cluster = %self.name(),
            member = %pod.name,
            from = %from,
            to = %version,
            "Upgrading etcd member"
        );

        self.deps
            .workloads
            .upgrade_pod(&self.namespace(), &pod.name, &self.spec.image(), &version)
            .await?;

        tracing::info!(cluster = %self.name(), member = %pod.name, "Finished upgrading etcd member");
        self.record_event(&pod.name, MemberEvent::Upgraded { from, to: version })
            .await;
        Ok(())
    }

    /// Record which running pods are ready.
    pub fn update_member_status(&mut self, running: &[PodInfo]) {
        let (ready, unready): (Vec<&PodInfo>, Vec<&PodInfo>) =
            running.iter().partition(|p| p.ready);
        self.status.members.ready = ready.into_iter().map(|p| p.name.clone()).collect();
        self.status.members.unready = unready.into_iter().map(|p| p.name.clone()).collect();
    }
}
