//! Common test utilities for etcd-operator tests.

use etcd_operator::cluster::ClusterTracker;
use etcd_operator::crd::{ClusterPhase, EtcdCluster, EtcdClusterSpec, EtcdClusterStatus};
use etcd_operator::member::{Member, MemberSet};
use etcd_operator::testing::{MockCollaborators, running_pod};

/// Version every seeded pod runs unless a test says otherwise.
pub const VERSION: &str = "3.5.9";

/// A cluster resource in the default namespace with a stable uid.
pub fn cluster(name: &str, size: usize) -> EtcdCluster {
    let mut c = EtcdCluster::new(
        name,
        EtcdClusterSpec {
            size,
            ..Default::default()
        },
    );
    c.metadata.namespace = Some("default".into());
    c.metadata.uid = Some(uid(name));
    c
}

/// The same cluster, already reported Running.
#[allow(dead_code)]
pub fn running_cluster(name: &str, size: usize) -> EtcdCluster {
    let mut c = cluster(name, size);
    c.status = Some(EtcdClusterStatus {
        phase: ClusterPhase::Running,
        ..Default::default()
    });
    c
}

/// Uid given to a cluster by [`cluster`].
pub fn uid(name: &str) -> String {
    format!("{}-uid", name)
}

/// Name of the `i`th seeded member.
#[allow(dead_code)]
pub fn member_name(cluster: &str, i: usize) -> String {
    format!("{}-member{:04}", cluster, i)
}

/// A tracker over a Running cluster whose etcd membership is already seeded.
#[allow(dead_code)]
pub struct TestCluster {
    /// Mocks behind the tracker.
    pub mocks: MockCollaborators,
    /// Tracker under test.
    pub tracker: ClusterTracker,
    /// Seeded member names, in order.
    pub members: Vec<String>,
    /// etcd ids of the seeded members, in order.
    pub ids: Vec<u64>,
}

#[allow(dead_code)]
impl TestCluster {
    /// `members` etcd members of which the first `running` have running
    /// pods at `version`. Membership is not read yet.
    pub fn new(resource: EtcdCluster, members: usize, running: usize, version: &str) -> Self {
        let mocks = MockCollaborators::new();
        let name = resource.metadata.name.clone().unwrap_or_default();

        let mut names = Vec::with_capacity(members);
        let mut ids = Vec::with_capacity(members);
        for i in 0..members {
            let member_name = member_name(&name, i);
            let peer_url = Member::new(member_name.clone(), "default").peer_url();
            ids.push(mocks.etcd.add_existing(&member_name, &peer_url));
            if i < running {
                mocks
                    .workloads
                    .add_pod(running_pod(&member_name, &uid(&name), version));
            }
            names.push(member_name);
        }

        let tracker = ClusterTracker::new(&resource, mocks.collaborators())
            .expect("Failed to create tracker");

        Self {
            mocks,
            tracker,
            members: names,
            ids,
        }
    }

    /// Like [`TestCluster::new`], with setup finished and membership read
    /// from etcd. The call log starts empty.
    pub async fn ready(resource: EtcdCluster, members: usize, running: usize) -> Self {
        let mut test = Self::new(resource, members, running, VERSION);
        test.tracker.setup().await.expect("Failed to set up tracker");
        test.tracker.finish_setup();

        let known: MemberSet = test
            .members
            .iter()
            .map(|n| Member::new(n.clone(), "default"))
            .collect();
        test.tracker
            .refresh_members(&known)
            .await
            .expect("Failed to read membership");
        test.mocks.log.clear();
        test
    }

    /// Members named after the currently running pods.
    pub fn running_set(&self) -> MemberSet {
        self.tracker.running_members(&self.mocks.workloads.pods())
    }
}
