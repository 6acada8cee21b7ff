//! Cluster lifecycle tests.
//!
//! Run whole passes through the registry and the driver against mock
//! collaborators.

mod common;

use common::{TestCluster, cluster, running_cluster};
use etcd_operator::cluster::SetupError;
use etcd_operator::controller::{ensure_setup, run_pass};
use etcd_operator::crd::{
    ClusterPhase, ConditionType, EtcdClusterStatus, MemberSecret, PodPolicy, StaticTls, TlsPolicy,
};
use etcd_operator::error::OperatorError;
use etcd_operator::k8s::PodPhase;
use etcd_operator::registry::ClusterRegistry;
use etcd_operator::security::TlsData;
use etcd_operator::testing::{Call, MockCollaborators};
use k8s_openapi::api::core::v1::PersistentVolumeClaimSpec;

/// A new cluster is bootstrapped with one seed member.
#[tokio::test]
async fn test_new_cluster_creates_seed_member() {
    let mocks = MockCollaborators::new();
    let registry = ClusterRegistry::new(mocks.collaborators());

    let (tracker, existed) = registry.observe(&cluster("ex", 3)).await.unwrap();
    assert!(!existed);

    let mut tracker = tracker.lock().await;
    tracker.setup().await.unwrap();

    assert_eq!(tracker.status().phase, ClusterPhase::Creating);
    assert_eq!(tracker.status().size, 1);
    assert_eq!(tracker.members().size(), 1);
    assert!(!tracker.members_stale());
    assert_eq!(
        mocks.log.count(|c| matches!(c, Call::CreatePod { .. })),
        1
    );
    assert_eq!(
        mocks.status.history()[0].phase,
        ClusterPhase::Creating,
        "Creating must be persisted before the seed exists"
    );
    let scaling = tracker
        .status()
        .condition(ConditionType::Scaling)
        .unwrap();
    assert_eq!(
        scaling.message,
        "Current cluster size: 0, desired cluster size: 3"
    );

    let seed = &mocks.workloads.created_pods()[0];
    let command = seed.spec.as_ref().unwrap().containers[0]
        .command
        .clone()
        .unwrap_or_default();
    assert!(command.contains(&"--initial-cluster-state=new".to_string()));

    let events = mocks.workloads.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].reason.as_deref(), Some("New Member Added"));
}

/// With persistent volumes the seed gets its claim before its pod.
#[tokio::test]
async fn test_seed_claim_created_with_persistent_volumes() {
    let mocks = MockCollaborators::new();
    let registry = ClusterRegistry::new(mocks.collaborators());
    let mut resource = cluster("ex", 1);
    resource.spec.pod = Some(PodPolicy {
        persistent_volume_claim_spec: Some(PersistentVolumeClaimSpec::default()),
        ..Default::default()
    });
    let (tracker, _) = registry.observe(&resource).await.unwrap();
    let mut tracker = tracker.lock().await;

    ensure_setup(&mut tracker).await.unwrap();

    let seed = tracker.members().names()[0].clone();
    assert_eq!(
        mocks.workloads.pvcs().into_iter().collect::<Vec<_>>(),
        vec![format!("{}-pvc", seed)]
    );
    let claim = mocks
        .log
        .position(|c| matches!(c, Call::CreatePvc { .. }))
        .unwrap();
    let pod = mocks
        .log
        .position(|c| matches!(c, Call::CreatePod { .. }))
        .unwrap();
    assert!(claim < pod);
    assert!(mocks.workloads.pod(&seed).is_some());
}

/// Setup ends with services and a persisted Running phase.
#[tokio::test]
async fn test_setup_starts_running() {
    let mocks = MockCollaborators::new();
    let registry = ClusterRegistry::new(mocks.collaborators());
    let (tracker, _) = registry.observe(&cluster("ex", 3)).await.unwrap();
    let mut tracker = tracker.lock().await;

    ensure_setup(&mut tracker).await.unwrap();

    assert!(tracker.is_set_up());
    assert_eq!(tracker.status().phase, ClusterPhase::Running);
    assert_eq!(tracker.status().service_name, "ex-client");
    assert_eq!(tracker.status().client_port, 2379);
    assert_eq!(
        mocks.workloads.services().into_iter().collect::<Vec<_>>(),
        vec!["ex".to_string(), "ex-client".to_string()]
    );
    let phases: Vec<ClusterPhase> = mocks.status.history().iter().map(|s| s.phase).collect();
    assert_eq!(phases, vec![ClusterPhase::Creating, ClusterPhase::Running]);

    // a second call is a no-op
    mocks.log.clear();
    ensure_setup(&mut tracker).await.unwrap();
    assert!(mocks.log.calls().is_empty());
}

/// A cluster found mid-creation is marked Failed and left alone.
#[tokio::test]
async fn test_interrupted_creation_fails_cluster() {
    let mocks = MockCollaborators::new();
    let registry = ClusterRegistry::new(mocks.collaborators());
    let mut resource = cluster("ex", 3);
    resource.status = Some(EtcdClusterStatus {
        phase: ClusterPhase::Creating,
        ..Default::default()
    });
    let (tracker, _) = registry.observe(&resource).await.unwrap();
    let mut tracker = tracker.lock().await;

    let err = ensure_setup(&mut tracker).await.unwrap_err();
    assert!(matches!(err, OperatorError::AlreadyCreating));
    assert_eq!(tracker.status().phase, ClusterPhase::Failed);
    assert_eq!(tracker.status().reason, "cluster failed to be created");
    assert_eq!(mocks.status.last().unwrap().phase, ClusterPhase::Failed);
    assert!(tracker.is_set_up());

    mocks.log.clear();
    run_pass(&mut tracker).await.unwrap();
    assert!(mocks.log.calls().is_empty());
}

/// An invalid size fails setup.
#[tokio::test]
async fn test_invalid_size_fails_setup() {
    let mocks = MockCollaborators::new();
    let registry = ClusterRegistry::new(mocks.collaborators());
    let (tracker, _) = registry.observe(&cluster("ex", 8)).await.unwrap();
    let mut tracker = tracker.lock().await;

    let err = ensure_setup(&mut tracker).await.unwrap_err();
    assert!(matches!(err, OperatorError::InvalidConfig(_)));
    assert_eq!(tracker.status().phase, ClusterPhase::Failed);
    assert!(mocks.log.mutations().is_empty());
}

/// A failed cluster is not set up again and its status is left alone.
#[tokio::test]
async fn test_failed_cluster_setup_is_unexpected() {
    let mocks = MockCollaborators::new();
    let registry = ClusterRegistry::new(mocks.collaborators());
    let mut resource = cluster("ex", 3);
    resource.status = Some(EtcdClusterStatus {
        phase: ClusterPhase::Failed,
        reason: "cluster failed to be created".into(),
        ..Default::default()
    });
    let (tracker, _) = registry.observe(&resource).await.unwrap();
    let mut tracker = tracker.lock().await;

    let err = tracker.setup().await.unwrap_err();
    assert!(matches!(
        err,
        SetupError::Failed(OperatorError::UnexpectedState(_))
    ));
    assert!(!err.is_retryable());
    assert!(mocks.log.calls().is_empty());

    let err = ensure_setup(&mut tracker).await.unwrap_err();
    assert!(matches!(err, OperatorError::UnexpectedState(_)));
    assert_eq!(tracker.status().phase, ClusterPhase::Failed);
    assert_eq!(tracker.status().reason, "cluster failed to be created");
    assert!(tracker.is_set_up());
    assert!(mocks.status.history().is_empty());
    assert!(mocks.log.mutations().is_empty());
}

/// Setting up a running cluster touches neither workloads nor status.
#[tokio::test]
async fn test_running_cluster_setup_makes_no_calls() {
    let mut test = TestCluster::new(running_cluster("ex", 3), 3, 3, common::VERSION);

    test.tracker.setup().await.unwrap();
    assert!(test.mocks.log.calls().is_empty());
    assert!(test.mocks.status.history().is_empty());
    assert_eq!(test.tracker.status().phase, ClusterPhase::Running);
    assert!(test.tracker.members_stale());
}

/// Client TLS without a member server secret fails the cluster before any
/// secret is read.
#[tokio::test]
async fn test_client_tls_without_server_secret_fails_setup() {
    let mocks = MockCollaborators::new();
    let registry = ClusterRegistry::new(mocks.collaborators());
    let mut resource = cluster("ex", 3);
    resource.spec.tls = Some(TlsPolicy {
        static_tls: Some(StaticTls {
            operator_secret: "etcd-client-tls".into(),
            member: None,
        }),
    });
    let (tracker, _) = registry.observe(&resource).await.unwrap();
    let mut tracker = tracker.lock().await;

    let err = ensure_setup(&mut tracker).await.unwrap_err();
    assert!(matches!(err, OperatorError::InvalidConfig(_)));
    assert_eq!(tracker.status().phase, ClusterPhase::Failed);
    assert!(tracker.is_set_up());
    assert_eq!(
        mocks.log.count(|c| matches!(c, Call::ReadSecret { .. })),
        0
    );
    assert!(mocks.log.mutations().is_empty());
    assert!(mocks.workloads.created_pods().is_empty());
}

/// Missing client certificates leave the phase alone and setup is retried.
#[tokio::test]
async fn test_tls_failure_keeps_phase() {
    let mocks = MockCollaborators::new();
    let registry = ClusterRegistry::new(mocks.collaborators());
    let mut resource = cluster("ex", 3);
    resource.spec.tls = Some(TlsPolicy {
        static_tls: Some(StaticTls {
            operator_secret: "etcd-client-tls".into(),
            member: Some(MemberSecret {
                server_secret: "etcd-server-tls".into(),
                ..Default::default()
            }),
        }),
    });
    let (tracker, _) = registry.observe(&resource).await.unwrap();
    let mut tracker = tracker.lock().await;

    let err = ensure_setup(&mut tracker).await.unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(tracker.status().phase, ClusterPhase::Unset);
    assert!(!tracker.is_set_up());
    assert!(mocks.log.mutations().is_empty());
    assert!(mocks.status.history().is_empty());

    ensure_setup(&mut tracker).await.unwrap_err();
    assert_eq!(
        mocks.log.count(|c| matches!(c, Call::ReadSecret { .. })),
        2
    );
}

/// Growing from three to five members takes one member per pass.
#[tokio::test]
async fn test_scale_up_one_member_per_pass() {
    let mut test = TestCluster::new(running_cluster("ex", 5), 3, 3, common::VERSION);
    ensure_setup(&mut test.tracker).await.unwrap();
    test.mocks.log.clear();

    let err = run_pass(&mut test.tracker).await.unwrap_err();
    assert!(matches!(err, OperatorError::NeedRequeue));
    assert_eq!(
        test.mocks.log.count(|c| matches!(c, Call::AddMember { .. })),
        1
    );
    assert_eq!(test.tracker.status().size, 4);

    let err = run_pass(&mut test.tracker).await.unwrap_err();
    assert!(matches!(err, OperatorError::NeedRequeue));
    assert_eq!(test.tracker.status().size, 5);

    run_pass(&mut test.tracker).await.unwrap();
    let status = test.tracker.status();
    assert_eq!(status.size, 5);
    assert_eq!(status.members.ready.len(), 5);
    assert!(status.condition(ConditionType::Scaling).is_none());
    assert!(status.condition(ConditionType::Available).is_some());
    assert_eq!(status.current_version, common::VERSION);
    assert_eq!(test.mocks.etcd.members().len(), 5);
    assert_eq!(
        test.mocks.status.last().map(|s| s.size),
        Some(5),
        "final size must be persisted"
    );
}

/// With a majority down nothing is touched.
#[tokio::test]
async fn test_lost_quorum_mutates_nothing() {
    let mut test = TestCluster::new(running_cluster("ex", 3), 3, 1, common::VERSION);
    ensure_setup(&mut test.tracker).await.unwrap();
    test.mocks.log.clear();

    let err = run_pass(&mut test.tracker).await.unwrap_err();
    assert!(matches!(err, OperatorError::LostQuorum));
    assert!(test.mocks.log.mutations().is_empty());
    assert!(test.tracker.members_stale());
}

/// With no pod running there is nobody to read membership from.
#[tokio::test]
async fn test_no_running_pods_is_lost_quorum() {
    let mut test = TestCluster::new(running_cluster("ex", 3), 3, 0, common::VERSION);
    ensure_setup(&mut test.tracker).await.unwrap();
    test.mocks.log.clear();

    let err = run_pass(&mut test.tracker).await.unwrap_err();
    assert!(matches!(err, OperatorError::LostQuorum));
    assert_eq!(
        test.mocks.log.count(|c| matches!(c, Call::ListMembers)),
        0
    );
    assert!(test.mocks.log.mutations().is_empty());
    assert!(test.tracker.members_stale());
}

/// A paused cluster is not polled.
#[tokio::test]
async fn test_paused_cluster_is_not_polled() {
    let mut resource = running_cluster("ex", 3);
    resource.spec.paused = true;
    let mut test = TestCluster::new(resource, 3, 3, common::VERSION);
    ensure_setup(&mut test.tracker).await.unwrap();
    test.mocks.log.clear();

    run_pass(&mut test.tracker).await.unwrap();

    assert!(test.tracker.status().control_paused);
    assert_eq!(test.mocks.log.count(|c| *c == Call::ListPods), 0);
    assert_eq!(
        test.mocks.log.count(|c| matches!(c, Call::ListMembers)),
        0
    );
    assert!(test.mocks.log.mutations().is_empty());
    assert!(test.mocks.status.last().unwrap().control_paused);
}

/// A pending pod postpones the pass.
#[tokio::test]
async fn test_pending_pod_postpones_pass() {
    let mut test = TestCluster::new(running_cluster("ex", 5), 3, 3, common::VERSION);
    ensure_setup(&mut test.tracker).await.unwrap();
    let mut pending = etcd_operator::testing::running_pod(
        "ex-pending",
        &common::uid("ex"),
        common::VERSION,
    );
    pending.phase = PodPhase::Pending;
    test.mocks.workloads.add_pod(pending);
    let persisted = test.mocks.status.history().len();
    test.mocks.log.clear();

    let err = run_pass(&mut test.tracker).await.unwrap_err();
    assert!(matches!(err, OperatorError::NeedRequeue));
    assert_eq!(test.mocks.log.calls(), vec![Call::ListPods]);
    assert_eq!(test.mocks.status.history().len(), persisted);
    assert!(test.tracker.members_stale());
}

/// Pods owned by something else and pods being deleted are ignored.
#[tokio::test]
async fn test_foreign_pods_are_ignored() {
    let mut test = TestCluster::new(running_cluster("ex", 3), 3, 3, common::VERSION);
    ensure_setup(&mut test.tracker).await.unwrap();
    test.mocks
        .workloads
        .add_pod(etcd_operator::testing::running_pod(
            "ex-foreign",
            "someone-else",
            common::VERSION,
        ));
    let mut orphan =
        etcd_operator::testing::running_pod("ex-orphan", "unused", common::VERSION);
    orphan.owner_uid = None;
    test.mocks.workloads.add_pod(orphan);
    let mut leaving =
        etcd_operator::testing::running_pod("ex-leaving", &common::uid("ex"), common::VERSION);
    leaving.deleting = true;
    leaving.phase = PodPhase::Pending;
    test.mocks.workloads.add_pod(leaving);

    let polled = test.tracker.poll_pods().await.unwrap();
    assert_eq!(polled.running.len(), 3);
    assert!(polled.pending.is_empty());

    run_pass(&mut test.tracker).await.unwrap();
    assert!(test.mocks.log.mutations().is_empty());
}

/// Members move to a new version one pod per pass.
#[tokio::test]
async fn test_upgrade_one_member_per_pass() {
    let mut resource = running_cluster("ex", 3);
    resource.spec.version = "3.5.10".into();
    let mut test = TestCluster::new(resource, 3, 3, "3.5.9");
    ensure_setup(&mut test.tracker).await.unwrap();
    test.mocks.log.clear();

    let err = run_pass(&mut test.tracker).await.unwrap_err();
    assert!(matches!(err, OperatorError::NeedRequeue));
    assert_eq!(
        test.mocks.log.mutations(),
        vec![Call::UpgradePod {
            name: test.members[0].clone(),
            version: "3.5.10".into()
        }]
    );
    let versions: Vec<Option<String>> = test
        .mocks
        .workloads
        .pods()
        .into_iter()
        .map(|p| p.version)
        .collect();
    assert_eq!(
        versions,
        vec![
            Some("3.5.10".to_string()),
            Some("3.5.9".to_string()),
            Some("3.5.9".to_string())
        ]
    );
    let status = test.tracker.status();
    assert_eq!(status.target_version, "3.5.10");
    assert!(status.condition(ConditionType::Upgrading).is_some());
    assert_eq!(
        test.mocks
            .log
            .count(|c| matches!(c, Call::RecordEvent { reason } if reason == "Member Upgraded")),
        1
    );

    for _ in 0..2 {
        run_pass(&mut test.tracker).await.unwrap_err();
    }
    run_pass(&mut test.tracker).await.unwrap();

    let status = test.tracker.status();
    assert_eq!(status.current_version, "3.5.10");
    assert!(status.target_version.is_empty());
    assert!(status.condition(ConditionType::Upgrading).is_none());
    assert_eq!(
        test.mocks.log.count(|c| matches!(c, Call::UpgradePod { .. })),
        3
    );
}

/// A failed pass re-reads membership on the next one.
#[tokio::test]
async fn test_failed_pass_refreshes_membership() {
    let mut test = TestCluster::new(running_cluster("ex", 4), 3, 3, common::VERSION);
    ensure_setup(&mut test.tracker).await.unwrap();

    test.mocks.etcd.set_unreachable(true);
    let err = run_pass(&mut test.tracker).await.unwrap_err();
    assert!(matches!(err, OperatorError::EtcdError(_)));
    assert!(test.tracker.members_stale());

    test.mocks.etcd.set_unreachable(false);
    test.mocks.log.clear();
    let err = run_pass(&mut test.tracker).await.unwrap_err();
    assert!(matches!(err, OperatorError::NeedRequeue));
    assert!(!test.tracker.members_stale());
    assert_eq!(test.mocks.log.calls()[1], Call::ListMembers);
}

/// Spec updates reach the tracker and apply on the next pass.
#[tokio::test]
async fn test_update_applies_on_next_pass() {
    let mocks = MockCollaborators::new();
    let registry = ClusterRegistry::new(mocks.collaborators());
    let (tracker, _) = registry.observe(&cluster("ex", 1)).await.unwrap();
    {
        let mut tracker = tracker.lock().await;
        ensure_setup(&mut tracker).await.unwrap();
        run_pass(&mut tracker).await.unwrap();
    }
    mocks.log.clear();

    let (same, existed) = registry.observe(&cluster("ex", 2)).await.unwrap();
    assert!(existed);
    assert!(std::sync::Arc::ptr_eq(&tracker, &same));
    assert!(mocks.log.calls().is_empty());

    let mut tracker = tracker.lock().await;
    assert_eq!(tracker.spec().size, 2);
    let err = run_pass(&mut tracker).await.unwrap_err();
    assert!(matches!(err, OperatorError::NeedRequeue));
    assert_eq!(tracker.members().size(), 2);
}

/// Unusable client certificates also defer setup.
#[tokio::test]
async fn test_invalid_certificates_defer_setup() {
    let mocks = MockCollaborators::new();
    mocks.secrets.set(
        "etcd-client-tls",
        TlsData {
            cert: b"cert".to_vec(),
            key: b"key".to_vec(),
            ca: b"ca".to_vec(),
        },
    );
    let registry = ClusterRegistry::new(mocks.collaborators());
    let mut resource = cluster("ex", 3);
    resource.spec.tls = Some(TlsPolicy {
        static_tls: Some(StaticTls {
            operator_secret: "etcd-client-tls".into(),
            member: Some(MemberSecret {
                server_secret: "etcd-server-tls".into(),
                ..Default::default()
            }),
        }),
    });
    let (tracker, _) = registry.observe(&resource).await.unwrap();
    let mut tracker = tracker.lock().await;

    let err = ensure_setup(&mut tracker).await.unwrap_err();
    assert!(matches!(err, OperatorError::InvalidConfig(_)));
    assert_eq!(tracker.status().phase, ClusterPhase::Unset);
    assert!(!tracker.is_set_up());
}

/// A seed that cannot be created fails the cluster.
#[tokio::test]
async fn test_seed_creation_failure_fails_cluster() {
    let mocks = MockCollaborators::new();
    mocks.workloads.fail_creates(true);
    let registry = ClusterRegistry::new(mocks.collaborators());
    let (tracker, _) = registry.observe(&cluster("ex", 3)).await.unwrap();
    let mut tracker = tracker.lock().await;

    ensure_setup(&mut tracker).await.unwrap_err();
    assert_eq!(tracker.status().phase, ClusterPhase::Failed);
    assert!(tracker.members().is_empty());
    let phases: Vec<ClusterPhase> = mocks.status.history().iter().map(|s| s.phase).collect();
    assert_eq!(phases, vec![ClusterPhase::Creating, ClusterPhase::Failed]);
}

/// A failed status write does not fail the pass.
#[tokio::test]
async fn test_status_write_failure_is_not_fatal() {
    let mut test = TestCluster::new(running_cluster("ex", 3), 3, 3, common::VERSION);
    ensure_setup(&mut test.tracker).await.unwrap();
    test.mocks.status.fail_writes(true);

    run_pass(&mut test.tracker).await.unwrap();
    assert!(
        test.mocks
            .log
            .calls()
            .contains(&Call::PersistStatus {
                phase: ClusterPhase::Running
            })
    );
    assert_eq!(test.mocks.status.history().len(), 1);

    // the unwritten status is retried by the next pass
    test.mocks.status.fail_writes(false);
    run_pass(&mut test.tracker).await.unwrap();
    assert_eq!(test.mocks.status.history().len(), 2);
}

/// A new member that has not started yet holds back the next change.
#[tokio::test]
async fn test_starting_member_holds_back_growth() {
    let mut test = TestCluster::new(running_cluster("ex", 5), 3, 3, common::VERSION);
    ensure_setup(&mut test.tracker).await.unwrap();
    test.mocks.workloads.set_new_pod_phase(PodPhase::Pending);

    run_pass(&mut test.tracker).await.unwrap_err();
    test.mocks.log.clear();

    let err = run_pass(&mut test.tracker).await.unwrap_err();
    assert!(matches!(err, OperatorError::NeedRequeue));
    assert!(test.mocks.log.mutations().is_empty());
    assert_eq!(test.tracker.members().size(), 4);
}
