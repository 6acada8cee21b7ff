//! Builders for the Kubernetes objects an etcd cluster consists of.

use super::MemberEvent;
use crate::crd::{CLUSTER_LABEL, EtcdCluster, EtcdClusterSpec};
use crate::member::{CLIENT_PORT, Member, PEER_PORT};
use crate::security::{CLIENT_CA_KEY, CLIENT_CERT_KEY, CLIENT_KEY_KEY};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, Event, EventSource, ExecAction,
    ObjectReference, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, Pod, PodSpec, Probe, SecretVolumeSource, Service,
    ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;
use std::collections::BTreeMap;

/// Label marking every object the operator creates.
pub const APP_LABEL: &str = "app";

/// Annotation recording the etcd version a pod runs.
pub const VERSION_ANNOTATION: &str = "etcd.version";

const APP_NAME: &str = "etcd";
const ETCD_CONTAINER: &str = "etcd";
const DATA_VOLUME: &str = "etcd-data";
const DATA_MOUNT: &str = "/var/etcd";
const DATA_DIR: &str = "/var/etcd/data";
const PEER_TLS_VOLUME: &str = "member-peer-tls";
const PEER_TLS_DIR: &str = "/etc/etcdtls/member/peer-tls";
const SERVER_TLS_VOLUME: &str = "member-server-tls";
const SERVER_TLS_DIR: &str = "/etc/etcdtls/member/server-tls";
const OPERATOR_TLS_VOLUME: &str = "etcd-client-tls";
const OPERATOR_TLS_DIR: &str = "/etc/etcdtls/operator/etcd-tls";
const DEFAULT_BUSYBOX_IMAGE: &str = "busybox:1.28.0-glibc";

/// How a member's etcd process joins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinMode {
    /// Bootstraps a fresh cluster.
    New,
    /// Joins a cluster that already has quorum.
    Existing,
}

impl JoinMode {
    /// Value of etcd's `--initial-cluster-state` flag.
    pub fn as_str(&self) -> &'static str {
        match self {
            JoinMode::New => "new",
            JoinMode::Existing => "existing",
        }
    }
}

/// Labels shared by every object of a cluster.
pub fn cluster_labels(cluster_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_LABEL.to_string(), APP_NAME.to_string()),
        (CLUSTER_LABEL.to_string(), cluster_name.to_string()),
    ])
}

/// Label selector matching the pods of a cluster.
pub fn cluster_selector(cluster_name: &str) -> String {
    format!("{}={},{}={}", APP_LABEL, APP_NAME, CLUSTER_LABEL, cluster_name)
}

/// Name of the service clients connect to.
pub fn client_service_name(cluster_name: &str) -> String {
    format!("{}-client", cluster_name)
}

fn owned_meta(cluster: &EtcdCluster, name: String) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: cluster.namespace(),
        labels: Some(cluster_labels(&cluster.name_any())),
        owner_references: Some(vec![cluster.as_owner()]),
        ..Default::default()
    }
}

fn service_port(name: &str, port: u16) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port: i32::from(port),
        target_port: Some(IntOrString::Int(i32::from(port))),
        protocol: Some("TCP".to_string()),
        ..Default::default()
    }
}

/// Service balancing client traffic over all members.
pub fn new_client_service(cluster: &EtcdCluster) -> Service {
    let name = cluster.name_any();
    Service {
        metadata: owned_meta(cluster, client_service_name(&name)),
        spec: Some(ServiceSpec {
            ports: Some(vec![service_port("client", CLIENT_PORT)]),
            selector: Some(cluster_labels(&name)),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Headless service giving each member a stable DNS name.
pub fn new_peer_service(cluster: &EtcdCluster) -> Service {
    let name = cluster.name_any();
    Service {
        metadata: owned_meta(cluster, name.clone()),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            ports: Some(vec![
                service_port("client", CLIENT_PORT),
                service_port("peer", PEER_PORT),
            ]),
            selector: Some(cluster_labels(&name)),
            publish_not_ready_addresses: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Data claim of a member.
pub fn new_etcd_pvc(
    member: &Member,
    spec: PersistentVolumeClaimSpec,
    cluster: &EtcdCluster,
) -> PersistentVolumeClaim {
    PersistentVolumeClaim {
        metadata: owned_meta(cluster, member.pvc_name()),
        spec: Some(spec),
        ..Default::default()
    }
}

fn etcd_command(
    member: &Member,
    initial_cluster: &[String],
    join: JoinMode,
    token: &str,
) -> Vec<String> {
    let listen_scheme = |secure: bool| if secure { "https" } else { "http" };
    let mut args = vec![
        "/usr/local/bin/etcd".to_string(),
        format!("--data-dir={}", DATA_DIR),
        format!("--name={}", member.name),
        format!("--initial-advertise-peer-urls={}", member.peer_url()),
        format!(
            "--listen-peer-urls={}://0.0.0.0:{}",
            listen_scheme(member.secure_peer),
            PEER_PORT
        ),
        format!(
            "--listen-client-urls={}://0.0.0.0:{}",
            listen_scheme(member.secure_client),
            CLIENT_PORT
        ),
        format!("--advertise-client-urls={}", member.client_url()),
        format!("--initial-cluster={}", initial_cluster.join(",")),
        format!("--initial-cluster-state={}", join.as_str()),
    ];

    if member.secure_peer {
        args.extend([
            "--peer-client-cert-auth=true".to_string(),
            format!("--peer-trusted-ca-file={}/peer-ca.crt", PEER_TLS_DIR),
            format!("--peer-cert-file={}/peer.crt", PEER_TLS_DIR),
            format!("--peer-key-file={}/peer.key", PEER_TLS_DIR),
        ]);
    }
    if member.secure_client {
        args.extend([
            "--client-cert-auth=true".to_string(),
            format!("--trusted-ca-file={}/server-ca.crt", SERVER_TLS_DIR),
            format!("--cert-file={}/server.crt", SERVER_TLS_DIR),
            format!("--key-file={}/server.key", SERVER_TLS_DIR),
        ]);
    }
    if join == JoinMode::New {
        args.push(format!("--initial-cluster-token={}", token));
    }
    args
}

fn health_probe(secure_client: bool, period_seconds: i32) -> Probe {
    let check = if secure_client {
        format!(
            "ETCDCTL_API=3 etcdctl --endpoints=https://localhost:{port} \
             --cert={dir}/{cert} --key={dir}/{key} --cacert={dir}/{ca} endpoint status",
            port = CLIENT_PORT,
            dir = OPERATOR_TLS_DIR,
            cert = CLIENT_CERT_KEY,
            key = CLIENT_KEY_KEY,
            ca = CLIENT_CA_KEY,
        )
    } else {
        "ETCDCTL_API=3 etcdctl endpoint status".to_string()
    };

    Probe {
        exec: Some(ExecAction {
            command: Some(vec!["/bin/sh".into(), "-ec".into(), check]),
        }),
        initial_delay_seconds: Some(10),
        timeout_seconds: Some(10),
        period_seconds: Some(period_seconds),
        failure_threshold: Some(3),
        ..Default::default()
    }
}

fn dns_wait_script(timeout_seconds: i64, addr: &str) -> String {
    format!(
        "TIMEOUT_READY={timeout}
while ( ! nslookup {addr} )
do
  # zero never times out
  TIMEOUT_READY=$(( TIMEOUT_READY-1 ))
  if [ $TIMEOUT_READY -eq 0 ];
  then
    echo \"Timed out waiting for DNS entry\"
    exit 1
  fi
  sleep 1
done",
        timeout = timeout_seconds,
        addr = addr
    )
}

fn secret_volume(name: &str, secret: &str) -> Volume {
    Volume {
        name: name.to_string(),
        secret: Some(SecretVolumeSource {
            secret_name: Some(secret.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    }
}

fn mount(name: &str, path: &str) -> VolumeMount {
    VolumeMount {
        name: name.to_string(),
        mount_path: path.to_string(),
        ..Default::default()
    }
}

/// Pod running one etcd member.
///
/// `spec` must be resolved. `initial_cluster` holds the `name=peerURL` pairs
/// the member starts with; `token` is only used when bootstrapping.
pub fn new_etcd_pod(
    member: &Member,
    initial_cluster: &[String],
    cluster: &EtcdCluster,
    spec: &EtcdClusterSpec,
    join: JoinMode,
    token: &str,
) -> Pod {
    let cluster_name = cluster.name_any();
    let policy = spec.pod.clone().unwrap_or_default();

    let mut volume_mounts = vec![mount(DATA_VOLUME, DATA_MOUNT)];
    let data_volume = if spec.is_pv_enabled() {
        Volume {
            name: DATA_VOLUME.to_string(),
            persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                claim_name: member.pvc_name(),
                ..Default::default()
            }),
            ..Default::default()
        }
    } else {
        Volume {
            name: DATA_VOLUME.to_string(),
            empty_dir: Some(EmptyDirVolumeSource::default()),
            ..Default::default()
        }
    };
    let mut volumes = vec![data_volume];

    if let Some(secrets) = spec.member_secrets() {
        if member.secure_peer {
            volume_mounts.push(mount(PEER_TLS_VOLUME, PEER_TLS_DIR));
            volumes.push(secret_volume(PEER_TLS_VOLUME, &secrets.peer_secret));
        }
        if spec.is_secure_server() {
            volume_mounts.push(mount(SERVER_TLS_VOLUME, SERVER_TLS_DIR));
            volumes.push(secret_volume(SERVER_TLS_VOLUME, &secrets.server_secret));
        }
    }
    if let Some(operator_secret) = spec.operator_secret() {
        volume_mounts.push(mount(OPERATOR_TLS_VOLUME, OPERATOR_TLS_DIR));
        volumes.push(secret_volume(OPERATOR_TLS_VOLUME, operator_secret));
    }

    let etcd = Container {
        name: ETCD_CONTAINER.to_string(),
        image: Some(spec.image()),
        command: Some(etcd_command(member, initial_cluster, join, token)),
        ports: Some(vec![
            ContainerPort {
                name: Some("client".to_string()),
                container_port: i32::from(CLIENT_PORT),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
            ContainerPort {
                name: Some("peer".to_string()),
                container_port: i32::from(PEER_PORT),
                protocol: Some("TCP".to_string()),
                ..Default::default()
            },
        ]),
        liveness_probe: Some(health_probe(member.secure_client, 60)),
        readiness_probe: Some(health_probe(member.secure_client, 5)),
        resources: policy.resources.clone(),
        env: (!policy.etcd_env.is_empty()).then(|| policy.etcd_env.clone()),
        volume_mounts: Some(volume_mounts),
        ..Default::default()
    };

    let check_dns = Container {
        name: "check-dns".to_string(),
        image: Some(
            policy
                .busybox_image
                .clone()
                .unwrap_or_else(|| DEFAULT_BUSYBOX_IMAGE.to_string()),
        ),
        command: Some(vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            dns_wait_script(policy.dns_timeout_in_second, &member.addr()),
        ]),
        ..Default::default()
    };

    // user labels never override the ones selectors depend on
    let mut labels = cluster_labels(&cluster_name);
    for (k, v) in &policy.labels {
        labels.entry(k.clone()).or_insert_with(|| v.clone());
    }
    let mut annotations = policy.annotations.clone();
    annotations.insert(VERSION_ANNOTATION.to_string(), spec.version.clone());

    Pod {
        metadata: ObjectMeta {
            name: Some(member.name.clone()),
            namespace: cluster.namespace(),
            labels: Some(labels),
            annotations: Some(annotations),
            owner_references: Some(vec![cluster.as_owner()]),
            ..Default::default()
        },
        spec: Some(PodSpec {
            init_containers: Some(vec![check_dns]),
            containers: vec![etcd],
            restart_policy: Some("Never".to_string()),
            volumes: Some(volumes),
            hostname: Some(member.name.clone()),
            subdomain: Some(cluster_name),
            automount_service_account_token: Some(false),
            node_selector: (!policy.node_selector.is_empty()).then(|| policy.node_selector.clone()),
            affinity: policy.affinity.clone(),
            tolerations: (!policy.tolerations.is_empty()).then(|| policy.tolerations.clone()),
            security_context: policy.security_context.clone(),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Event describing a member change, attached to the cluster.
pub fn new_member_event(
    cluster: &EtcdCluster,
    member: &str,
    event: &MemberEvent,
    component: &str,
) -> Event {
    let now = Time(chrono::Utc::now());
    Event {
        metadata: ObjectMeta {
            generate_name: Some(format!("{}-", cluster.name_any())),
            namespace: cluster.namespace(),
            ..Default::default()
        },
        involved_object: ObjectReference {
            api_version: Some(cluster.as_owner().api_version),
            kind: Some(cluster.as_owner().kind),
            name: Some(cluster.name_any()),
            namespace: cluster.namespace(),
            uid: cluster.uid(),
            ..Default::default()
        },
        reason: Some(event.reason().to_string()),
        message: Some(event.message(member)),
        source: Some(EventSource {
            component: Some(component.to_string()),
            ..Default::default()
        }),
        first_timestamp: Some(now.clone()),
        last_timestamp: Some(now),
        count: Some(1),
        type_: Some("Normal".to_string()),
        ..Default::default()
    }
}
