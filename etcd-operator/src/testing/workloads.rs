//! In-memory pods, claims, services and events.

use super::{Call, CallLog};
use crate::error::{OperatorError, OperatorResult};
use crate::k8s::{PodInfo, PodPhase, Workloads};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Event, PersistentVolumeClaim, Pod, Service};
use kube::ResourceExt;
use parking_lot::Mutex;
use std::collections::BTreeSet;

/// A running, ready pod owned by `owner_uid`.
pub fn running_pod(name: &str, owner_uid: &str, version: &str) -> PodInfo {
    PodInfo {
        name: name.to_string(),
        namespace: "default".to_string(),
        owner_uid: Some(owner_uid.to_string()),
        deleting: false,
        phase: PodPhase::Running,
        ready: true,
        version: Some(version.to_string()),
    }
}

/// [`Workloads`] over in-memory state.
///
/// Pods keep insertion order. Created pods start in the configured phase,
/// Running by default.
pub struct MockWorkloads {
    log: CallLog,
    pods: Mutex<Vec<PodInfo>>,
    created: Mutex<Vec<Pod>>,
    pvcs: Mutex<BTreeSet<String>>,
    services: Mutex<BTreeSet<String>>,
    events: Mutex<Vec<Event>>,
    new_pod_phase: Mutex<PodPhase>,
    fail_creates: Mutex<bool>,
}

impl MockWorkloads {
    /// Empty workloads recording into `log`.
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            pods: Mutex::new(Vec::new()),
            created: Mutex::new(Vec::new()),
            pvcs: Mutex::new(BTreeSet::new()),
            services: Mutex::new(BTreeSet::new()),
            events: Mutex::new(Vec::new()),
            new_pod_phase: Mutex::new(PodPhase::Running),
            fail_creates: Mutex::new(false),
        }
    }

    /// Add an existing pod.
    pub fn add_pod(&self, pod: PodInfo) {
        self.pods.lock().push(pod);
    }

    /// Phase given to pods created from now on.
    pub fn set_new_pod_phase(&self, phase: PodPhase) {
        *self.new_pod_phase.lock() = phase;
    }

    /// Make pod and claim creation fail.
    pub fn fail_creates(&self, fail: bool) {
        *self.fail_creates.lock() = fail;
    }

    /// Current pods.
    pub fn pods(&self) -> Vec<PodInfo> {
        self.pods.lock().clone()
    }

    /// Look up a pod by name.
    pub fn pod(&self, name: &str) -> Option<PodInfo> {
        self.pods.lock().iter().find(|p| p.name == name).cloned()
    }

    /// Full objects of every pod created.
    pub fn created_pods(&self) -> Vec<Pod> {
        self.created.lock().clone()
    }

    /// Current claim names.
    pub fn pvcs(&self) -> BTreeSet<String> {
        self.pvcs.lock().clone()
    }

    /// Current service names.
    pub fn services(&self) -> BTreeSet<String> {
        self.services.lock().clone()
    }

    /// Recorded events.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    fn check_create(&self) -> OperatorResult<()> {
        if *self.fail_creates.lock() {
            return Err(OperatorError::UnexpectedState("create refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Workloads for MockWorkloads {
    async fn list_pods(&self, _namespace: &str, _cluster: &str) -> OperatorResult<Vec<PodInfo>> {
        self.log.record(Call::ListPods);
        Ok(self.pods())
    }

    async fn create_pod(&self, namespace: &str, pod: Pod) -> OperatorResult<()> {
        self.log.record(Call::CreatePod {
            name: pod.name_any(),
        });
        self.check_create()?;

        let mut info = PodInfo::from(&pod);
        info.namespace = namespace.to_string();
        info.phase = *self.new_pod_phase.lock();
        info.ready = info.phase == PodPhase::Running;
        self.pods.lock().push(info);
        self.created.lock().push(pod);
        Ok(())
    }

    async fn delete_pod(&self, _namespace: &str, name: &str) -> OperatorResult<()> {
        self.log.record(Call::DeletePod {
            name: name.to_string(),
        });
        self.pods.lock().retain(|p| p.name != name);
        Ok(())
    }

    async fn create_pvc(&self, _namespace: &str, pvc: PersistentVolumeClaim) -> OperatorResult<()> {
        self.log.record(Call::CreatePvc {
            name: pvc.name_any(),
        });
        self.check_create()?;
        self.pvcs.lock().insert(pvc.name_any());
        Ok(())
    }

    async fn delete_pvc(&self, _namespace: &str, name: &str) -> OperatorResult<()> {
        self.log.record(Call::DeletePvc {
            name: name.to_string(),
        });
        self.pvcs.lock().remove(name);
        Ok(())
    }

    async fn upgrade_pod(
        &self,
        namespace: &str,
        name: &str,
        _image: &str,
        version: &str,
    ) -> OperatorResult<()> {
        self.log.record(Call::UpgradePod {
            name: name.to_string(),
            version: version.to_string(),
        });
        let mut pods = self.pods.lock();
        let pod = pods
            .iter_mut()
            .find(|p| p.name == name)
            .ok_or_else(|| OperatorError::NotFound {
                kind: "Pod".into(),
                name: name.to_string(),
                namespace: namespace.to_string(),
            })?;
        pod.version = Some(version.to_string());
        Ok(())
    }

    async fn create_service(&self, _namespace: &str, service: Service) -> OperatorResult<()> {
        self.log.record(Call::CreateService {
            name: service.name_any(),
        });
        self.services.lock().insert(service.name_any());
        Ok(())
    }

    async fn record_event(&self, _namespace: &str, event: Event) -> OperatorResult<()> {
        self.log.record(Call::RecordEvent {
            reason: event.reason.clone().unwrap_or_default(),
        });
        self.events.lock().push(event);
        Ok(())
    }
}
