//! In-memory secrets and status persistence.

use super::{Call, CallLog};
use crate::crd::{EtcdCluster, EtcdClusterStatus};
use crate::error::{OperatorError, OperatorResult};
use crate::k8s::StatusStore;
use crate::security::{SecretStore, TlsData};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

/// [`SecretStore`] over a map of secret name to TLS material.
pub struct MockSecrets {
    log: CallLog,
    secrets: Mutex<HashMap<String, TlsData>>,
}

impl MockSecrets {
    /// No secrets, recording into `log`.
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            secrets: Mutex::new(HashMap::new()),
        }
    }

    /// Store a secret.
    pub fn set(&self, name: impl Into<String>, data: TlsData) {
        self.secrets.lock().insert(name.into(), data);
    }
}

#[async_trait]
impl SecretStore for MockSecrets {
    async fn tls_data(&self, namespace: &str, secret: &str) -> OperatorResult<TlsData> {
        self.log.record(Call::ReadSecret {
            name: secret.to_string(),
        });
        self.secrets
            .lock()
            .get(secret)
            .cloned()
            .ok_or_else(|| OperatorError::NotFound {
                kind: "Secret".into(),
                name: secret.to_string(),
                namespace: namespace.to_string(),
            })
    }
}

/// [`StatusStore`] keeping every written status.
pub struct MockStatusStore {
    log: CallLog,
    history: Mutex<Vec<EtcdClusterStatus>>,
    fail: Mutex<bool>,
}

impl MockStatusStore {
    /// Nothing written yet, recording into `log`.
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            history: Mutex::new(Vec::new()),
            fail: Mutex::new(false),
        }
    }

    /// Make writes fail.
    pub fn fail_writes(&self, fail: bool) {
        *self.fail.lock() = fail;
    }

    /// Every status written, oldest first.
    pub fn history(&self) -> Vec<EtcdClusterStatus> {
        self.history.lock().clone()
    }

    /// The last status written.
    pub fn last(&self) -> Option<EtcdClusterStatus> {
        self.history.lock().last().cloned()
    }
}

#[async_trait]
impl StatusStore for MockStatusStore {
    async fn persist(&self, _cluster: &EtcdCluster, status: &EtcdClusterStatus) -> OperatorResult<()> {
        self.log.record(Call::PersistStatus {
            phase: status.phase,
        });
        if *self.fail.lock() {
            return Err(OperatorError::UnexpectedState("status write refused".into()));
        }
        self.history.lock().push(status.clone());
        Ok(())
    }
}
