//! Client certificates from Kubernetes secrets.

use crate::error::{OperatorError, OperatorResult};
use async_trait::async_trait;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use kube::Api;
use std::collections::BTreeMap;

/// Secret key holding the operator's client certificate.
pub const CLIENT_CERT_KEY: &str = "etcd-client.crt";

/// Secret key holding the client private key.
pub const CLIENT_KEY_KEY: &str = "etcd-client.key";

/// Secret key holding the CA that signed the member certificates.
pub const CLIENT_CA_KEY: &str = "etcd-client-ca.crt";

/// PEM material for a TLS client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsData {
    /// Client certificate chain.
    pub cert: Vec<u8>,
    /// Client private key.
    pub key: Vec<u8>,
    /// CA certificate used to verify the members.
    pub ca: Vec<u8>,
}

/// Source of TLS client material.
#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Read the client material stored in `secret`.
    async fn tls_data(&self, namespace: &str, secret: &str) -> OperatorResult<TlsData>;
}

/// [`SecretStore`] reading secrets through the Kubernetes API.
#[derive(Clone)]
pub struct KubeSecretStore {
    client: kube::Client,
}

impl KubeSecretStore {
    /// Create a store backed by `client`.
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl SecretStore for KubeSecretStore {
    async fn tls_data(&self, namespace: &str, secret_name: &str) -> OperatorResult<TlsData> {
        tracing::debug!(
            secret = %secret_name,
            namespace = %namespace,
            "Loading etcd client TLS from secret"
        );

        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = secrets.get(secret_name).await.map_err(|e| match &e {
            kube::Error::Api(api_err) if api_err.code == 404 => OperatorError::NotFound {
                kind: "Secret".to_string(),
                name: secret_name.to_string(),
                namespace: namespace.to_string(),
            },
            _ => OperatorError::KubeError(e),
        })?;

        let data = secret.data.ok_or_else(|| {
            OperatorError::InvalidConfig(format!("Secret '{}' has no data field", secret_name))
        })?;

        tls_data_from_secret(&data, secret_name)
    }
}

/// Pick the three client entries out of secret data.
pub fn tls_data_from_secret(
    data: &BTreeMap<String, ByteString>,
    secret_name: &str,
) -> OperatorResult<TlsData> {
    let field = |key: &str| {
        data.get(key).map(|b| b.0.clone()).ok_or_else(|| {
            OperatorError::InvalidConfig(format!(
                "Secret '{}' missing '{}' field",
                secret_name, key
            ))
        })
    };

    Ok(TlsData {
        cert: field(CLIENT_CERT_KEY)?,
        key: field(CLIENT_KEY_KEY)?,
        ca: field(CLIENT_CA_KEY)?,
    })
}
