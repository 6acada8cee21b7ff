//! rustls client configuration for talking to etcd members.

use super::credentials::{SecretStore, TlsData};
use crate::error::{OperatorError, OperatorResult};
use crate::etcd::TlsContext;
use rustls::RootCertStore;
use rustls::pki_types::CertificateDer;
use std::sync::Arc;

/// Builder for the client config used on every admin call of a cluster.
#[derive(Default)]
pub struct TlsConfigBuilder {
    ca_cert: Option<Vec<u8>>,
    client_cert: Option<Vec<u8>>,
    client_key: Option<Vec<u8>>,
}

impl TlsConfigBuilder {
    /// Create an empty builder. Without a CA the webpki roots are trusted.
    pub fn new() -> Self {
        Self::default()
    }

    /// Trust only this CA bundle.
    pub fn with_ca_cert(mut self, ca: Vec<u8>) -> Self {
        self.ca_cert = Some(ca);
        self
    }

    /// Present this certificate and key to the members.
    pub fn with_client_cert(mut self, cert: Vec<u8>, key: Vec<u8>) -> Self {
        self.client_cert = Some(cert);
        self.client_key = Some(key);
        self
    }

    /// Builder for the material of an operator secret.
    pub fn from_tls_data(data: &TlsData) -> Self {
        Self::new()
            .with_ca_cert(data.ca.clone())
            .with_client_cert(data.cert.clone(), data.key.clone())
    }

    /// Parse the PEM material and build the config.
    pub fn build(self) -> OperatorResult<TlsContext> {
        let mut root_store = RootCertStore::empty();
        match self.ca_cert {
            Some(ca_pem) => {
                let ca_certs = parse_certs(&ca_pem, "CA")?;
                for cert in ca_certs {
                    root_store.add(cert).map_err(|e| {
                        OperatorError::InvalidConfig(format!("Failed to add CA cert: {}", e))
                    })?;
                }
            }
            None => root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }

        // kube already links the ring provider; pin it instead of relying on
        // a process-wide default.
        let config = rustls::ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| OperatorError::InvalidConfig(format!("Unsupported TLS versions: {}", e)))?
        .with_root_certificates(root_store);

        let config = match (self.client_cert, self.client_key) {
            (Some(cert_pem), Some(key_pem)) => {
                let certs = parse_certs(&cert_pem, "client")?;
                let key = rustls_pemfile::private_key(&mut key_pem.as_slice())
                    .map_err(|e| {
                        OperatorError::InvalidConfig(format!("Failed to parse private key: {}", e))
                    })?
                    .ok_or_else(|| {
                        OperatorError::InvalidConfig("No private key found in PEM".to_string())
                    })?;

                config.with_client_auth_cert(certs, key).map_err(|e| {
                    OperatorError::InvalidConfig(format!("Failed to set client auth: {}", e))
                })?
            }
            _ => config.with_no_client_auth(),
        };

        Ok(Arc::new(config))
    }
}

fn parse_certs(pem: &[u8], what: &str) -> OperatorResult<Vec<CertificateDer<'static>>> {
    let certs = rustls_pemfile::certs(&mut &pem[..])
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| OperatorError::InvalidConfig(format!("Failed to parse {} cert: {}", what, e)))?;
    if certs.is_empty() {
        return Err(OperatorError::InvalidConfig(format!(
            "No {} certificate found in PEM",
            what
        )));
    }
    Ok(certs)
}

/// Load the operator's client TLS context from a secret.
pub async fn load_client_tls(
    secrets: &dyn SecretStore,
    namespace: &str,
    secret: &str,
) -> OperatorResult<TlsContext> {
    let data = secrets.tls_data(namespace, secret).await?;
    let context = TlsConfigBuilder::from_tls_data(&data).build()?;
    tracing::debug!(secret = %secret, namespace = %namespace, "Built etcd client TLS context");
    Ok(context)
}
