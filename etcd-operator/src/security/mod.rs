//! TLS for the operator's own connections to etcd.
//!
//! When a cluster names an operator secret, the client certificate, key and
//! CA in it are turned into a rustls config shared by all admin calls.

mod credentials;
mod tls;

pub use credentials::{
    CLIENT_CA_KEY, CLIENT_CERT_KEY, CLIENT_KEY_KEY, KubeSecretStore, SecretStore, TlsData,
    tls_data_from_secret,
};
pub use tls::{TlsConfigBuilder, load_client_tls};
