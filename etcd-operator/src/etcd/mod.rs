//! etcd cluster membership API.
//!
//! The operator only needs the three membership calls. [`EtcdAdmin`] is the
//! seam the reconciler talks to; [`GatewayClient`] implements it over etcd's
//! JSON gateway.

mod client;

pub use client::GatewayClient;

use crate::error::OperatorResult;
use async_trait::async_trait;
use std::sync::Arc;

/// Client TLS context shared by every admin call of a cluster.
pub type TlsContext = Arc<rustls::ClientConfig>;

/// A member as etcd reports it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcdMember {
    /// Id assigned by etcd.
    pub id: u64,
    /// Name the member started with. Empty until it has started.
    pub name: String,
    /// Advertised peer URLs.
    pub peer_urls: Vec<String>,
}

/// etcd membership operations.
///
/// Every call goes to the given client endpoints, in order, until one
/// answers. Calls are bounded by the implementation's deadlines and never
/// retried beyond trying the next endpoint.
#[async_trait]
pub trait EtcdAdmin: Send + Sync {
    /// List current members.
    async fn list_members(
        &self,
        endpoints: &[String],
        tls: Option<&TlsContext>,
    ) -> OperatorResult<Vec<EtcdMember>>;

    /// Register a member by its future peer URL and return its id.
    async fn add_member(
        &self,
        endpoints: &[String],
        tls: Option<&TlsContext>,
        peer_url: &str,
    ) -> OperatorResult<u64>;

    /// Remove a member. An unknown id fails with
    /// [`crate::error::OperatorError::MemberNotFound`].
    async fn remove_member(
        &self,
        endpoints: &[String],
        tls: Option<&TlsContext>,
        id: u64,
    ) -> OperatorResult<()>;
}
