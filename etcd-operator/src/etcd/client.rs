//! etcd membership over the v3 JSON gateway.
//!
//! Requests are `POST /v3/cluster/member/{list,add,remove}` with JSON bodies.
//! 64-bit ids travel as strings, following the gateway's JSON mapping.

use super::{EtcdAdmin, EtcdMember, TlsContext};
use crate::error::{OperatorError, OperatorResult};
use async_trait::async_trait;
use bytes::Bytes;
use http::{Request, StatusCode};
use http_body_util::{BodyExt, Full};
use rustls::pki_types::ServerName;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use std::time::Duration;

const MEMBER_LIST_PATH: &str = "/v3/cluster/member/list";
const MEMBER_ADD_PATH: &str = "/v3/cluster/member/add";
const MEMBER_REMOVE_PATH: &str = "/v3/cluster/member/remove";

/// gRPC status code the gateway reports for unknown members.
const GRPC_NOT_FOUND: i32 = 5;

/// [`EtcdAdmin`] backed by the etcd JSON gateway.
#[derive(Debug, Clone)]
pub struct GatewayClient {
    dial_timeout: Duration,
    request_timeout: Duration,
}

impl GatewayClient {
    /// Create a client with the given connect and request deadlines.
    pub fn new(dial_timeout: Duration, request_timeout: Duration) -> Self {
        Self {
            dial_timeout,
            request_timeout,
        }
    }

    /// Send `body` to each endpoint in turn until one answers.
    ///
    /// Transport failures move on to the next endpoint. An HTTP answer, even
    /// an error status, ends the loop.
    async fn call<B: Serialize + Sync>(
        &self,
        endpoints: &[String],
        tls: Option<&TlsContext>,
        path: &str,
        body: &B,
    ) -> OperatorResult<(StatusCode, Bytes)> {
        let payload = Bytes::from(serde_json::to_vec(body)?);
        let mut last_error = None;

        for endpoint in endpoints {
            match self.post(endpoint, tls, path, payload.clone()).await {
                Ok(answer) => return Ok(answer),
                Err(e) => {
                    tracing::debug!(endpoint = %endpoint, error = %e, "etcd endpoint unreachable");
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| OperatorError::EtcdError("no etcd endpoints to contact".into())))
    }

    async fn post(
        &self,
        endpoint: &str,
        tls: Option<&TlsContext>,
        path: &str,
        payload: Bytes,
    ) -> OperatorResult<(StatusCode, Bytes)> {
        let uri: http::Uri = endpoint.parse().map_err(|e| {
            OperatorError::HttpError(format!("Invalid etcd endpoint '{}': {}", endpoint, e))
        })?;

        let host = uri
            .host()
            .ok_or_else(|| OperatorError::HttpError(format!("Missing host in URL: {}", endpoint)))?
            .to_string();

        let secure = uri.scheme_str() == Some("https");
        let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });
        let addr = format!("{}:{}", host, port);

        let req = Request::builder()
            .method("POST")
            .uri(path)
            .header("Host", addr.as_str())
            .header("Content-Type", "application/json")
            .body(Full::new(payload))
            .map_err(|e| OperatorError::HttpError(format!("Failed to build request: {}", e)))?;

        let stream = tokio::time::timeout(self.dial_timeout, tokio::net::TcpStream::connect(&addr))
            .await
            .map_err(|_| OperatorError::Timeout {
                operation: format!("dial {}", addr),
                seconds: self.dial_timeout.as_secs(),
            })?
            .map_err(|e| OperatorError::EtcdError(format!("Failed to connect to {}: {}", addr, e)))?;

        let exchange = async {
            if secure {
                let config = tls.cloned().ok_or_else(|| {
                    OperatorError::InvalidConfig(format!(
                        "https endpoint {} without a TLS context",
                        endpoint
                    ))
                })?;
                let server_name = ServerName::try_from(host.clone()).map_err(|e| {
                    OperatorError::InvalidConfig(format!("Invalid TLS server name {}: {}", host, e))
                })?;
                let tls_stream = tokio_rustls::TlsConnector::from(config)
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| {
                        OperatorError::EtcdError(format!("TLS handshake with {} failed: {}", addr, e))
                    })?;
                send(hyper_util::rt::TokioIo::new(tls_stream), req).await
            } else {
                send(hyper_util::rt::TokioIo::new(stream), req).await
            }
        };

        tokio::time::timeout(self.request_timeout, exchange)
            .await
            .map_err(|_| OperatorError::Timeout {
                operation: format!("POST {}{}", endpoint, path),
                seconds: self.request_timeout.as_secs(),
            })?
    }
}

async fn send<I>(io: I, req: Request<Full<Bytes>>) -> OperatorResult<(StatusCode, Bytes)>
where
    I: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(|e| OperatorError::EtcdError(format!("HTTP handshake failed: {}", e)))?;

    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::debug!(error = %e, "etcd connection closed with error");
        }
    });

    let response = sender
        .send_request(req)
        .await
        .map_err(|e| OperatorError::EtcdError(format!("etcd request failed: {}", e)))?;

    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .map_err(|e| OperatorError::EtcdError(format!("Failed to read etcd response: {}", e)))?
        .to_bytes();

    Ok((status, body))
}

#[derive(Serialize)]
struct MemberListRequest {}

#[derive(Deserialize)]
struct MemberListResponse {
    #[serde(default)]
    members: Vec<WireMember>,
}

#[derive(Serialize)]
struct MemberAddRequest<'a> {
    #[serde(rename = "peerURLs")]
    peer_urls: [&'a str; 1],
}

#[derive(Deserialize)]
struct MemberAddResponse {
    member: Option<WireMember>,
}

#[derive(Serialize)]
struct MemberRemoveRequest {
    #[serde(rename = "ID")]
    id: String,
}

#[derive(Deserialize)]
struct WireMember {
    #[serde(rename = "ID", default, deserialize_with = "u64_from_json")]
    id: u64,
    #[serde(default)]
    name: String,
    #[serde(rename = "peerURLs", default)]
    peer_urls: Vec<String>,
}

#[derive(Deserialize, Default)]
struct GatewayError {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    error: String,
    #[serde(default)]
    message: String,
}

impl GatewayError {
    fn parse(body: &[u8]) -> Self {
        serde_json::from_slice(body).unwrap_or_default()
    }

    /// The gateway fills `message`, `error` or both with the same text.
    fn text(&self) -> &str {
        if self.message.is_empty() {
            &self.error
        } else {
            &self.message
        }
    }
}

impl From<WireMember> for EtcdMember {
    fn from(m: WireMember) -> Self {
        EtcdMember {
            id: m.id,
            name: m.name,
            peer_urls: m.peer_urls,
        }
    }
}

fn u64_from_json<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(u64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

/// Decode a successful answer or turn an error answer into an error.
fn decode<T: DeserializeOwned>(path: &str, status: StatusCode, body: &[u8]) -> OperatorResult<T> {
    if status.is_success() {
        return Ok(serde_json::from_slice(body)?);
    }
    let failure = GatewayError::parse(body);
    Err(OperatorError::EtcdError(format!(
        "{} returned {}: {}",
        path,
        status,
        failure.text()
    )))
}

fn is_member_not_found(status: StatusCode, body: &[u8]) -> bool {
    if status == StatusCode::NOT_FOUND {
        return true;
    }
    let failure = GatewayError::parse(body);
    failure.code == GRPC_NOT_FOUND || failure.text().contains("member not found")
}

#[async_trait]
impl EtcdAdmin for GatewayClient {
    async fn list_members(
        &self,
        endpoints: &[String],
        tls: Option<&TlsContext>,
    ) -> OperatorResult<Vec<EtcdMember>> {
        let (status, body) = self
            .call(endpoints, tls, MEMBER_LIST_PATH, &MemberListRequest {})
            .await?;
        let resp: MemberListResponse = decode(MEMBER_LIST_PATH, status, &body)?;
        Ok(resp.members.into_iter().map(EtcdMember::from).collect())
    }

    async fn add_member(
        &self,
        endpoints: &[String],
        tls: Option<&TlsContext>,
        peer_url: &str,
    ) -> OperatorResult<u64> {
        let req = MemberAddRequest {
            peer_urls: [peer_url],
        };
        let (status, body) = self.call(endpoints, tls, MEMBER_ADD_PATH, &req).await?;
        let resp: MemberAddResponse = decode(MEMBER_ADD_PATH, status, &body)?;
        resp.member.map(|m| m.id).ok_or_else(|| {
            OperatorError::EtcdError(format!("member add for {} returned no member", peer_url))
        })
    }

    async fn remove_member(
        &self,
        endpoints: &[String],
        tls: Option<&TlsContext>,
        id: u64,
    ) -> OperatorResult<()> {
        let req = MemberRemoveRequest { id: id.to_string() };
        let (status, body) = self.call(endpoints, tls, MEMBER_REMOVE_PATH, &req).await?;
        if !status.is_success() && is_member_not_found(status, &body) {
            return Err(OperatorError::MemberNotFound(id));
        }
        decode::<serde_json::Value>(MEMBER_REMOVE_PATH, status, &body).map(|_| ())
    }
}
