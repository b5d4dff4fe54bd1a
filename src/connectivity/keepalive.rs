//! NAT keepalive probes
//!
//! Router and carrier-grade NAT bindings expire when no traffic crosses
//! them. Every probe here is sent from the mapped local port, so the exact
//! 5-tuple that was mapped sees outbound traffic on every interval. The
//! probe's answer only proves the path still works.
//!
//! - TCP sessions: HTTP GET over one kept-alive HTTP/1.1 connection, redialed
//!   only after a failure so the same 5-tuple keeps being used.
//! - UDP sessions: DNS A query sent from the mapped port.

use super::reuse;
use super::types::{FailureOnce, MappingError};
use bytes::Bytes;
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1::{self, SendRequest};
use hyper::header::HOST;
use hyper::{Request, Uri};
use hyper_util::rt::TokioIo;
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use trust_dns_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use trust_dns_proto::rr::{Name, RecordType};
use trust_dns_proto::serialize::binary::BinEncodable;
use tracing::{debug, info, warn};

/// HTTP GET from the mapped TCP port
pub struct HttpProbe {
    local_addr: SocketAddr,
    uri: Uri,
    authority: String,
    port: u16,
    request_timeout: Duration,
    sender: Option<SendRequest<Empty<Bytes>>>,
}

impl HttpProbe {
    /// Probe `url` (plain `http://` only) from `local_addr`
    pub fn new(local_addr: SocketAddr, url: &str, request_timeout: Duration) -> Result<Self, MappingError> {
        let uri: Uri = url
            .parse()
            .map_err(|e| MappingError::Internal(format!("Invalid keepalive URL {}: {}", url, e)))?;
        if uri.scheme_str() != Some("http") {
            return Err(MappingError::NotSupported);
        }
        let authority = uri
            .authority()
            .map(|a| a.to_string())
            .ok_or_else(|| MappingError::Internal(format!("Keepalive URL has no host: {}", url)))?;
        let port = uri.port_u16().unwrap_or(80);

        Ok(Self {
            local_addr,
            uri,
            authority,
            port,
            request_timeout,
            sender: None,
        })
    }

    async fn connect(&self, scope: &CancellationToken) -> Result<SendRequest<Empty<Bytes>>, MappingError> {
        let host = self.uri.host().unwrap_or_default();
        let remote = reuse::resolve(&format!("{}:{}", host, self.port)).await?;
        let stream = reuse::dial_tcp(scope, self.local_addr, remote).await?;

        let (sender, connection) = http1::handshake(TokioIo::new(stream))
            .await
            .map_err(|e| MappingError::Probe(format!("HTTP handshake failed: {}", e)))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!("Keepalive HTTP connection closed: {}", e);
            }
        });
        Ok(sender)
    }

    async fn get(&mut self, scope: &CancellationToken) -> Result<(), MappingError> {
        let reusable = self.sender.as_ref().is_some_and(|s| !s.is_closed());
        if !reusable {
            self.sender = Some(self.connect(scope).await?);
        }
        let Some(sender) = self.sender.as_mut() else {
            return Err(MappingError::Internal("HTTP sender missing".to_string()));
        };

        let path = self
            .uri
            .path_and_query()
            .map(|p| p.as_str())
            .unwrap_or("/");
        let request = Request::get(path)
            .header(HOST, self.authority.as_str())
            .body(Empty::<Bytes>::new())
            .map_err(|e| MappingError::Internal(format!("Failed to build request: {}", e)))?;

        sender
            .ready()
            .await
            .map_err(|e| MappingError::Probe(format!("HTTP connection not ready: {}", e)))?;
        let response = sender
            .send_request(request)
            .await
            .map_err(|e| MappingError::Probe(format!("HTTP request failed: {}", e)))?;
        let status = response.status();
        response
            .into_body()
            .collect()
            .await
            .map_err(|e| MappingError::Probe(format!("HTTP body read failed: {}", e)))?;
        debug!("Keepalive GET {} -> {}", self.uri, status);
        Ok(())
    }

    async fn probe(&mut self, scope: &CancellationToken) -> Result<(), MappingError> {
        let result = match tokio::time::timeout(self.request_timeout, self.get(scope)).await {
            Ok(res) => res,
            Err(_) => Err(MappingError::Timeout),
        };
        if result.is_err() {
            // Drop the connection; the next probe dials a fresh one
            self.sender = None;
        }
        result
    }
}

/// DNS A query from the mapped UDP port
pub struct DnsProbe {
    local_addr: SocketAddr,
    server: SocketAddr,
    name: Name,
}

impl DnsProbe {
    /// Query `name` at `server` from `local_addr`
    pub fn new(local_addr: SocketAddr, server: SocketAddr, name: &str) -> Result<Self, MappingError> {
        let name = Name::from_ascii(name)
            .map_err(|e| MappingError::Internal(format!("Invalid DNS name {}: {}", name, e)))?;
        Ok(Self {
            local_addr,
            server,
            name,
        })
    }

    pub(crate) fn build_query(&self, id: u16) -> Result<Vec<u8>, MappingError> {
        let mut message = Message::new();
        message
            .set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(self.name.clone(), RecordType::A));
        message
            .to_bytes()
            .map_err(|e| MappingError::Internal(format!("Failed to encode DNS query: {}", e)))
    }

    async fn probe(&mut self, scope: &CancellationToken) -> Result<(), MappingError> {
        let id: u16 = rand::random();
        let query = self.build_query(id)?;
        let socket = reuse::dial_udp(scope, self.local_addr, self.server).await?;
        socket.send(&query).await?;

        let mut buf = [0u8; 1500];
        loop {
            let n = socket.recv(&mut buf).await?;
            let response = match Message::from_vec(&buf[..n]) {
                Ok(response) => response,
                Err(e) => {
                    debug!("Ignoring undecodable DNS datagram: {}", e);
                    continue;
                }
            };
            if response.id() != id || response.message_type() != MessageType::Response {
                continue;
            }
            return match response.response_code() {
                ResponseCode::NoError => {
                    debug!("Keepalive DNS lookup of {} answered", self.name);
                    Ok(())
                }
                code => Err(MappingError::Probe(format!("DNS lookup of {} failed: {}", self.name, code))),
            };
        }
    }
}

/// The probe used by the keepalive loop
pub enum KeepaliveProbe {
    /// TCP mapping
    Http(HttpProbe),
    /// UDP mapping
    Dns(DnsProbe),
}

impl KeepaliveProbe {
    /// Run one probe
    pub async fn probe(&mut self, scope: &CancellationToken) -> Result<(), MappingError> {
        match self {
            KeepaliveProbe::Http(p) => p.probe(scope).await,
            KeepaliveProbe::Dns(p) => p.probe(scope).await,
        }
    }
}

/// Timing of the keepalive loop
#[derive(Debug, Clone, Copy)]
pub struct KeepaliveTiming {
    /// Pause after each probe
    pub interval: Duration,
    /// Upper bound for one probe
    pub probe_timeout: Duration,
}

/// Probe until `scope` is cancelled
///
/// Failures go to `on_failure`, which only forwards the first one. The loop
/// itself keeps probing at the same interval whatever happens; stopping it
/// is the caller's decision, expressed by cancelling `scope`.
pub async fn run_keepalive(
    scope: CancellationToken,
    mut probe: KeepaliveProbe,
    timing: KeepaliveTiming,
    on_failure: FailureOnce,
) {
    info!("Keepalive started (interval: {:?})", timing.interval);
    loop {
        let outcome = tokio::select! {
            biased;
            _ = scope.cancelled() => break,
            res = tokio::time::timeout(timing.probe_timeout, probe.probe(&scope)) => res,
        };
        // A probe cut short by cancellation is not a failure
        if scope.is_cancelled() {
            break;
        }

        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Keepalive probe failed: {}", e);
                on_failure.report(e);
            }
            Err(_) => {
                warn!("Keepalive probe timed out after {:?}", timing.probe_timeout);
                on_failure.report(MappingError::Timeout);
            }
        }

        tokio::select! {
            biased;
            _ = scope.cancelled() => break,
            _ = tokio::time::sleep(timing.interval) => {}
        }
    }
    info!("Keepalive stopped");
}
