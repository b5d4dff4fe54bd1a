//! Mapping orchestrator - router mapping, public address discovery, keepalive
//!
//! [`open_mapping`] runs the two setup steps strictly in order and only then
//! starts the keepalive task. A failure in either setup step is returned and
//! leaves nothing running.

use super::keepalive::{run_keepalive, DnsProbe, HttpProbe, KeepaliveProbe, KeepaliveTiming};
use super::reuse;
use super::router::RouterControl;
use super::stun::get_mapped_address;
use super::types::{
    FailureOnce, FailureSink, IpProtocol, Mapping, MappingError, PortMappingRequest,
};
use chrono::Utc;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// Everything `open_mapping` needs to know about the session
#[derive(Debug, Clone)]
pub struct MappingRequest {
    /// STUN server, `host:port`
    pub stun_server: String,
    /// LAN address and port to map
    pub local_addr: SocketAddr,
    /// Transport protocol
    pub protocol: IpProtocol,
    /// Description stored on the router
    pub description: String,
    /// Router lease in seconds, 0 = permanent
    pub lease_secs: u32,
    /// Upper bound for the STUN round trip
    pub discovery_timeout: Duration,
    /// Keepalive interval and per-probe timeout
    pub keepalive: KeepaliveTiming,
    /// HTTP probe target for TCP mappings
    pub keepalive_http_url: String,
    /// Upper bound for one HTTP request of the TCP probe
    pub keepalive_http_timeout: Duration,
    /// DNS server for UDP mappings
    pub keepalive_dns_server: String,
    /// Name looked up by the UDP probe
    pub keepalive_dns_name: String,
}

/// An open mapping and the handle that closes it
///
/// Closing (or dropping) the handle cancels the mapping's scope, which stops
/// the keepalive task.
pub struct MappingHandle {
    mapping: Mapping,
    scope: CancellationToken,
    keepalive: Option<JoinHandle<()>>,
}

impl MappingHandle {
    /// The established mapping
    pub fn mapping(&self) -> &Mapping {
        &self.mapping
    }

    /// Public address:port
    pub fn public_addr(&self) -> SocketAddr {
        self.mapping.public_addr
    }

    /// Whether the mapping's scope has been cancelled
    pub fn is_closed(&self) -> bool {
        self.scope.is_cancelled()
    }

    /// Cancel the scope and wait for the keepalive task to finish
    pub async fn close(mut self) {
        self.scope.cancel();
        if let Some(task) = self.keepalive.take() {
            let _ = task.await;
        }
    }
}

impl Drop for MappingHandle {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}

async fn discover_public_addr(
    scope: &CancellationToken,
    request: &MappingRequest,
) -> Result<SocketAddr, MappingError> {
    let server = reuse::resolve(&request.stun_server).await?;
    match request.protocol {
        IpProtocol::TCP => {
            let mut conn = reuse::dial_tcp(scope, request.local_addr, server).await?;
            get_mapped_address(&mut conn, request.discovery_timeout).await
        }
        IpProtocol::UDP => {
            let mut conn = reuse::dial_udp(scope, request.local_addr, server).await?;
            get_mapped_address(&mut conn, request.discovery_timeout).await
        }
    }
}

async fn build_probe(request: &MappingRequest) -> Result<KeepaliveProbe, MappingError> {
    Ok(match request.protocol {
        IpProtocol::TCP => KeepaliveProbe::Http(HttpProbe::new(
            request.local_addr,
            &request.keepalive_http_url,
            request.keepalive_http_timeout,
        )?),
        IpProtocol::UDP => {
            let server = reuse::resolve(&request.keepalive_dns_server).await?;
            KeepaliveProbe::Dns(DnsProbe::new(
                request.local_addr,
                server,
                &request.keepalive_dns_name,
            )?)
        }
    })
}

async fn setup(
    scope: &CancellationToken,
    router: &RouterControl,
    request: &MappingRequest,
) -> Result<Mapping, MappingError> {
    let port = request.local_addr.port();
    let router_outcome = router
        .add_port_mapping(&PortMappingRequest {
            remote_host: String::new(),
            external_port: port,
            protocol: request.protocol,
            internal_port: port,
            internal_client: request.local_addr.ip(),
            enabled: true,
            description: request.description.clone(),
            lease_secs: request.lease_secs,
        })
        .await?;

    let public_addr = discover_public_addr(scope, request).await?;

    Ok(Mapping {
        public_addr,
        local_addr: request.local_addr,
        protocol: request.protocol,
        router: router_outcome,
        created_at: Utc::now(),
    })
}

/// Open the router mapping, learn the public address, start the keepalive
///
/// The keepalive runs in a child of `scope`; keepalive failures reach
/// `on_failure` at most once per call. Callers normally cancel the session
/// scope from inside `on_failure`.
pub async fn open_mapping(
    scope: &CancellationToken,
    router: &RouterControl,
    request: &MappingRequest,
    on_failure: FailureSink,
) -> Result<MappingHandle, MappingError> {
    info!(
        "Opening {} mapping for {} (STUN: {})",
        request.protocol, request.local_addr, request.stun_server
    );

    let mapping = tokio::select! {
        biased;
        _ = scope.cancelled() => return Err(MappingError::Cancelled),
        res = setup(scope, router, request) => res,
    }
    .map_err(|e| {
        error!("Mapping setup failed: {}", e);
        e
    })?;
    let probe = build_probe(request).await?;

    let child = scope.child_token();
    let keepalive = tokio::spawn(run_keepalive(
        child.clone(),
        probe,
        request.keepalive,
        FailureOnce::new(on_failure),
    ));

    info!(
        "Mapped {} {} -> public {}",
        mapping.protocol, mapping.local_addr, mapping.public_addr
    );
    Ok(MappingHandle {
        mapping,
        scope: child,
        keepalive: Some(keepalive),
    })
}
