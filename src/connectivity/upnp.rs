//! UPnP IGD (Internet Gateway Device) port mapping
//!
//! Gateways are found with SSDP and driven over SOAP through `igd-next`.
//! The library is blocking, so every call runs on the blocking pool.
//!
//! One [`UpnpDiscovery`] exists per WAN service flavour. A gateway is
//! classified from its control description: IGDv2 WANIPConnection exposes
//! `AddAnyPortMapping`, PPP connections carry `PPP` in their control URL.

use super::router::{RouterClient, RouterDiscovery};
use super::types::{IpProtocol, MappingError, PortMappingRequest, RouterKind};
use async_trait::async_trait;
use igd_next::{Gateway, PortMappingProtocol, SearchOptions};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Default timeout for the SSDP search
const UPNP_TIMEOUT: Duration = Duration::from_secs(5);

/// Work out which WAN service a gateway's control description belongs to
pub(crate) fn classify_service<'a>(
    control_url: &str,
    actions: impl IntoIterator<Item = &'a str>,
) -> RouterKind {
    if actions.into_iter().any(|a| a == "AddAnyPortMapping") {
        RouterKind::WanIpConnection2
    } else if control_url.to_ascii_uppercase().contains("PPP") {
        RouterKind::WanPppConnection1
    } else {
        RouterKind::WanIpConnection1
    }
}

fn to_igd_protocol(protocol: IpProtocol) -> PortMappingProtocol {
    match protocol {
        IpProtocol::TCP => PortMappingProtocol::TCP,
        IpProtocol::UDP => PortMappingProtocol::UDP,
    }
}

/// SSDP search for gateways of one service flavour
pub struct UpnpDiscovery {
    kind: RouterKind,
    timeout: Duration,
}

impl UpnpDiscovery {
    /// Look for gateways of `kind`
    pub fn new(kind: RouterKind) -> Self {
        Self {
            kind,
            timeout: UPNP_TIMEOUT,
        }
    }
}

#[async_trait]
impl RouterDiscovery for UpnpDiscovery {
    fn kind(&self) -> RouterKind {
        self.kind
    }

    async fn discover(&self) -> Result<Vec<Arc<dyn RouterClient>>, MappingError> {
        let timeout = self.timeout;
        let wanted = self.kind;

        let gateway = tokio::task::spawn_blocking(move || {
            igd_next::search_gateway(SearchOptions {
                timeout: Some(timeout),
                ..Default::default()
            })
        })
        .await
        .map_err(|e| MappingError::Internal(format!("Task join error: {}", e)))?
        .map_err(|e| {
            debug!("UPnP gateway search failed: {}", e);
            MappingError::NoGateway
        })?;

        let kind = classify_service(
            &gateway.control_url,
            gateway.control_schema.keys().map(String::as_str),
        );
        if kind != wanted {
            debug!("UPnP gateway at {} is {:?}, not {:?}", gateway.addr, kind, wanted);
            return Ok(Vec::new());
        }

        debug!("Found UPnP gateway {} ({:?})", gateway.addr, kind);
        Ok(vec![Arc::new(UpnpClient { kind, gateway })])
    }
}

/// A discovered UPnP gateway
pub struct UpnpClient {
    kind: RouterKind,
    gateway: Gateway,
}

#[async_trait]
impl RouterClient for UpnpClient {
    fn kind(&self) -> RouterKind {
        self.kind
    }

    async fn add_port_mapping(&self, request: &PortMappingRequest) -> Result<(), MappingError> {
        if !request.enabled {
            return Err(MappingError::NotSupported);
        }

        let gateway = self.gateway.clone();
        let protocol = to_igd_protocol(request.protocol);
        let external_port = request.external_port;
        let internal = SocketAddr::new(request.internal_client, request.internal_port);
        let lease = request.lease_secs;
        let description = request.description.clone();

        tokio::task::spawn_blocking(move || {
            gateway.add_port(protocol, external_port, internal, lease, &description)
        })
        .await
        .map_err(|e| MappingError::Internal(format!("Task join error: {}", e)))?
        .map_err(|e| {
            warn!("UPnP AddPortMapping failed: {}", e);
            MappingError::GatewayError(format!("AddPortMapping failed: {}", e))
        })?;

        info!(
            "UPnP mapping added on {}: {} -> {} ({}s)",
            self.gateway.addr, external_port, internal, lease
        );
        Ok(())
    }
}
