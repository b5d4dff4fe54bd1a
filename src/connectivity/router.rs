//! Router control: pick a port-mapping service and open the port on it
//!
//! Every candidate service is probed at the same time. Once all probes have
//! finished, the first candidate (in priority order) that found at least one
//! gateway wins, and the mapping request is sent to every gateway of that
//! candidate concurrently.

use super::natpmp::NatPmpDiscovery;
use super::types::{MappingError, PortMappingRequest, RouterKind, RouterOutcome};
use super::upnp::UpnpDiscovery;
use async_trait::async_trait;
use futures::future::{join_all, try_join_all};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// A gateway that accepts AddPortMapping requests
#[async_trait]
pub trait RouterClient: Send + Sync {
    /// Service this client talks to
    fn kind(&self) -> RouterKind;

    /// Ask the gateway to forward `request.external_port` to the internal host.
    /// Re-issuing the same request renews it.
    async fn add_port_mapping(&self, request: &PortMappingRequest) -> Result<(), MappingError>;
}

/// Finds the gateways that speak one particular service
#[async_trait]
pub trait RouterDiscovery: Send + Sync {
    /// Service this discovery looks for
    fn kind(&self) -> RouterKind;

    /// Probe the network. An empty list means no gateway answered.
    async fn discover(&self) -> Result<Vec<Arc<dyn RouterClient>>, MappingError>;
}

/// Result of probing all candidates
pub enum RouterSelection {
    /// Gateways of the highest-priority service that answered
    Clients(RouterKind, Vec<Arc<dyn RouterClient>>),
    /// Nothing answered
    NoCapableDevice,
}

/// Prioritized set of router-control candidates
pub struct RouterControl {
    candidates: Vec<Box<dyn RouterDiscovery>>,
}

impl RouterControl {
    /// Build from candidates; they are sorted by [`RouterKind`] priority
    pub fn new(mut candidates: Vec<Box<dyn RouterDiscovery>>) -> Self {
        candidates.sort_by_key(|c| c.kind());
        Self { candidates }
    }

    /// UPnP (IGDv2 IP, IGDv1 IP, IGDv1 PPP) followed by NAT-PMP
    pub fn with_defaults() -> Self {
        Self::new(vec![
            Box::new(UpnpDiscovery::new(RouterKind::WanIpConnection2)),
            Box::new(UpnpDiscovery::new(RouterKind::WanIpConnection1)),
            Box::new(UpnpDiscovery::new(RouterKind::WanPppConnection1)),
            Box::new(NatPmpDiscovery::new()),
        ])
    }

    /// Probe every candidate concurrently and pick by priority
    pub async fn pick_clients(&self) -> RouterSelection {
        let probes = self.candidates.iter().map(|c| async move {
            match c.discover().await {
                Ok(clients) => clients,
                Err(e) => {
                    debug!("{:?} discovery failed: {}", c.kind(), e);
                    Vec::new()
                }
            }
        });
        let results = join_all(probes).await;

        for (candidate, clients) in self.candidates.iter().zip(results) {
            if !clients.is_empty() {
                debug!("Selected {:?} ({} gateway(s))", candidate.kind(), clients.len());
                return RouterSelection::Clients(candidate.kind(), clients);
            }
        }
        RouterSelection::NoCapableDevice
    }

    /// Open the port on every gateway of the selected service
    ///
    /// Fails if any selected gateway rejects the request. Finding no gateway
    /// at all is reported as [`RouterOutcome::NoCapableDevice`].
    pub async fn add_port_mapping(
        &self,
        request: &PortMappingRequest,
    ) -> Result<RouterOutcome, MappingError> {
        info!(
            "Requesting {} mapping {} -> {}:{} (lease: {}s)",
            request.protocol,
            request.external_port,
            request.internal_client,
            request.internal_port,
            request.lease_secs
        );

        let (kind, clients) = match self.pick_clients().await {
            RouterSelection::Clients(kind, clients) => (kind, clients),
            RouterSelection::NoCapableDevice => {
                warn!("No port-mapping capable gateway found");
                return Ok(RouterOutcome::NoCapableDevice);
            }
        };

        try_join_all(clients.iter().map(|c| c.add_port_mapping(request))).await?;

        info!("Port {} mapped via {:?}", request.external_port, kind);
        Ok(RouterOutcome::Mapped {
            kind,
            clients: clients.len(),
        })
    }
}
