//! NAT-PMP (NAT Port Mapping Protocol) client - RFC 6886
//!
//! Fallback for gateways without UPnP (Apple AirPort, some Cisco and
//! OpenWrt setups). Two request types are used: the external address
//! request doubles as discovery, and the MAP request opens the port.

use super::gateway::find_default_gateway;
use super::router::{RouterClient, RouterDiscovery};
use super::types::{IpProtocol, MappingError, PortMappingRequest, RouterKind};
use async_trait::async_trait;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// NAT-PMP server port (IANA assigned)
pub(crate) const NATPMP_SERVER_PORT: u16 = 5351;

/// NAT-PMP protocol version
pub(crate) const NATPMP_VERSION: u8 = 0;

/// Default timeout for NAT-PMP requests
const NATPMP_TIMEOUT: Duration = Duration::from_secs(2);

/// Lifetime requested when the lease is 0 ("permanent")
///
/// A requested lifetime of 0 deletes the mapping (RFC 6886 section 3.4).
/// Every session re-issues the request, which renews it.
pub(crate) const NATPMP_DEFAULT_LIFETIME: u32 = 7200;

/// NAT-PMP opcodes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum NatPmpOpcode {
    ExternalAddress = 0,
    MapUdp = 1,
    MapTcp = 2,
}

/// NAT-PMP result codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub(crate) enum NatPmpResultCode {
    Success = 0,
    UnsupportedVersion = 1,
    NotAuthorized = 2,
    NetworkFailure = 3,
    OutOfResources = 4,
    UnsupportedOpcode = 5,
}

impl NatPmpResultCode {
    pub(crate) fn from_u16(code: u16) -> Option<Self> {
        match code {
            0 => Some(Self::Success),
            1 => Some(Self::UnsupportedVersion),
            2 => Some(Self::NotAuthorized),
            3 => Some(Self::NetworkFailure),
            4 => Some(Self::OutOfResources),
            5 => Some(Self::UnsupportedOpcode),
            _ => None,
        }
    }

    pub(crate) fn to_error_message(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::UnsupportedVersion => "Unsupported NAT-PMP version",
            Self::NotAuthorized => "Not authorized/refused",
            Self::NetworkFailure => "Network failure",
            Self::OutOfResources => "Out of resources",
            Self::UnsupportedOpcode => "Unsupported opcode",
        }
    }
}

/// Build a 12-byte MAP request
pub(crate) fn build_map_request(request: &PortMappingRequest) -> [u8; 12] {
    let opcode = match request.protocol {
        IpProtocol::UDP => NatPmpOpcode::MapUdp,
        IpProtocol::TCP => NatPmpOpcode::MapTcp,
    };
    let lifetime = match request.lease_secs {
        0 => NATPMP_DEFAULT_LIFETIME,
        secs => secs,
    };
    let mut packet = [0u8; 12];
    packet[0] = NATPMP_VERSION;
    packet[1] = opcode as u8;
    packet[4..6].copy_from_slice(&request.internal_port.to_be_bytes());
    packet[6..8].copy_from_slice(&request.external_port.to_be_bytes());
    packet[8..12].copy_from_slice(&lifetime.to_be_bytes());
    packet
}

/// Check version, opcode and result code common to every response
fn check_header(response: &[u8], opcode: NatPmpOpcode, min_len: usize) -> Result<(), MappingError> {
    if response.len() < min_len {
        return Err(MappingError::InvalidResponse(format!(
            "Response too short: {} bytes (expected {})",
            response.len(),
            min_len
        )));
    }
    if response[0] != NATPMP_VERSION {
        return Err(MappingError::InvalidResponse(format!(
            "Invalid version: {}",
            response[0]
        )));
    }
    if response[1] != 128 + opcode as u8 {
        return Err(MappingError::InvalidResponse(format!(
            "Unexpected opcode: {}",
            response[1]
        )));
    }
    let code = u16::from_be_bytes([response[2], response[3]]);
    match NatPmpResultCode::from_u16(code) {
        Some(NatPmpResultCode::Success) => Ok(()),
        Some(other) => Err(MappingError::GatewayError(other.to_error_message().to_string())),
        None => Err(MappingError::InvalidResponse(format!("Unknown result code: {}", code))),
    }
}

/// Parse an external address response (12 bytes)
pub(crate) fn parse_external_address_response(response: &[u8]) -> Result<Ipv4Addr, MappingError> {
    check_header(response, NatPmpOpcode::ExternalAddress, 12)?;
    Ok(Ipv4Addr::new(response[8], response[9], response[10], response[11]))
}

/// Parse a MAP response (16 bytes), returning the external port and lifetime
pub(crate) fn parse_map_response(
    response: &[u8],
    protocol: IpProtocol,
) -> Result<(u16, u32), MappingError> {
    let opcode = match protocol {
        IpProtocol::UDP => NatPmpOpcode::MapUdp,
        IpProtocol::TCP => NatPmpOpcode::MapTcp,
    };
    check_header(response, opcode, 16)?;
    let external_port = u16::from_be_bytes([response[10], response[11]]);
    let lifetime = u32::from_be_bytes([response[12], response[13], response[14], response[15]]);
    Ok((external_port, lifetime))
}

async fn exchange(server: SocketAddr, request: &[u8]) -> Result<Vec<u8>, MappingError> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    socket.connect(server).await?;
    socket.send(request).await?;

    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(NATPMP_TIMEOUT, socket.recv(&mut buf))
        .await
        .map_err(|_| MappingError::Timeout)??;
    Ok(buf[..n].to_vec())
}

/// Finds a NAT-PMP server on the default gateway
pub struct NatPmpDiscovery {
    server: Option<SocketAddr>,
}

impl NatPmpDiscovery {
    /// Probe the default gateway
    pub fn new() -> Self {
        Self { server: None }
    }

    /// Probe a specific NAT-PMP server instead of the default gateway
    pub fn with_server(server: SocketAddr) -> Self {
        Self {
            server: Some(server),
        }
    }
}

impl Default for NatPmpDiscovery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RouterDiscovery for NatPmpDiscovery {
    fn kind(&self) -> RouterKind {
        RouterKind::NatPmp
    }

    async fn discover(&self) -> Result<Vec<Arc<dyn RouterClient>>, MappingError> {
        let server = match self.server {
            Some(server) => server,
            None => SocketAddr::new(find_default_gateway()?.into(), NATPMP_SERVER_PORT),
        };

        let request = [NATPMP_VERSION, NatPmpOpcode::ExternalAddress as u8];
        let response = exchange(server, &request).await?;
        let external_ip = parse_external_address_response(&response)?;
        debug!("NAT-PMP server {} reports external IP {}", server, external_ip);

        Ok(vec![Arc::new(NatPmpClient::new(server))])
    }
}

/// A gateway answering NAT-PMP
pub struct NatPmpClient {
    server: SocketAddr,
}

impl NatPmpClient {
    /// Client for the NAT-PMP server at `server`
    pub fn new(server: SocketAddr) -> Self {
        Self { server }
    }
}

#[async_trait]
impl RouterClient for NatPmpClient {
    fn kind(&self) -> RouterKind {
        RouterKind::NatPmp
    }

    async fn add_port_mapping(&self, request: &PortMappingRequest) -> Result<(), MappingError> {
        let packet = build_map_request(request);
        let response = exchange(self.server, &packet).await?;
        let (external_port, lifetime) = parse_map_response(&response, request.protocol)?;

        if external_port != request.external_port {
            warn!(
                "NAT-PMP assigned external port {} instead of {}",
                external_port, request.external_port
            );
        }
        info!(
            "NAT-PMP mapping added on {}: {} -> {} ({}s)",
            self.server, external_port, request.internal_port, lifetime
        );
        Ok(())
    }
}
