//! Common types for connectivity module

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// The public side of a session: what the outside world dials to reach us
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Mapping {
    /// Public address:port reported by the STUN server
    pub public_addr: SocketAddr,
    /// Local address:port the mapping points at
    pub local_addr: SocketAddr,
    /// Transport protocol of the mapping
    pub protocol: IpProtocol,
    /// How the router was asked to open the port
    pub router: RouterOutcome,
    /// When the mapping was established
    pub created_at: DateTime<Utc>,
}

/// Errors that can occur while mapping, discovering or keeping a port alive
#[derive(Debug, Error)]
pub enum MappingError {
    /// Network timeout waiting for response
    #[error("Mapping request timed out")]
    Timeout,

    /// Invalid response from gateway or STUN server
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// Gateway returned an error
    #[error("Gateway error: {0}")]
    GatewayError(String),

    /// No gateway found on network
    #[error("No gateway found")]
    NoGateway,

    /// Protocol not supported by gateway or platform
    #[error("Protocol not supported")]
    NotSupported,

    /// STUN binding request failed
    #[error("Discovery failed: {0}")]
    Discovery(String),

    /// Keepalive probe failed
    #[error("Keepalive probe failed: {0}")]
    Probe(String),

    /// The session scope was cancelled while the operation was in flight
    #[error("Operation cancelled")]
    Cancelled,

    /// IO error during communication
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// IP protocol numbers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum IpProtocol {
    /// TCP protocol
    TCP = 6,
    /// UDP protocol
    UDP = 17,
}

impl fmt::Display for IpProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpProtocol::TCP => write!(f, "TCP"),
            IpProtocol::UDP => write!(f, "UDP"),
        }
    }
}

/// Router control services, listed in the order they are preferred
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum RouterKind {
    /// UPnP IGDv2 WANIPConnection:2
    WanIpConnection2,
    /// UPnP WANIPConnection:1
    WanIpConnection1,
    /// UPnP WANPPPConnection:1
    WanPppConnection1,
    /// NAT Port Mapping Protocol (RFC 6886)
    NatPmp,
}

/// Parameters of an AddPortMapping call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortMappingRequest {
    /// Remote host filter, empty for any
    pub remote_host: String,
    /// Port opened on the gateway
    pub external_port: u16,
    /// Transport protocol
    pub protocol: IpProtocol,
    /// Port on the internal host
    pub internal_port: u16,
    /// Internal host that receives the traffic
    pub internal_client: IpAddr,
    /// Whether the mapping is enabled
    pub enabled: bool,
    /// Free-form description shown in the router UI
    pub description: String,
    /// Lease in seconds, 0 = permanent
    pub lease_secs: u32,
}

/// What the router-control step achieved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RouterOutcome {
    /// Every client of the selected service accepted the mapping
    Mapped {
        /// Service the mapping went through
        kind: RouterKind,
        /// Number of gateways that accepted it
        clients: usize,
    },
    /// No gateway on the network answered any candidate probe
    NoCapableDevice,
}

/// Callback receiving keepalive failures
pub type FailureSink = Arc<dyn Fn(MappingError) + Send + Sync>;

/// Wraps a [`FailureSink`] so that only the first failure reaches it
#[derive(Clone)]
pub struct FailureOnce {
    fired: Arc<AtomicBool>,
    sink: FailureSink,
}

impl FailureOnce {
    /// Create a new once-latched failure reporter
    pub fn new(sink: FailureSink) -> Self {
        Self {
            fired: Arc::new(AtomicBool::new(false)),
            sink,
        }
    }

    /// Report a failure. Returns `true` if the sink was actually called.
    pub fn report(&self, err: MappingError) -> bool {
        if self.fired.swap(true, Ordering::AcqRel) {
            return false;
        }
        (self.sink)(err);
        true
    }

    /// Whether a failure has been reported already
    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::Acquire)
    }
}
