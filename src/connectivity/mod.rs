//! Connectivity module: open a port on the router and keep it open
//!
//! - Router control through UPnP IGD or NAT-PMP, probed concurrently and
//!   picked by priority
//! - Public address discovery with a STUN binding request
//! - Keepalive probes sent from the mapped port
//! - Sockets sharing the mapped local port

// Submodules
pub mod gateway;
pub mod keepalive;
pub mod natpmp;
pub mod orchestrator;
pub mod reuse;
pub mod router;
pub mod stun;
pub mod types;
pub mod upnp;

// Re-export commonly used types
pub use types::{
    FailureOnce, FailureSink, IpProtocol, Mapping, MappingError, PortMappingRequest, RouterKind,
    RouterOutcome,
};

// Re-export main functions
pub use gateway::{detect_local_ip, find_default_gateway};
pub use keepalive::{run_keepalive, DnsProbe, HttpProbe, KeepaliveProbe, KeepaliveTiming};
pub use orchestrator::{open_mapping, MappingHandle, MappingRequest};
pub use router::{RouterClient, RouterControl, RouterDiscovery, RouterSelection};
pub use stun::{get_mapped_address, StunTransport};
