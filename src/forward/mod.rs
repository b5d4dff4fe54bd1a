//! Relay engines for traffic arriving on the mapped port
//!
//! - TCP: a byte pipe per accepted connection
//! - UDP: a reverse-NAT table with one pseudo-connection per remote peer

pub mod gate;
pub mod tcp;
pub mod udp;

pub use gate::{gate, GateOpener, ReadinessGate};
pub use tcp::{start_tcp_forward, TcpForwarder};
pub use udp::{
    start_udp_forward, PeerCallback, Router, StaticRoute, UdpForwarder, UdpForwarderBuilder,
};

use crate::connectivity::IpProtocol;
use crate::{LogSink, Result};
use std::net::SocketAddr;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// The forwarder a session runs, one per protocol
pub enum Forwarder {
    /// TCP byte pipe
    Tcp(TcpForwarder),
    /// UDP reverse NAT
    Udp(UdpForwarder),
}

impl Forwarder {
    /// Start the forwarder matching `protocol`
    pub async fn start(
        scope: &CancellationToken,
        protocol: IpProtocol,
        local_addr: SocketAddr,
        target: &str,
        idle_timeout: Duration,
        log: LogSink,
    ) -> Result<Self> {
        Ok(match protocol {
            IpProtocol::TCP => {
                Forwarder::Tcp(start_tcp_forward(scope, local_addr, target.to_string(), log).await?)
            }
            IpProtocol::UDP => Forwarder::Udp(
                start_udp_forward(scope, local_addr, target, idle_timeout, log).await?,
            ),
        })
    }

    /// Listening address
    pub fn local_addr(&self) -> SocketAddr {
        match self {
            Forwarder::Tcp(f) => f.local_addr(),
            Forwarder::Udp(f) => f.local_addr(),
        }
    }

    /// Wait until the listener stops
    pub async fn wait(&mut self) -> Result<()> {
        match self {
            Forwarder::Tcp(f) => f.wait().await,
            Forwarder::Udp(f) => f.wait().await,
        }
    }

    /// Stop the forwarder and everything it relays
    pub async fn close(self) {
        match self {
            Forwarder::Tcp(f) => f.close().await,
            Forwarder::Udp(f) => f.close().await,
        }
    }
}
