//! Sockets that share one local port
//!
//! The mapped port is used at the same time by the forwarder's listener, the
//! STUN binding request and the keepalive probe. Every socket created here
//! sets `SO_REUSEADDR` (and `SO_REUSEPORT` on Unix) before binding, so all of
//! them end up on the exact local address:port that was mapped.

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpSocket, TcpStream, UdpSocket};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Backlog for reused listening sockets
const LISTEN_BACKLOG: i32 = 1024;

fn reusable_socket(local: SocketAddr, ty: Type, protocol: Protocol) -> io::Result<Socket> {
    let domain = if local.is_ipv6() {
        Domain::IPV6
    } else {
        Domain::IPV4
    };
    let socket = Socket::new(domain, ty, Some(protocol))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SockAddr::from(local))?;
    Ok(socket)
}

async fn cancellable<T>(
    scope: &CancellationToken,
    fut: impl std::future::Future<Output = io::Result<T>>,
) -> io::Result<T> {
    tokio::select! {
        biased;
        _ = scope.cancelled() => Err(io::Error::new(io::ErrorKind::Interrupted, "session cancelled")),
        res = fut => res,
    }
}

/// Dial a TCP connection to `remote` from exactly `local`
pub async fn dial_tcp(
    scope: &CancellationToken,
    local: SocketAddr,
    remote: SocketAddr,
) -> io::Result<TcpStream> {
    let socket = reusable_socket(local, Type::STREAM, Protocol::TCP)?;
    let socket = TcpSocket::from_std_stream(socket.into());
    let stream = cancellable(scope, socket.connect(remote)).await?;
    debug!("Dialed tcp {} -> {}", local, remote);
    Ok(stream)
}

/// Create a UDP socket bound to `local` and connected to `remote`
pub async fn dial_udp(
    scope: &CancellationToken,
    local: SocketAddr,
    remote: SocketAddr,
) -> io::Result<UdpSocket> {
    let socket = reusable_socket(local, Type::DGRAM, Protocol::UDP)?;
    let socket = UdpSocket::from_std(socket.into())?;
    cancellable(scope, socket.connect(remote)).await?;
    debug!("Dialed udp {} -> {}", local, remote);
    Ok(socket)
}

/// Listen for TCP connections on `local`
pub fn listen_tcp(local: SocketAddr) -> io::Result<TcpListener> {
    let socket = reusable_socket(local, Type::STREAM, Protocol::TCP)?;
    socket.listen(LISTEN_BACKLOG)?;
    let listener = TcpListener::from_std(socket.into())?;
    debug!("Listening tcp on {}", local);
    Ok(listener)
}

/// Bind an unconnected UDP socket on `local`
pub fn listen_udp(local: SocketAddr) -> io::Result<UdpSocket> {
    let socket = reusable_socket(local, Type::DGRAM, Protocol::UDP)?;
    let socket = UdpSocket::from_std(socket.into())?;
    debug!("Listening udp on {}", local);
    Ok(socket)
}

/// Resolve `host:port` to the first address, preferring IPv4
pub async fn resolve(addr: &str) -> io::Result<SocketAddr> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host(addr).await?.collect();
    addrs
        .iter()
        .find(|a| a.is_ipv4())
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("{} did not resolve", addr)))
}
