//! UDP reverse-NAT forwarder
//!
//! One listening socket, many peers. Every remote address that sends a
//! datagram gets its own pseudo-connection: an outbound socket dialed to the
//! destination chosen by a [`Router`]. Replies read from that socket go back
//! to the remote address through the listening socket.
//!
//! Per remote address the entry moves through
//! `absent -> dialing -> established -> closed`:
//!
//! - The read loop inserts the entry (gate unset) and queues the datagram.
//! - A task routes and dials, then opens the readiness gate.
//! - The uplink task waits on the gate and drains the queue in arrival order.
//! - The downlink task relays replies until the outbound socket errors.
//! - Eviction (read error, idle sweep, close) removes the entry and cancels
//!   its scope, which stops both tasks and drops the socket.
//!
//! Entries carry a generation id so a late removal never hits a newer entry
//! for the same address. A new entry for an address whose previous entry is
//! still shutting down does not dial until the old outbound socket is
//! closed, so the two flows never overlap.

use super::gate::{gate, GateOpener, ReadinessGate};
use crate::connectivity::reuse;
use crate::{Error, LogSink, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Default idle period after which a peer is forgotten
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Default receive buffer; longer datagrams are truncated
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// Datagrams queued per peer while its outbound socket is being dialed
const UPLINK_QUEUE_DEPTH: usize = 1024;

/// Chooses where a remote peer's traffic goes
pub trait Router: Send + Sync {
    /// Destination for `remote`, or `None` to reject the peer
    fn route(&self, remote: SocketAddr) -> Option<SocketAddr>;
}

/// Send every peer to the same destination
#[derive(Debug, Clone, Copy)]
pub struct StaticRoute(pub SocketAddr);

impl Router for StaticRoute {
    fn route(&self, _remote: SocketAddr) -> Option<SocketAddr> {
        Some(self.0)
    }
}

impl<F> Router for F
where
    F: Fn(SocketAddr) -> Option<SocketAddr> + Send + Sync,
{
    fn route(&self, remote: SocketAddr) -> Option<SocketAddr> {
        self(remote)
    }
}

/// Callback receiving a remote peer address
pub type PeerCallback = Arc<dyn Fn(SocketAddr) + Send + Sync>;

fn noop_peer() -> PeerCallback {
    Arc::new(|_| {})
}

enum ListenerSource {
    Addr(SocketAddr),
    Socket(UdpSocket),
}

/// Configures and starts a [`UdpForwarder`]
///
/// Callbacks are fixed here and never change once the forwarder runs.
pub struct UdpForwarderBuilder {
    listener: ListenerSource,
    router: Option<Arc<dyn Router>>,
    timeout: Duration,
    buffer_size: usize,
    on_connect: PeerCallback,
    on_disconnect: PeerCallback,
    log: LogSink,
}

impl Default for UdpForwarderBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpForwarderBuilder {
    /// Listen on an ephemeral port of all interfaces, no logging
    pub fn new() -> Self {
        Self {
            listener: ListenerSource::Addr(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)),
            router: None,
            timeout: DEFAULT_TIMEOUT,
            buffer_size: DEFAULT_BUFFER_SIZE,
            on_connect: noop_peer(),
            on_disconnect: noop_peer(),
            log: Arc::new(|_| {}),
        }
    }

    /// Listen on `addr` (bound through the socket-reuse provider)
    pub fn listen_addr(mut self, addr: SocketAddr) -> Self {
        self.listener = ListenerSource::Addr(addr);
        self
    }

    /// Use an already bound socket
    pub fn socket(mut self, socket: UdpSocket) -> Self {
        self.listener = ListenerSource::Socket(socket);
        self
    }

    /// Forward every peer to `dest`
    pub fn destination(mut self, dest: SocketAddr) -> Self {
        self.router = Some(Arc::new(StaticRoute(dest)));
        self
    }

    /// Route each peer through `router`
    pub fn router(mut self, router: impl Router + 'static) -> Self {
        self.router = Some(Arc::new(router));
        self
    }

    /// Forget peers idle for longer than `timeout`
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Receive buffer size
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Called once a peer's outbound socket is ready
    pub fn on_connect(mut self, callback: PeerCallback) -> Self {
        self.on_connect = callback;
        self
    }

    /// Called once when an established peer is evicted
    pub fn on_disconnect(mut self, callback: PeerCallback) -> Self {
        self.on_disconnect = callback;
        self
    }

    /// Sink for user-visible log lines
    pub fn logger(mut self, log: LogSink) -> Self {
        self.log = log;
        self
    }

    /// Bind (if needed) and start the read loop and the idle sweep
    pub async fn start(self, scope: &CancellationToken) -> Result<UdpForwarder> {
        let router = self
            .router
            .ok_or_else(|| Error::Forward("UDP forwarder needs a destination or router".to_string()))?;
        if self.timeout.is_zero() {
            return Err(Error::Forward("UDP idle timeout must be positive".to_string()));
        }
        if self.buffer_size == 0 {
            return Err(Error::Forward("UDP buffer size must be positive".to_string()));
        }

        let listener = match self.listener {
            ListenerSource::Addr(addr) => reuse::listen_udp(addr)
                .map_err(|e| Error::Forward(format!("Failed to listen on {}: {}", addr, e)))?,
            ListenerSource::Socket(socket) => socket,
        };
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            listener,
            router,
            table: RwLock::new(HashMap::new()),
            timeout: self.timeout,
            buffer_size: self.buffer_size,
            on_connect: self.on_connect,
            on_disconnect: self.on_disconnect,
            log: self.log,
            draining: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            scope: scope.child_token(),
            next_id: AtomicU64::new(1),
        });

        info!("UDP forwarder listening on {} (idle timeout: {:?})", local_addr, self.timeout);
        let read_loop = tokio::spawn(read_loop(shared.clone()));
        tokio::spawn(janitor(shared.clone()));

        Ok(UdpForwarder {
            shared,
            local_addr,
            read_loop: Some(read_loop),
        })
    }
}

/// A peer's outbound socket
///
/// `socket` drops before `_released`, so waiters on the release gate wake
/// only once the socket is closed.
struct Outbound {
    socket: UdpSocket,
    _released: GateOpener<()>,
}

/// One remote peer in the table
struct PseudoConnection {
    id: u64,
    gate: ReadinessGate<Arc<Outbound>>,
    released: ReadinessGate<()>,
    uplink: mpsc::Sender<Bytes>,
    last_active: Instant,
    scope: CancellationToken,
}

struct Shared {
    listener: UdpSocket,
    router: Arc<dyn Router>,
    table: RwLock<HashMap<SocketAddr, PseudoConnection>>,
    timeout: Duration,
    buffer_size: usize,
    on_connect: PeerCallback,
    on_disconnect: PeerCallback,
    log: LogSink,
    /// Release gates of evicted entries whose tasks are still running
    draining: Mutex<HashMap<SocketAddr, ReadinessGate<()>>>,
    closed: AtomicBool,
    scope: CancellationToken,
    next_id: AtomicU64,
}

impl Shared {
    fn read_table(&self) -> RwLockReadGuard<'_, HashMap<SocketAddr, PseudoConnection>> {
        self.table.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write_table(&self) -> RwLockWriteGuard<'_, HashMap<SocketAddr, PseudoConnection>> {
        self.table.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_draining(&self, addr: SocketAddr) -> Option<ReadinessGate<()>> {
        self.draining
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&addr)
    }

    /// Remove `addr` only if it is still generation `id`
    fn remove_if(&self, addr: SocketAddr, id: u64) -> Option<PseudoConnection> {
        let mut table = self.write_table();
        if table.get(&addr).is_some_and(|c| c.id == id) {
            table.remove(&addr)
        } else {
            None
        }
    }

    /// Refresh last activity, taking the write lock only when it has gone
    /// stale by a quarter of the idle timeout
    fn touch(&self, addr: SocketAddr, id: u64) {
        let threshold = self.timeout / 4;
        let stale = self
            .read_table()
            .get(&addr)
            .is_some_and(|c| c.id == id && c.last_active.elapsed() >= threshold);
        if !stale {
            return;
        }
        if let Some(conn) = self.write_table().get_mut(&addr) {
            if conn.id == id {
                conn.last_active = Instant::now();
            }
        }
    }

    /// Queue a datagram from `addr`, creating its entry on first contact
    fn handle(self: &Arc<Self>, data: Bytes, addr: SocketAddr) {
        let existing = self
            .read_table()
            .get(&addr)
            .map(|c| (c.id, c.uplink.clone()));

        let (id, uplink) = match existing {
            Some(found) => found,
            None => match self.insert(addr) {
                Some(created) => created,
                None => return,
            },
        };

        match uplink.try_send(data) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                (self.log)(format!("udp-forward: queue for {} full, dropping datagram", addr));
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Dropping datagram for closing peer {}", addr);
            }
        }
        self.touch(addr, id);
    }

    /// Insert a fresh entry for `addr` and spawn its tasks
    fn insert(self: &Arc<Self>, addr: SocketAddr) -> Option<(u64, mpsc::Sender<Bytes>)> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }

        let mut table = self.write_table();
        if let Some(conn) = table.get(&addr) {
            return Some((conn.id, conn.uplink.clone()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (opener, readiness) = gate();
        let (release, released) = gate();
        let (tx, rx) = mpsc::channel(UPLINK_QUEUE_DEPTH);
        let scope = self.scope.child_token();
        let previous = self.take_draining(addr);
        table.insert(
            addr,
            PseudoConnection {
                id,
                gate: readiness.clone(),
                released,
                uplink: tx.clone(),
                last_active: Instant::now(),
                scope: scope.clone(),
            },
        );
        drop(table);

        debug!("New peer {} (entry {})", addr, id);
        tokio::spawn(uplink(self.clone(), addr, readiness, rx, scope.clone()));
        tokio::spawn(establish(self.clone(), addr, id, opener, release, previous, scope));
        Some((id, tx))
    }

    /// Close an evicted entry and tell the owner about it
    fn evicted(&self, addr: SocketAddr, conn: PseudoConnection) {
        let was_established = conn.gate.is_set();
        conn.scope.cancel();
        if !conn.released.is_released() {
            self.draining
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(addr, conn.released.clone());
        }
        drop(conn);
        if was_established {
            (self.on_disconnect)(addr);
        }
    }

    /// Evict every entry idle for longer than the timeout
    ///
    /// The scan and the removal take the lock separately; socket teardown and
    /// callbacks run with no lock held.
    fn sweep(&self) -> usize {
        self.draining
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|_, released| !released.is_released());

        let candidates: Vec<(SocketAddr, u64)> = self
            .read_table()
            .iter()
            .filter(|(_, c)| c.last_active.elapsed() > self.timeout)
            .map(|(addr, c)| (*addr, c.id))
            .collect();
        if candidates.is_empty() {
            return 0;
        }

        let mut removed = Vec::with_capacity(candidates.len());
        {
            let mut table = self.write_table();
            for (addr, id) in candidates {
                // Touched or replaced since the scan
                let still_idle = table
                    .get(&addr)
                    .is_some_and(|c| c.id == id && c.last_active.elapsed() > self.timeout);
                if let Some(conn) = still_idle.then(|| table.remove(&addr)).flatten() {
                    removed.push((addr, conn));
                }
            }
        }

        let count = removed.len();
        for (addr, conn) in removed {
            debug!("Evicting idle peer {}", addr);
            self.evicted(addr, conn);
        }
        count
    }
}

/// Dial `dest`, binding loopback when the destination is local
async fn dial_outbound(dest: SocketAddr) -> io::Result<UdpSocket> {
    let bind_ip = match dest.ip() {
        IpAddr::V4(ip) if ip.is_loopback() => IpAddr::V4(Ipv4Addr::LOCALHOST),
        IpAddr::V6(ip) if ip.is_loopback() => IpAddr::V6(Ipv6Addr::LOCALHOST),
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    };
    let socket = UdpSocket::bind(SocketAddr::new(bind_ip, 0)).await?;
    socket.connect(dest).await?;
    Ok(socket)
}

/// Route and dial for a new peer, then relay replies back to it
///
/// `previous` is the release gate of an evicted entry for the same address;
/// dialing waits for it.
async fn establish(
    shared: Arc<Shared>,
    addr: SocketAddr,
    id: u64,
    opener: GateOpener<Arc<Outbound>>,
    release: GateOpener<()>,
    previous: Option<ReadinessGate<()>>,
    scope: CancellationToken,
) {
    if let Some(mut previous) = previous {
        tokio::select! {
            biased;
            _ = scope.cancelled() => return,
            _ = previous.wait() => {}
        }
    }

    let Some(dest) = shared.router.route(addr) else {
        debug!("Router rejected peer {}", addr);
        if let Some(conn) = shared.remove_if(addr, id) {
            conn.scope.cancel();
        }
        return;
    };

    let dialed = tokio::select! {
        biased;
        _ = scope.cancelled() => return,
        res = dial_outbound(dest) => res,
    };
    let outbound = match dialed {
        Ok(socket) => Arc::new(Outbound {
            socket,
            _released: release,
        }),
        Err(e) => {
            (shared.log)(format!("udp-forward: failed to dial {} for {}: {}", dest, addr, e));
            if let Some(conn) = shared.remove_if(addr, id) {
                conn.scope.cancel();
            }
            return;
        }
    };

    opener.open(outbound.clone());
    debug!("Peer {} -> {} via {:?}", addr, dest, outbound.socket.local_addr());
    (shared.on_connect)(addr);

    downlink(shared, addr, id, outbound, scope).await;
}

/// Drain a peer's queue into its outbound socket, in arrival order
async fn uplink(
    shared: Arc<Shared>,
    addr: SocketAddr,
    mut readiness: ReadinessGate<Arc<Outbound>>,
    mut queue: mpsc::Receiver<Bytes>,
    scope: CancellationToken,
) {
    let outbound = tokio::select! {
        biased;
        _ = scope.cancelled() => return,
        ready = readiness.wait() => match ready {
            Some(outbound) => outbound,
            None => return,
        },
    };
    drop(readiness);

    loop {
        let next = tokio::select! {
            biased;
            _ = scope.cancelled() => return,
            next = queue.recv() => next,
        };
        let Some(datagram) = next else { return };
        if let Err(e) = outbound.socket.send(&datagram).await {
            (shared.log)(format!("udp-forward: error sending packet from {} to server: {}", addr, e));
        }
    }
}

/// Relay replies from the outbound socket to the peer
async fn downlink(
    shared: Arc<Shared>,
    addr: SocketAddr,
    id: u64,
    outbound: Arc<Outbound>,
    scope: CancellationToken,
) {
    let mut buf = vec![0u8; shared.buffer_size];
    loop {
        let received = tokio::select! {
            biased;
            _ = scope.cancelled() => return,
            res = outbound.socket.recv(&mut buf) => res,
        };
        match received {
            Ok(n) => {
                if let Err(e) = shared.listener.send_to(&buf[..n], addr).await {
                    (shared.log)(format!("udp-forward: error sending packet to client {}: {}", addr, e));
                }
                shared.touch(addr, id);
            }
            Err(e) => {
                if let Some(conn) = shared.remove_if(addr, id) {
                    (shared.log)(format!("udp-forward: abnormal read from {}'s upstream, closing: {}", addr, e));
                    shared.evicted(addr, conn);
                }
                return;
            }
        }
    }
}

async fn read_loop(shared: Arc<Shared>) -> io::Result<()> {
    loop {
        let mut buf = vec![0u8; shared.buffer_size];
        let received = tokio::select! {
            biased;
            _ = shared.scope.cancelled() => return Ok(()),
            res = shared.listener.recv_from(&mut buf) => res,
        };
        match received {
            Ok((n, addr)) => {
                buf.truncate(n);
                shared.handle(Bytes::from(buf), addr);
            }
            Err(e) => {
                if shared.closed.load(Ordering::Acquire) {
                    return Ok(());
                }
                (shared.log)(format!("udp-forward: failed to read, terminating: {}", e));
                return Err(e);
            }
        }
    }
}

async fn janitor(shared: Arc<Shared>) {
    loop {
        tokio::select! {
            biased;
            _ = shared.scope.cancelled() => return,
            _ = tokio::time::sleep(shared.timeout) => {}
        }
        if shared.closed.load(Ordering::Acquire) {
            return;
        }
        let evicted = shared.sweep();
        if evicted > 0 {
            debug!("Idle sweep evicted {} peer(s)", evicted);
        }
    }
}

/// A running UDP reverse-NAT forwarder
pub struct UdpForwarder {
    shared: Arc<Shared>,
    local_addr: SocketAddr,
    read_loop: Option<JoinHandle<io::Result<()>>>,
}

impl UdpForwarder {
    /// Address of the listening socket
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Remote addresses currently in the table
    pub fn connected(&self) -> Vec<SocketAddr> {
        self.shared.read_table().keys().copied().collect()
    }

    /// Number of entries in the table
    pub fn connection_count(&self) -> usize {
        self.shared.read_table().len()
    }

    /// Run one idle sweep now, returning how many peers were evicted
    pub fn sweep(&self) -> usize {
        self.shared.sweep()
    }

    /// Wait for the read loop to end
    ///
    /// `Ok(())` after [`close`](Self::close) or scope cancellation,
    /// [`Error::ListenerClosed`] if the listening socket failed.
    pub async fn wait(&mut self) -> Result<()> {
        let Some(task) = self.read_loop.as_mut() else {
            return Ok(());
        };
        let outcome = task.await;
        self.read_loop = None;
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::ListenerClosed(format!("udp read on {}: {}", self.local_addr, e))),
            Err(e) => Err(Error::ListenerClosed(format!("udp read task: {}", e))),
        }
    }

    /// Mark closed, close every outbound socket, stop the listener
    pub async fn close(mut self) {
        self.shutdown();
        let _ = self.wait().await;
    }

    fn shutdown(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let drained: Vec<PseudoConnection> = self
            .shared
            .write_table()
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        for conn in drained {
            conn.scope.cancel();
        }
        self.shared.scope.cancel();
        info!("UDP forwarder on {} closed", self.local_addr);
    }
}

impl Drop for UdpForwarder {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Start a UDP forwarder on `local_addr` that sends every peer to `target`
pub async fn start_udp_forward(
    scope: &CancellationToken,
    local_addr: SocketAddr,
    target: &str,
    idle_timeout: Duration,
    log: LogSink,
) -> Result<UdpForwarder> {
    let dest = reuse::resolve(target)
        .await
        .map_err(|e| Error::Forward(format!("Failed to resolve {}: {}", target, e)))?;
    let listener = reuse::listen_udp(local_addr)
        .map_err(|e| Error::Forward(format!("Failed to listen on {}: {}", local_addr, e)))?;

    let on_disconnect_log = log.clone();
    UdpForwarderBuilder::new()
        .socket(listener)
        .destination(dest)
        .idle_timeout(idle_timeout)
        .on_disconnect(Arc::new(move |addr| {
            on_disconnect_log(format!("udp-forward: {} disconnected", addr))
        }))
        .logger(log)
        .start(scope)
        .await
        .map_err(|e| {
            warn!("UDP forwarder failed to start: {}", e);
            e
        })
}
