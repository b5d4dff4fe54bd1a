//! TCP forwarder: accept on the mapped port, pipe bytes to a fixed target

use crate::connectivity::reuse;
use crate::{Error, LogSink, Result};
use std::io;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Accept errors that only concern the connection being accepted
fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

/// A running TCP forwarder
pub struct TcpForwarder {
    local_addr: SocketAddr,
    scope: CancellationToken,
    accept_loop: Option<JoinHandle<io::Result<()>>>,
}

impl TcpForwarder {
    /// Address the listener is bound to
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the accept loop to end
    ///
    /// `Ok(())` when it stopped because the forwarder was closed, otherwise
    /// [`Error::ListenerClosed`].
    pub async fn wait(&mut self) -> Result<()> {
        let Some(task) = self.accept_loop.as_mut() else {
            return Ok(());
        };
        let outcome = task.await;
        self.accept_loop = None;
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::ListenerClosed(format!("tcp accept on {}: {}", self.local_addr, e))),
            Err(e) => Err(Error::ListenerClosed(format!("tcp accept task: {}", e))),
        }
    }

    /// Stop accepting and tear down every open pipe
    pub async fn close(mut self) {
        self.scope.cancel();
        let _ = self.wait().await;
    }
}

impl Drop for TcpForwarder {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}

/// Start forwarding connections accepted on `local_addr` to `target`
///
/// The listener goes through the socket-reuse provider so it can share the
/// mapped port. A target that cannot be dialed only costs that one
/// connection; the listener keeps accepting.
pub async fn start_tcp_forward(
    scope: &CancellationToken,
    local_addr: SocketAddr,
    target: String,
    log: LogSink,
) -> Result<TcpForwarder> {
    let listener = reuse::listen_tcp(local_addr)
        .map_err(|e| Error::Forward(format!("Failed to listen on {}: {}", local_addr, e)))?;
    let bound = listener.local_addr()?;
    let scope = scope.child_token();

    info!("TCP forwarder {} -> {}", bound, target);
    let accept_loop = tokio::spawn(accept_loop(listener, target, scope.clone(), log));

    Ok(TcpForwarder {
        local_addr: bound,
        scope,
        accept_loop: Some(accept_loop),
    })
}

async fn accept_loop(
    listener: TcpListener,
    target: String,
    scope: CancellationToken,
    log: LogSink,
) -> io::Result<()> {
    loop {
        let accepted = tokio::select! {
            biased;
            _ = scope.cancelled() => return Ok(()),
            res = listener.accept() => res,
        };
        let (client, peer) = match accepted {
            Ok(conn) => conn,
            Err(e) if is_transient(&e) => {
                log(format!("tcp-forward: accept: {}", e));
                continue;
            }
            Err(e) => {
                log(format!("tcp-forward: accept failed, stopping: {}", e));
                return Err(e);
            }
        };

        debug!("Accepted {}", peer);
        tokio::spawn(relay(client, peer, target.clone(), scope.clone(), log.clone()));
    }
}

async fn relay(
    mut client: TcpStream,
    peer: SocketAddr,
    target: String,
    scope: CancellationToken,
    log: LogSink,
) {
    let dialed = tokio::select! {
        biased;
        _ = scope.cancelled() => return,
        res = TcpStream::connect(target.as_str()) => res,
    };
    let mut upstream = match dialed {
        Ok(stream) => stream,
        Err(e) => {
            log(format!("tcp-forward: dial {} for {}: {}", target, peer, e));
            return;
        }
    };

    let (mut client_rx, mut client_tx) = client.split();
    let (mut upstream_rx, mut upstream_tx) = upstream.split();

    // First direction to finish ends the pair; both sockets drop on return
    tokio::select! {
        biased;
        _ = scope.cancelled() => {}
        res = tokio::io::copy(&mut client_rx, &mut upstream_tx) => {
            debug!("{} -> {} finished: {:?}", peer, target, res);
        }
        res = tokio::io::copy(&mut upstream_rx, &mut client_tx) => {
            debug!("{} -> {} finished: {:?}", target, peer, res);
        }
    }
}
