//! Diagnostic HTTP server on the mapped port
//!
//! Answers every request with `200 ok` so the public address can be checked
//! from outside with a browser or `curl`.

use crate::connectivity::reuse;
use crate::{Error, Result};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// A running diagnostic server
pub struct HealthServer {
    local_addr: SocketAddr,
    scope: CancellationToken,
    task: Option<JoinHandle<io::Result<()>>>,
}

impl HealthServer {
    /// Address the server listens on
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Wait for the accept loop to end; an accept failure is `ListenerClosed`
    pub async fn wait(&mut self) -> Result<()> {
        let Some(task) = self.task.as_mut() else {
            return Ok(());
        };
        let outcome = task.await;
        self.task = None;
        match outcome {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(Error::ListenerClosed(format!("test server on {}: {}", self.local_addr, e))),
            Err(e) => Err(Error::ListenerClosed(format!("test server task: {}", e))),
        }
    }

    /// Stop serving
    pub async fn close(mut self) {
        self.scope.cancel();
        let _ = self.wait().await;
    }
}

impl Drop for HealthServer {
    fn drop(&mut self) {
        self.scope.cancel();
    }
}

/// Serve `200 ok` on `local_addr` until `scope` is cancelled
pub fn serve(scope: &CancellationToken, local_addr: SocketAddr) -> Result<HealthServer> {
    let listener = reuse::listen_tcp(local_addr)
        .map_err(|e| Error::Forward(format!("Failed to bind test server to {}: {}", local_addr, e)))?;
    let bound = listener.local_addr()?;
    let scope = scope.child_token();

    let task = tokio::spawn(accept_loop(listener, scope.clone()));
    info!("Test server listening on {}", bound);

    Ok(HealthServer {
        local_addr: bound,
        scope,
        task: Some(task),
    })
}

async fn accept_loop(listener: TcpListener, scope: CancellationToken) -> io::Result<()> {
    loop {
        let (stream, remote_addr) = tokio::select! {
            biased;
            _ = scope.cancelled() => return Ok(()),
            res = listener.accept() => match res {
                Ok(conn) => conn,
                Err(e) if e.kind() == io::ErrorKind::ConnectionAborted => continue,
                Err(e) => {
                    error!("Test server accept failed: {}", e);
                    return Err(e);
                }
            },
        };
        debug!("Test server: connection from {}", remote_addr);

        let io = TokioIo::new(stream);
        let conn_scope = scope.clone();
        tokio::spawn(async move {
            let conn = http1::Builder::new().serve_connection(io, service_fn(handle_request));
            tokio::select! {
                biased;
                _ = conn_scope.cancelled() => {}
                res = conn => {
                    if let Err(e) = res {
                        debug!("Test server connection from {}: {}", remote_addr, e);
                    }
                }
            }
        });
    }
}

async fn handle_request(
    req: Request<Incoming>,
) -> std::result::Result<Response<Full<Bytes>>, Infallible> {
    debug!("Test server: {} {}", req.method(), req.uri());
    let mut response = Response::new(Full::new(Bytes::from_static(b"ok")));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/plain"));
    Ok(response)
}
