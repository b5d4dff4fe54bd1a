//! Session driver
//!
//! A session owns one cancellation scope. Everything it starts (forwarder,
//! test server, keepalive) runs inside that scope, and the first failure
//! from any of them is written to an [`ErrorLatch`] which cancels the scope.
//! [`run_forever`] restarts sessions until shutdown.

use crate::connectivity::{
    detect_local_ip, open_mapping, FailureSink, Mapping, MappingError, RouterControl,
};
use crate::forward::Forwarder;
use crate::health;
use crate::{tracing_sink, Config, Error, Result};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// First-error latch
///
/// Holds at most one error. The first [`fail`](Self::fail) stores its error
/// and cancels the scope; later calls are no-ops.
#[derive(Clone)]
pub struct ErrorLatch {
    slot: Arc<Mutex<Option<Error>>>,
    scope: CancellationToken,
}

impl ErrorLatch {
    /// Latch bound to `scope`
    pub fn new(scope: CancellationToken) -> Self {
        Self {
            slot: Arc::new(Mutex::new(None)),
            scope,
        }
    }

    /// Record `err` if nothing is recorded yet, then cancel the scope.
    /// Returns `true` if `err` was the one kept.
    pub fn fail(&self, err: Error) -> bool {
        let kept = {
            let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                false
            } else {
                *slot = Some(err);
                true
            }
        };
        self.scope.cancel();
        kept
    }

    /// Whether an error has been recorded
    pub fn is_set(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Take the recorded error
    pub fn take(&self) -> Option<Error> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// The scope this latch cancels
    pub fn scope(&self) -> &CancellationToken {
        &self.scope
    }
}

/// Local address of a session: configured IP or the detected one, plus the port
pub fn session_addr(config: &Config) -> Result<SocketAddr> {
    let ip = match config.local_ip {
        Some(ip) => ip,
        None => detect_local_ip()?,
    };
    Ok(SocketAddr::new(ip, config.port))
}

/// Turn the end of a listener task into a session failure unless the
/// session is already going down
fn watch_listener<F>(latch: ErrorLatch, what: &'static str, wait: F) -> JoinHandle<()>
where
    F: std::future::Future<Output = Result<()>> + Send + 'static,
{
    tokio::spawn(async move {
        let outcome = wait.await;
        if latch.scope().is_cancelled() {
            debug!("{} stopped with the session", what);
            return;
        }
        let err = match outcome {
            Ok(()) => Error::ListenerClosed(format!("{} stopped", what)),
            Err(e) => e,
        };
        latch.fail(err);
    })
}

/// Run one session until it fails or `shutdown` fires
///
/// `on_mapped` is called once with the mapping when the public address is
/// known. Returns the first error of the session, or `Ok(())` when it ended
/// because of `shutdown`.
pub async fn run_session<F>(
    config: &Config,
    router: &RouterControl,
    shutdown: &CancellationToken,
    on_mapped: F,
) -> Result<()>
where
    F: FnOnce(&Mapping),
{
    let scope = shutdown.child_token();
    let latch = ErrorLatch::new(scope.clone());
    let log = tracing_sink();
    let local_addr = session_addr(config)?;
    let mut watchers = Vec::new();

    if let Some(target) = &config.target {
        let started = Forwarder::start(
            &scope,
            config.protocol,
            local_addr,
            target,
            config.idle_timeout(),
            log.clone(),
        )
        .await;
        match started {
            Ok(mut forwarder) => {
                info!("Forwarding {} {} -> {}", config.protocol, forwarder.local_addr(), target);
                watchers.push(watch_listener(latch.clone(), "forwarder", async move {
                    forwarder.wait().await
                }));
            }
            Err(e) => {
                latch.fail(e);
            }
        }
    }

    if config.test_server && !latch.is_set() {
        match health::serve(&scope, local_addr) {
            Ok(mut server) => {
                watchers.push(watch_listener(latch.clone(), "test server", async move {
                    server.wait().await
                }));
            }
            Err(e) => {
                latch.fail(e);
            }
        }
    }

    let failure_latch = latch.clone();
    let failure_log = log.clone();
    let on_failure: FailureSink = Arc::new(move |err: MappingError| {
        if failure_latch.scope().is_cancelled() {
            debug!("Ignoring keepalive error after shutdown: {}", err);
            return;
        }
        failure_log(format!("keepalive: {}", err));
        failure_latch.fail(Error::Mapping(err));
    });

    let request = config.mapping_request(local_addr);
    let handle = if latch.is_set() {
        None
    } else {
        match open_mapping(&scope, router, &request, on_failure).await {
            Ok(handle) => Some(handle),
            Err(MappingError::Cancelled) if scope.is_cancelled() => None,
            Err(e) => {
                latch.fail(Error::Mapping(e));
                None
            }
        }
    };

    if let Some(handle) = &handle {
        on_mapped(handle.mapping());
    }

    scope.cancelled().await;

    if let Some(handle) = handle {
        handle.close().await;
    }
    for watcher in watchers {
        let _ = watcher.await;
    }

    match latch.take() {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

/// Run sessions back to back until `shutdown` fires
///
/// A failed session is logged and restarted after the configured delay.
pub async fn run_forever<F>(
    config: &Config,
    router: &RouterControl,
    shutdown: &CancellationToken,
    on_mapped: F,
) where
    F: Fn(&Mapping),
{
    loop {
        match run_session(config, router, shutdown, &on_mapped).await {
            Ok(()) => debug!("Session ended"),
            Err(e) => error!("Session failed: {}", e),
        }
        if shutdown.is_cancelled() {
            break;
        }

        tokio::select! {
            biased;
            _ = shutdown.cancelled() => break,
            _ = tokio::time::sleep(config.restart_delay()) => {}
        }
        info!("Restarting session");
    }
    info!("Shutting down");
}
