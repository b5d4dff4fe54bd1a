//! natmap - expose a local service through the public side of a NAT
//!
//! This library maps a local port on the router (UPnP IGD / NAT-PMP), learns
//! the public address:port through a STUN binding request, keeps the mapping
//! warm with periodic probes sent from the same local port, and relays the
//! traffic arriving on that port to a local target over TCP or UDP.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod connectivity;
pub mod forward;
pub mod health;
pub mod session;

#[cfg(test)]
mod tests;

use std::sync::Arc;

pub use config::Config;

/// Result type alias for natmap operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for natmap operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Port mapping, discovery or keepalive error
    #[error("Mapping error: {0}")]
    Mapping(#[from] connectivity::MappingError),

    /// Forwarder setup error
    #[error("Forward error: {0}")]
    Forward(String),

    /// A listening socket stopped serving while its session was alive
    #[error("Listener closed: {0}")]
    ListenerClosed(String),

    /// Invalid or unreadable configuration
    #[error("Config error: {0}")]
    Config(String),

    /// General I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization error
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP/Hyper error
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),
}

/// Notification sink for user-visible events (probe failures, dial
/// failures, peer disconnects). The core never prints; it calls this.
pub type LogSink = Arc<dyn Fn(String) + Send + Sync>;

/// Build a [`LogSink`] that forwards every line to `tracing` at info level
pub fn tracing_sink() -> LogSink {
    Arc::new(|line: String| tracing::info!("{}", line))
}

/// Initialize logging
///
/// Honours `RUST_LOG`, defaulting to `info`.
pub fn init() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
