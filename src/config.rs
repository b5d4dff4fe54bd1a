//! Persistent configuration
//!
//! Stored as JSON. Missing fields take their defaults, so a config file only
//! needs the values that differ from them.

use crate::connectivity::{IpProtocol, KeepaliveTiming, MappingRequest};
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

/// natmap configuration
///
/// # Example
/// ```rust,no_run
/// use natmap::Config;
///
/// // Load config (returns default if file doesn't exist)
/// let mut config = Config::load("natmap.json").expect("Failed to load");
///
/// config.port = 9000;
/// config.save("natmap.json").expect("Failed to save");
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// STUN server, `host:port`
    pub stun_server: String,
    /// Local IP the mapping points at; detected when unset
    pub local_ip: Option<IpAddr>,
    /// Local (and external) port
    pub port: u16,
    /// Transport protocol
    pub protocol: IpProtocol,
    /// Forward target, `host:port`
    pub target: Option<String>,
    /// Serve `200 ok` on the mapped port (TCP only)
    pub test_server: bool,
    /// Script run with `<local ip> <local port> <public ip> <public port>`
    pub script: Option<String>,
    /// UDP forwarder idle timeout in seconds
    pub idle_timeout_secs: u64,
    /// Keepalive interval in seconds
    pub keepalive_interval_secs: u64,
    /// Upper bound for one keepalive probe in seconds
    pub probe_timeout_secs: u64,
    /// Upper bound for one keepalive HTTP request in seconds
    pub http_timeout_secs: u64,
    /// Upper bound for the STUN round trip in seconds
    pub discovery_timeout_secs: u64,
    /// URL fetched by the TCP keepalive probe (plain http)
    pub keepalive_url: String,
    /// DNS server queried by the UDP keepalive probe
    pub keepalive_dns_server: String,
    /// Name looked up by the UDP keepalive probe
    pub keepalive_dns_name: String,
    /// Delay before a failed session is restarted, in milliseconds
    pub restart_delay_ms: u64,
    /// Mapping description stored on the router
    pub description: String,
    /// Router lease in seconds, 0 = permanent
    pub lease_secs: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            stun_server: "stunserver.stunprotocol.org:3478".to_string(),
            local_ip: None,
            port: 8086,
            protocol: IpProtocol::TCP,
            target: None,
            test_server: false,
            script: None,
            idle_timeout_secs: 300,
            keepalive_interval_secs: 10,
            probe_timeout_secs: 10,
            http_timeout_secs: 5,
            discovery_timeout_secs: 5,
            keepalive_url: "http://connect.rom.miui.com/generate_204".to_string(),
            keepalive_dns_server: "223.5.5.5:53".to_string(),
            keepalive_dns_name: "baidu.com".to_string(),
            restart_delay_ms: 100,
            description: "natmap".to_string(),
            lease_secs: 0,
        }
    }
}

impl Config {
    /// Load config from a JSON file
    ///
    /// A missing or empty file yields the defaults.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Self::default());
        }

        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;

        if data.trim().is_empty() {
            return Ok(Self::default());
        }

        serde_json::from_str(&data)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))
    }

    /// Save config to a JSON file, creating parent directories
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("Failed to create config directory: {}", e)))?;
        }

        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)
            .map_err(|e| Error::Config(format!("Failed to write {}: {}", path.display(), e)))?;

        Ok(())
    }

    /// Reject values no session could run with
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            return Err(Error::Config("port must be non-zero".to_string()));
        }
        if self.stun_server.trim().is_empty() {
            return Err(Error::Config("STUN server must be set".to_string()));
        }
        let durations = [
            ("idle_timeout_secs", self.idle_timeout_secs),
            ("keepalive_interval_secs", self.keepalive_interval_secs),
            ("probe_timeout_secs", self.probe_timeout_secs),
            ("http_timeout_secs", self.http_timeout_secs),
            ("discovery_timeout_secs", self.discovery_timeout_secs),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, v)| *v == 0) {
            return Err(Error::Config(format!("{} must be positive", name)));
        }
        if !self.keepalive_url.starts_with("http://") {
            return Err(Error::Config(format!(
                "keepalive URL must be plain http: {}",
                self.keepalive_url
            )));
        }
        if self.test_server && self.protocol == IpProtocol::UDP {
            return Err(Error::Config("test server is TCP only".to_string()));
        }
        if self.test_server && self.target.is_some() {
            return Err(Error::Config(
                "test server and forward target both want the mapped port".to_string(),
            ));
        }
        Ok(())
    }

    /// UDP forwarder idle timeout
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Keepalive interval and per-probe timeout
    pub fn keepalive_timing(&self) -> KeepaliveTiming {
        KeepaliveTiming {
            interval: Duration::from_secs(self.keepalive_interval_secs),
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
        }
    }

    /// Delay between two sessions
    pub fn restart_delay(&self) -> Duration {
        Duration::from_millis(self.restart_delay_ms)
    }

    /// The mapping request for a session bound to `local_addr`
    pub fn mapping_request(&self, local_addr: SocketAddr) -> MappingRequest {
        MappingRequest {
            stun_server: self.stun_server.clone(),
            local_addr,
            protocol: self.protocol,
            description: self.description.clone(),
            lease_secs: self.lease_secs,
            discovery_timeout: Duration::from_secs(self.discovery_timeout_secs),
            keepalive: self.keepalive_timing(),
            keepalive_http_url: self.keepalive_url.clone(),
            keepalive_http_timeout: Duration::from_secs(self.http_timeout_secs),
            keepalive_dns_server: self.keepalive_dns_server.clone(),
            keepalive_dns_name: self.keepalive_dns_name.clone(),
        }
    }
}
