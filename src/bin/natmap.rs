//! natmap command line tool
//!
//! Maps a local port on the router, prints the public address:port and
//! keeps the mapping alive, optionally forwarding the traffic to a target.

use anyhow::Context;
use clap::Parser;
use natmap::connectivity::{detect_local_ip, IpProtocol, Mapping, RouterControl};
use natmap::session::run_forever;
use natmap::Config;
use std::net::IpAddr;
use std::path::PathBuf;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "natmap", version, about = "Expose a local port through the NAT")]
struct Args {
    /// STUN server, host:port
    #[arg(short = 's', long)]
    stun_server: Option<String>,

    /// Local IP address (detected when omitted)
    #[arg(short = 'l', long)]
    local_ip: Option<IpAddr>,

    /// Local and external port
    #[arg(short = 'p', long)]
    port: Option<u16>,

    /// Forward target, host:port
    #[arg(short = 'd', long)]
    target: Option<String>,

    /// Serve `ok` over HTTP on the mapped port
    #[arg(short = 't', long)]
    test_server: bool,

    /// Script run with <local ip> <local port> <public ip> <public port>
    #[arg(short = 'e', long)]
    script: Option<String>,

    /// Map UDP instead of TCP
    #[arg(short = 'u', long)]
    udp: bool,

    /// JSON config file; command line values override it
    #[arg(long)]
    config: Option<PathBuf>,

    /// UDP idle timeout in seconds
    #[arg(long)]
    idle_timeout: Option<u64>,

    /// Keepalive interval in seconds
    #[arg(long)]
    keepalive_interval: Option<u64>,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(stun_server) = self.stun_server {
            config.stun_server = stun_server;
        }
        if let Some(ip) = self.local_ip {
            config.local_ip = Some(ip);
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if self.target.is_some() {
            config.target = self.target;
        }
        if self.test_server {
            config.test_server = true;
        }
        if self.script.is_some() {
            config.script = self.script;
        }
        if self.udp {
            config.protocol = IpProtocol::UDP;
        }
        if let Some(secs) = self.idle_timeout {
            config.idle_timeout_secs = secs;
        }
        if let Some(secs) = self.keepalive_interval {
            config.keepalive_interval_secs = secs;
        }
    }
}

/// Print the public address and hand it to the notification script
fn report(mapping: &Mapping, script: Option<String>) {
    println!("{}", mapping.public_addr);

    let Some(script) = script else { return };
    let args = [
        mapping.local_addr.ip().to_string(),
        mapping.local_addr.port().to_string(),
        mapping.public_addr.ip().to_string(),
        mapping.public_addr.port().to_string(),
    ];
    tokio::spawn(async move {
        match Command::new(&script).args(&args).status().await {
            Ok(status) if status.success() => info!("Script {} finished", script),
            Ok(status) => warn!("Script {} exited with {}", script, status),
            Err(e) => error!("Failed to run script {}: {}", script, e),
        }
    });
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    natmap::init();

    let args = Args::parse();
    let mut config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("loading config from {}", path.display()))?,
        None => Config::default(),
    };
    args.apply(&mut config);

    if config.local_ip.is_none() {
        let ip = detect_local_ip().context("detecting local IP address")?;
        info!("Detected local IP {}", ip);
        config.local_ip = Some(ip);
    }
    config.validate().context("invalid configuration")?;

    let shutdown = CancellationToken::new();
    let on_signal = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            return;
        }
        info!("Ctrl-C received");
        on_signal.cancel();
    });

    let router = RouterControl::with_defaults();
    let script = config.script.clone();
    run_forever(&config, &router, &shutdown, |mapping| {
        report(mapping, script.clone())
    })
    .await;

    Ok(())
}
