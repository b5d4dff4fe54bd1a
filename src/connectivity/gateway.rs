//! Local network facts: default gateway and the LAN address we map to

use super::types::MappingError;
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket};
use tracing::debug;

/// Public resolver used only to pick the outbound interface; nothing is sent
pub const LOCAL_ADDR_PROBE: &str = "223.5.5.5:53";

/// Detect the LAN address of the interface that carries Internet traffic
///
/// Connecting a UDP socket does not emit packets, it only asks the kernel to
/// pick a route, which tells us the source address the router will see.
pub fn detect_local_ip() -> Result<IpAddr, MappingError> {
    let socket = UdpSocket::bind("0.0.0.0:0")?;
    socket.connect(LOCAL_ADDR_PROBE)?;
    let local: SocketAddr = socket.local_addr()?;
    debug!("Outbound interface address is {}", local.ip());
    Ok(local.ip())
}

/// Find the default IPv4 gateway
pub fn find_default_gateway() -> Result<Ipv4Addr, MappingError> {
    #[cfg(target_os = "linux")]
    {
        let table = std::fs::read_to_string("/proc/net/route")
            .map_err(|e| MappingError::Internal(format!("Failed to read route table: {}", e)))?;
        parse_linux_route_table(&table).ok_or(MappingError::NoGateway)
    }

    #[cfg(target_os = "macos")]
    {
        let out = command_output("netstat", &["-rn", "-f", "inet"])?;
        out.lines()
            .filter(|line| line.starts_with("default"))
            .filter_map(|line| line.split_whitespace().nth(1))
            .find_map(|field| field.parse().ok())
            .ok_or(MappingError::NoGateway)
    }

    #[cfg(target_os = "windows")]
    {
        let out = command_output("route", &["print", "0.0.0.0"])?;
        out.lines()
            .map(str::trim)
            .filter(|line| line.starts_with("0.0.0.0"))
            .filter_map(|line| line.split_whitespace().nth(2))
            .find_map(|field| field.parse().ok())
            .ok_or(MappingError::NoGateway)
    }

    #[cfg(not(any(target_os = "linux", target_os = "macos", target_os = "windows")))]
    {
        Err(MappingError::NotSupported)
    }
}

#[cfg(any(target_os = "macos", target_os = "windows"))]
fn command_output(program: &str, args: &[&str]) -> Result<String, MappingError> {
    let output = std::process::Command::new(program)
        .args(args)
        .output()
        .map_err(|e| MappingError::Internal(format!("Failed to run {}: {}", program, e)))?;
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// Extract the default route's gateway from `/proc/net/route`
///
/// Destination `00000000` marks the default route; the gateway column is a
/// little-endian hex IPv4 address.
pub(crate) fn parse_linux_route_table(table: &str) -> Option<Ipv4Addr> {
    table.lines().skip(1).find_map(|line| {
        let mut fields = line.split_whitespace();
        let _iface = fields.next()?;
        let destination = fields.next()?;
        let gateway = fields.next()?;
        if destination != "00000000" {
            return None;
        }
        let raw = u32::from_str_radix(gateway, 16).ok()?;
        Some(Ipv4Addr::from(raw.swap_bytes()))
    })
}
