//! UDP discovery broadcaster: finds a Beacon server by shouting on the
//! network and waiting for its `"host|port"` reply.

use crate::error::ClientError;
use std::net::{Ipv4Addr, UdpSocket};
use std::time::{Duration, Instant};

pub const DEFAULT_CLIENT_PORT: u16 = 8021;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(3);
const DEFAULT_RETRIES: u32 = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredServer {
    pub host: String,
    pub port: u16,
}

/// Every IPv4 broadcast address reachable from this host's interfaces.
/// A host behind a firewall that drops the limited-broadcast address
/// `255.255.255.255`, or one with several interfaces on different
/// subnets, still gets discovered this way; interfaces with no IPv4
/// broadcast address (loopback, point-to-point links) are skipped.
fn ip4_broadcast_addresses() -> Vec<Ipv4Addr> {
    if_addrs::get_if_addrs()
        .map(|interfaces| {
            interfaces
                .into_iter()
                .filter_map(|iface| match iface.addr {
                    if_addrs::IfAddr::V4(v4) => v4.broadcast,
                    if_addrs::IfAddr::V6(_) => None,
                })
                .collect()
        })
        .unwrap_or_default()
}

/// Broadcasts on every IPv4 broadcast address reachable from this host
/// (or, when `target_host` is set, accepts only a reply claiming that
/// host) and waits up to `DEFAULT_TIMEOUT` for a reply, retrying the
/// broadcast up to `DEFAULT_RETRIES` times.
pub fn discover(discovery_port: u16, target_host: Option<&str>) -> Result<DiscoveredServer, ClientError> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).map_err(|e| ClientError::io(e, "discovery"))?;
    socket.set_broadcast(true).map_err(|e| ClientError::io(e, "discovery"))?;
    socket.set_read_timeout(Some(DEFAULT_TIMEOUT)).map_err(|e| ClientError::io(e, "discovery"))?;

    for _ in 0..DEFAULT_RETRIES {
        for addr in ip4_broadcast_addresses() {
            // Best-effort per interface: one interface refusing the
            // send (down, no route) shouldn't stop the others.
            let _ = socket.send_to(b"BEACON_DISCOVER", (addr, discovery_port));
        }

        let deadline = Instant::now() + DEFAULT_TIMEOUT;
        let mut buf = [0u8; 512];
        while Instant::now() < deadline {
            match socket.recv_from(&mut buf) {
                Ok((len, _)) => {
                    if let Some(found) = parse_reply(&buf[..len]) {
                        if target_host.map_or(true, |host| host == found.host) {
                            return Ok(found);
                        }
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => return Err(ClientError::io(e, "discovery")),
            }
        }
    }

    Err(ClientError::timeout("no beacon server answered the discovery broadcast", "discovery"))
}

/// This process's hostname, used to advertise bus endpoints and to
/// answer a server's `UdsQuery` same-host check.
pub fn local_hostname() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| {
        std::process::Command::new("hostname")
            .output()
            .ok()
            .and_then(|out| String::from_utf8(out.stdout).ok())
            .map(|s| s.trim().to_string())
            .unwrap_or_else(|| "localhost".to_string())
    })
}

fn parse_reply(bytes: &[u8]) -> Option<DiscoveredServer> {
    let text = std::str::from_utf8(bytes).ok()?;
    let (host, port) = text.split_once('|')?;
    Some(DiscoveredServer { host: host.to_string(), port: port.parse().ok()? })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_reply() {
        let reply = parse_reply(b"beamline-host|25000").unwrap();
        assert_eq!(reply.host, "beamline-host");
        assert_eq!(reply.port, 25000);
    }

    #[test]
    fn rejects_malformed_reply() {
        assert!(parse_reply(b"garbage").is_none());
    }
}
