//! UDP discovery responder: answers any datagram with `"host|port"` so a
//! client broadcasting for Beacon can find it.

use logger::logger::Logger;
use std::net::UdpSocket;
use std::thread;

pub const DEFAULT_DISCOVERY_PORT: u16 = 8020;

/// Binds the discovery socket and spawns a background thread answering
/// every datagram received on it. Returns immediately; the thread runs
/// for the lifetime of the process.
pub fn spawn_responder(port: u16, tcp_port: u16, logger: Logger) -> std::io::Result<()> {
    let socket = UdpSocket::bind(("0.0.0.0", port))?;
    let hostname = local_hostname();

    thread::spawn(move || {
        let mut buf = [0u8; 512];
        loop {
            match socket.recv_from(&mut buf) {
                Ok((_, from)) => {
                    let reply = format!("{hostname}|{tcp_port}");
                    if let Err(e) = socket.send_to(reply.as_bytes(), from) {
                        logger.warn(&format!("discovery reply to {from} failed: {e}"), "discovery");
                    }
                }
                Err(e) => {
                    logger.error(&format!("discovery socket read failed: {e}"), "discovery");
                    break;
                }
            }
        }
    });
    Ok(())
}

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
