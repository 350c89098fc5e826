//! TCP-to-Unix-socket upgrade negotiation.
//!
//! A same-host client is handed a path to a Unix-domain-socket listener
//! (created lazily on first use) and expected to reconnect there; a
//! remote client is told to stay on TCP. The new UDS connection is an
//! unrelated session — state never migrates (see the design notes on
//! this in the top-level design document).

use logger::logger::Logger;
use std::path::PathBuf;
use std::sync::Mutex;
use std::thread;

#[cfg(unix)]
use std::os::unix::net::{UnixListener, UnixStream};

pub fn socket_path(tcp_port: u16) -> PathBuf {
    std::env::temp_dir().join(format!("beacon-{tcp_port}.sock"))
}

/// True when `hostname` names the machine this process is running on.
pub fn same_host(hostname: &str) -> bool {
    hostname == crate::discovery::local_hostname()
}

#[derive(Default)]
pub struct UdsManager {
    started: Mutex<bool>,
}

impl UdsManager {
    pub fn new() -> Self {
        UdsManager { started: Mutex::new(false) }
    }

    /// Lazily binds the Unix listener at `path` and spawns an accept
    /// loop calling `on_accept` for every new connection. A second call
    /// is a no-op: the listener, once started, lives for the process.
    #[cfg(unix)]
    pub fn ensure_started(
        &self,
        path: PathBuf,
        logger: Logger,
        on_accept: impl Fn(UnixStream) + Send + 'static,
    ) -> std::io::Result<()> {
        let mut started = self.started.lock().unwrap();
        if *started {
            return Ok(());
        }

        let _ = std::fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        *started = true;
        drop(started);

        thread::spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => on_accept(stream),
                    Err(e) => {
                        logger.error(&format!("uds accept failed: {e}"), "transport");
                        break;
                    }
                }
            }
        });
        Ok(())
    }
}
