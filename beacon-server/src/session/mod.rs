//! Per-connection session state, mirroring the reference node's
//! `Client`: one reader thread decoding frames, one writer thread fed by
//! an `mpsc` channel so a slow socket write never blocks anything that
//! produced the reply.

use beacon_protocol::{Frame, Message};
use logger::logger::Logger;
use std::collections::HashMap;
use std::io::Write;
use std::net::TcpStream;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, RwLock};
use std::thread;

pub use crate::lock::SessionId;

/// Transport-agnostic connection handle: a TCP stream today, a Unix
/// socket after a successful UDS upgrade.
pub enum Transport {
    Tcp(TcpStream),
    #[cfg(unix)]
    Unix(std::os::unix::net::UnixStream),
}

impl Transport {
    fn try_clone(&self) -> std::io::Result<Transport> {
        match self {
            Transport::Tcp(s) => Ok(Transport::Tcp(s.try_clone()?)),
            #[cfg(unix)]
            Transport::Unix(s) => Ok(Transport::Unix(s.try_clone()?)),
        }
    }
}

impl std::io::Read for Transport {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.read(buf),
            #[cfg(unix)]
            Transport::Unix(s) => s.read(buf),
        }
    }
}

impl Write for Transport {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Transport::Tcp(s) => s.write(buf),
            #[cfg(unix)]
            Transport::Unix(s) => s.write(buf),
        }
    }
    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Transport::Tcp(s) => s.flush(),
            #[cfg(unix)]
            Transport::Unix(s) => s.flush(),
        }
    }
}

/// Everything the dispatcher needs to know about one connected client.
/// Held locks are not tracked here: the lock manager already indexes its
/// holder table by session, so death-time release only needs the id.
pub struct ClientSession {
    pub id: SessionId,
    pub peer_addr: String,
    sender: Sender<Message>,
}

impl ClientSession {
    pub fn sender(&self) -> Sender<Message> {
        self.sender.clone()
    }
}

/// Shared table of live sessions, used to deliver asynchronous messages
/// (`LockStolen`, `LockRetry`) to a session from any thread.
#[derive(Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<RwLock<HashMap<SessionId, Sender<Message>>>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: SessionId, sender: Sender<Message>) {
        self.sessions.write().unwrap().insert(id, sender);
    }

    pub fn remove(&self, id: SessionId) {
        self.sessions.write().unwrap().remove(&id);
    }

    /// Best-effort delivery: a session that has already disconnected
    /// simply drops the message, same as a socket write racing a close.
    pub fn send(&self, id: SessionId, message: Message) {
        if let Some(sender) = self.sessions.read().unwrap().get(&id) {
            let _ = sender.send(message);
        }
    }
}

/// Spawns the writer thread and returns the session handle plus the raw
/// transport the reader loop should read frames from.
pub fn spawn(
    id: SessionId,
    peer_addr: String,
    transport: Transport,
    logger: Logger,
) -> std::io::Result<(ClientSession, Transport)> {
    let (tx, rx): (Sender<Message>, Receiver<Message>) = mpsc::channel();
    let writer_transport = transport.try_clone()?;
    spawn_writer_thread(rx, writer_transport, logger, peer_addr.clone());

    let session = ClientSession { id, peer_addr, sender: tx };
    Ok((session, transport))
}

fn spawn_writer_thread(rx: Receiver<Message>, mut transport: Transport, logger: Logger, peer_addr: String) {
    thread::spawn(move || {
        while let Ok(message) = rx.recv() {
            let frame: Frame = message.encode();
            if let Err(e) = frame.write_to(&mut transport) {
                logger.error(&format!("write to {peer_addr} failed: {e}"), "session");
                break;
            }
        }
    });
}
