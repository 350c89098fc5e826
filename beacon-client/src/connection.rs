//! The client's transport: a TCP connection (optionally upgraded to a
//! Unix socket) multiplexing request/reply and unsolicited frames, built
//! the same way the reference `Client` does it — one reader thread
//! decoding frames, one writer thread fed by an `mpsc` channel so a slow
//! write never blocks whatever produced it.

use crate::error::ClientError;
use beacon_protocol::{Frame, Message};
use logger::logger::Logger;
use std::collections::HashMap;
use std::io::Write;
use std::net::TcpStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

pub const DEFAULT_UDS_UPGRADE_TIMEOUT: Duration = Duration::from_secs(3);

enum Transport {
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

    /// Shuts down both halves of the underlying socket. `shutdown`
    /// operates on the socket itself, not on this particular cloned file
    /// descriptor, so it reliably unblocks the reader thread's own clone
    /// even though that thread, not this one, owns it.
    fn shutdown(&self) {
        match self {
            Transport::Tcp(s) => {
                let _ = s.shutdown(std::net::Shutdown::Both);
            }
            #[cfg(unix)]
            Transport::Unix(s) => {
                let _ = s.shutdown(std::net::Shutdown::Both);
            }
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

#[derive(Default)]
struct Routes {
    /// msgkey -> channel fed every reply tagged with that msgkey
    /// (`GetDbTree` sends several `DbFile`s before the terminal `DbEnd`).
    by_msgkey: HashMap<String, Sender<Message>>,
    /// lock-key string -> channel waiting for `LockOk`/`LockRetry`.
    by_lock_key: HashMap<String, Sender<Message>>,
    /// `|`-joined resource names -> flag flipped when that lock is stolen.
    stolen_watches: HashMap<String, Arc<AtomicBool>>,
    redis_addr: Vec<Sender<Message>>,
    uds_upgrade: Vec<Sender<Message>>,
}

/// A live connection to a Beacon server.
pub struct Connection {
    sender: Sender<Message>,
    routes: Arc<Mutex<Routes>>,
    next_msgkey: AtomicU64,
    connected: Arc<AtomicBool>,
    logger: Logger,
    /// A clone of the socket kept only to shut it down on `Drop`. The
    /// reader and writer threads hold their own clones and would
    /// otherwise keep the connection alive indefinitely after every
    /// `Arc<Connection>` the caller held goes out of scope.
    shutdown_handle: Transport,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown_handle.shutdown();
    }
}

impl Connection {
    pub fn connect(host: &str, port: u16, logger: Logger) -> Result<Arc<Self>, ClientError> {
        let stream = TcpStream::connect((host, port)).map_err(|e| ClientError::io(e, "connection"))?;
        stream.set_nodelay(true).map_err(|e| ClientError::io(e, "connection"))?;
        Self::from_transport(Transport::Tcp(stream), logger)
    }

    #[cfg(unix)]
    pub fn connect_unix(path: impl AsRef<std::path::Path>, logger: Logger) -> Result<Arc<Self>, ClientError> {
        let stream = std::os::unix::net::UnixStream::connect(path).map_err(|e| ClientError::io(e, "connection"))?;
        Self::from_transport(Transport::Unix(stream), logger)
    }

    /// Connects over TCP to `host:port`, then offers the server the
    /// Unix-socket upgrade: if the server reports the client shares its
    /// host, reconnects over the path it hands back and drops the TCP
    /// connection; otherwise keeps using TCP.
    pub fn establish(host: &str, port: u16, logger: Logger) -> Result<Arc<Self>, ClientError> {
        let tcp = Self::connect(host, port, logger.clone())?;
        let rx = tcp.await_uds_upgrade();
        tcp.send(Message::UdsQuery { hostname: crate::discovery::local_hostname() })?;

        let deadline = Instant::now() + DEFAULT_UDS_UPGRADE_TIMEOUT;
        match Self::recv_until(&rx, deadline, "connection") {
            #[cfg(unix)]
            Ok(Message::UdsOk { path }) => Ok(Self::connect_unix(&path, logger).unwrap_or(tcp)),
            _ => Ok(tcp),
        }
    }

    fn from_transport(transport: Transport, logger: Logger) -> Result<Arc<Self>, ClientError> {
        let (tx, rx) = mpsc::channel();
        let writer_transport = transport.try_clone().map_err(|e| ClientError::io(e, "connection"))?;
        let shutdown_handle = transport.try_clone().map_err(|e| ClientError::io(e, "connection"))?;
        let reader_transport = transport;

        let routes = Arc::new(Mutex::new(Routes::default()));
        let connected = Arc::new(AtomicBool::new(true));

        spawn_writer(rx, writer_transport, logger.clone());
        spawn_reader(reader_transport, routes.clone(), tx.clone(), connected.clone(), logger.clone());

        Ok(Arc::new(Connection {
            sender: tx,
            routes,
            next_msgkey: AtomicU64::new(1),
            connected,
            logger,
            shutdown_handle,
        }))
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn send(&self, message: Message) -> Result<(), ClientError> {
        if !self.is_connected() {
            return Err(ClientError::disconnected("connection is closed", "connection"));
        }
        self.sender.send(message).map_err(|_| ClientError::disconnected("writer thread gone", "connection"))
    }

    pub fn next_msgkey(&self) -> String {
        self.next_msgkey.fetch_add(1, Ordering::SeqCst).to_string()
    }

    /// Registers a waiter for replies tagged `msgkey` and returns the
    /// receiving half. Caller is responsible for deregistering via
    /// [`Connection::forget_msgkey`] once done (done automatically for
    /// the single-reply helpers in `config_client`).
    pub fn await_msgkey(&self, msgkey: &str) -> Receiver<Message> {
        let (tx, rx) = mpsc::channel();
        self.routes.lock().unwrap().by_msgkey.insert(msgkey.to_string(), tx);
        rx
    }

    pub fn forget_msgkey(&self, msgkey: &str) {
        self.routes.lock().unwrap().by_msgkey.remove(msgkey);
    }

    pub fn await_lock_reply(&self, key: &str) -> Receiver<Message> {
        let (tx, rx) = mpsc::channel();
        self.routes.lock().unwrap().by_lock_key.insert(key.to_string(), tx);
        rx
    }

    pub fn watch_stolen(&self, names_key: &str, flag: Arc<AtomicBool>) {
        self.routes.lock().unwrap().stolen_watches.insert(names_key.to_string(), flag);
    }

    pub fn unwatch_stolen(&self, names_key: &str) {
        self.routes.lock().unwrap().stolen_watches.remove(names_key);
    }

    pub fn await_redis_address(&self) -> Receiver<Message> {
        let (tx, rx) = mpsc::channel();
        self.routes.lock().unwrap().redis_addr.push(tx);
        rx
    }

    pub fn await_uds_upgrade(&self) -> Receiver<Message> {
        let (tx, rx) = mpsc::channel();
        self.routes.lock().unwrap().uds_upgrade.push(tx);
        rx
    }

    /// Blocking receive with an overall deadline, used by every
    /// request/reply helper built on top of a `Connection`.
    pub fn recv_until(rx: &Receiver<Message>, deadline: Instant, module: &'static str) -> Result<Message, ClientError> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(message) => Ok(message),
            Err(RecvTimeoutError::Timeout) => Err(ClientError::timeout("no reply before deadline", module)),
            Err(RecvTimeoutError::Disconnected) => {
                Err(ClientError::disconnected("connection closed while waiting for a reply", module))
            }
        }
    }
}

fn spawn_writer(rx: Receiver<Message>, mut transport: Transport, logger: Logger) {
    thread::spawn(move || {
        while let Ok(message) = rx.recv() {
            let frame: Frame = message.encode();
            if let Err(e) = frame.write_to(&mut transport) {
                logger.error(&format!("beacon connection write failed: {e}"), "connection");
                break;
            }
        }
    });
}

fn spawn_reader(
    mut transport: Transport,
    routes: Arc<Mutex<Routes>>,
    writer: Sender<Message>,
    connected: Arc<AtomicBool>,
    logger: Logger,
) {
    thread::spawn(move || {
        loop {
            let frame = match Frame::read_from(&mut transport) {
                Ok(frame) => frame,
                Err(_) => break,
            };
            let message = match Message::decode(&frame) {
                Ok(m) => m,
                Err(e) => {
                    logger.warn(&format!("malformed frame from server: {e}"), "connection");
                    continue;
                }
            };
            route(message, &routes, &writer, &logger);
        }
        connected.store(false, Ordering::SeqCst);
    });
}

fn route(message: Message, routes: &Arc<Mutex<Routes>>, writer: &Sender<Message>, logger: &Logger) {
    let mut guard = routes.lock().unwrap();
    match message {
        Message::GetFileOk { ref msgkey, .. }
        | Message::GetFileFailed { ref msgkey, .. }
        | Message::DbFile { ref msgkey, .. }
        | Message::SetFileOk { ref msgkey }
        | Message::SetFileFailed { ref msgkey, .. }
        | Message::RemoveFileOk { ref msgkey }
        | Message::RemoveFileFailed { ref msgkey, .. }
        | Message::MovePathOk { ref msgkey }
        | Message::MovePathFailed { ref msgkey, .. } => {
            if let Some(tx) = guard.by_msgkey.get(msgkey) {
                let _ = tx.send(message);
            }
        }
        Message::DbEnd { ref msgkey } => {
            if let Some(tx) = guard.by_msgkey.remove(msgkey) {
                let _ = tx.send(message);
            }
        }

        Message::LockOk { ref key } | Message::LockRetry { ref key } => {
            if let Some(tx) = guard.by_lock_key.remove(key) {
                let _ = tx.send(message);
            }
        }
        Message::LockStolen { ref names } => {
            let names_key = names.join("|");
            if let Some(flag) = guard.stolen_watches.get(&names_key) {
                flag.store(true, Ordering::SeqCst);
            }
            let _ = writer.send(Message::LockStolenAck { names: names.clone() });
        }

        Message::RedisAddrReply { .. } => {
            if let Some(tx) = guard.redis_addr.pop() {
                let _ = tx.send(message);
            }
        }
        Message::UdsOk { .. } | Message::UdsFailed => {
            if let Some(tx) = guard.uds_upgrade.pop() {
                let _ = tx.send(message);
            }
        }

        Message::Unknown(echoed) => {
            logger.warn(&format!("server rejected request starting with '{echoed}'"), "connection");
        }
        other => {
            logger.warn(&format!("unexpected message from server: {other:?}"), "connection");
        }
    }
}
