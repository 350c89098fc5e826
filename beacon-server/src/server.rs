//! The Beacon process itself: binds the listeners, accepts connections,
//! and dispatches decoded frames to the lock manager, the config store,
//! or a trivial query — one reader thread and one writer thread per
//! connection, exactly as the session module describes.

use crate::config::ServerConfig;
use crate::discovery;
use crate::error::BeaconError;
use crate::lock::{LockManager, LockResult, SessionId};
use crate::session::{self, SessionRegistry, Transport};
use crate::store::ConfigStore;
use crate::transport::{self, UdsManager};
use beacon_protocol::{Frame, Message};
use common::LockKey;
use logger::logger::Logger;
use std::net::TcpListener;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

const STEAL_TIMEOUT: Duration = Duration::from_secs(3);

pub struct Server {
    config: ServerConfig,
    logger: Logger,
    lock_manager: LockManager,
    store: ConfigStore,
    sessions: SessionRegistry,
    uds: UdsManager,
    next_session_id: AtomicU64,
    redis_address: String,
    shutting_down: AtomicBool,
}

impl Server {
    pub fn new(config: ServerConfig) -> Result<Arc<Self>, BeaconError> {
        let logger = Logger::new(&config.log_file);
        let store = ConfigStore::open(config.db_path.clone())?;
        let redis_host = config.redis_host.clone().unwrap_or_else(discovery::local_hostname);
        let redis_address = match config.redis_port {
            Some(port) => format!("{redis_host}:{port}"),
            None => redis_host,
        };

        Ok(Arc::new(Server {
            config,
            logger,
            lock_manager: LockManager::new(),
            store,
            sessions: SessionRegistry::new(),
            uds: UdsManager::new(),
            next_session_id: AtomicU64::new(1),
            redis_address,
            shutting_down: AtomicBool::new(false),
        }))
    }

    /// Binds the TCP listener and the discovery responder, then blocks
    /// accepting connections until the listener errors out or shutdown
    /// is requested.
    pub fn run(self: &Arc<Self>) -> Result<(), BeaconError> {
        let listener = self.bind()?;

        discovery::spawn_responder(self.config.discovery_port, self.config.port, self.logger.clone())
            .map_err(|e| BeaconError::io(e, "server"))?;

        self.serve(listener)
    }

    /// Binds the TCP listener on `config.port`, without starting the
    /// discovery responder or the accept loop. Split out from `run` so
    /// tests can bind an ephemeral port (`--port=0`) and read back the
    /// address the OS actually assigned before serving.
    pub fn bind(&self) -> Result<TcpListener, BeaconError> {
        let listener =
            TcpListener::bind(("0.0.0.0", self.config.port)).map_err(|e| BeaconError::io(e, "server"))?;
        self.logger.info(&format!("listening on port {}", self.config.port), "server");
        Ok(listener)
    }

    /// Accepts connections on an already-bound `listener` until it errors
    /// out or `shutdown` is called.
    pub fn serve(self: &Arc<Self>, listener: TcpListener) -> Result<(), BeaconError> {
        for stream in listener.incoming() {
            if self.shutting_down.load(Ordering::SeqCst) {
                break;
            }
            match stream {
                Ok(stream) => {
                    let _ = stream.set_nodelay(true);
                    let peer_addr = stream.peer_addr().map(|a| a.to_string()).unwrap_or_default();
                    self.clone().accept_session(Transport::Tcp(stream), peer_addr);
                }
                Err(e) => self.logger.error(&format!("accept failed: {e}"), "server"),
            }
        }
        Ok(())
    }

    /// Stops accepting new connections. Existing sessions drain
    /// naturally as their clients disconnect; locks they held are
    /// released by `teardown_session` as usual.
    pub fn shutdown(self: &Arc<Self>) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    fn accept_session(self: Arc<Self>, transport: Transport, peer_addr: String) {
        let id = self.next_session_id.fetch_add(1, Ordering::SeqCst);
        let (session, mut reader_transport) = match session::spawn(id, peer_addr.clone(), transport, self.logger.clone())
        {
            Ok(pair) => pair,
            Err(e) => {
                self.logger.error(&format!("failed to spawn session for {peer_addr}: {e}"), "server");
                return;
            }
        };

        self.sessions.insert(id, session.sender());
        self.logger.info(&format!("connection accepted from {peer_addr} (session {id})"), "server");

        let server = self.clone();
        std::thread::spawn(move || {
            loop {
                let frame = match Frame::read_from(&mut reader_transport) {
                    Ok(frame) => frame,
                    Err(_) => break,
                };
                let message = match Message::decode(&frame) {
                    Ok(m) => m,
                    Err(e) => {
                        server.logger.warn(&format!("malformed frame from session {id}: {e}"), "server");
                        continue;
                    }
                };

                let close = server.dispatch(id, message);
                if close {
                    break;
                }
            }
            server.teardown_session(id);
        });
    }

    /// Handles one decoded message for `session`. Returns `true` when the
    /// connection should be closed after this message (the UDS-upgrade
    /// handoff).
    fn dispatch(self: &Arc<Self>, session: SessionId, message: Message) -> bool {
        match message {
            Message::Lock { key } => self.handle_lock(session, key),
            Message::Unlock { key } => self.handle_unlock(session, key),
            Message::LockStolenAck { names } => {
                self.lock_manager.ack_stolen(session, &names);
                false
            }

            Message::RedisAddrQuery => {
                self.sessions.send(session, Message::RedisAddrReply { address: self.redis_address.clone() });
                false
            }

            Message::UdsQuery { hostname } => self.handle_uds_query(session, hostname),

            Message::GetFile { msgkey, path } => {
                match self.store.get_file(&path) {
                    Ok(content) => self.sessions.send(session, Message::GetFileOk { msgkey, content }),
                    Err(e) => self.sessions.send(session, Message::GetFileFailed { msgkey, error: e.description }),
                }
                false
            }
            Message::GetDbTree { msgkey, base_path } => {
                for (rel_path, content) in self.store.get_tree(&base_path) {
                    self.sessions.send(session, Message::DbFile { msgkey: msgkey.clone(), rel_path, content });
                }
                self.sessions.send(session, Message::DbEnd { msgkey });
                false
            }
            Message::SetFile { msgkey, path, content } => {
                match self.store.set_file(&path, &content) {
                    Ok(()) => self.sessions.send(session, Message::SetFileOk { msgkey }),
                    Err(e) => self.sessions.send(session, Message::SetFileFailed { msgkey, error: e.description }),
                }
                false
            }
            Message::RemoveFile { msgkey, path } => {
                match self.store.remove_file(&path) {
                    Ok(()) => self.sessions.send(session, Message::RemoveFileOk { msgkey }),
                    Err(e) => self.sessions.send(session, Message::RemoveFileFailed { msgkey, error: e.description }),
                }
                false
            }
            Message::MovePath { msgkey, src, dst } => {
                match self.store.move_path(&src, &dst) {
                    Ok(()) => self.sessions.send(session, Message::MovePathOk { msgkey }),
                    Err(e) => self.sessions.send(session, Message::MovePathFailed { msgkey, error: e.description }),
                }
                false
            }

            other @ (Message::Unknown(_)
            | Message::LockOk { .. }
            | Message::LockRetry { .. }
            | Message::LockStolen { .. }
            | Message::RedisAddrReply { .. }
            | Message::UdsOk { .. }
            | Message::UdsFailed
            | Message::GetFileFailed { .. }
            | Message::GetFileOk { .. }
            | Message::DbFile { .. }
            | Message::DbEnd { .. }
            | Message::SetFileOk { .. }
            | Message::SetFileFailed { .. }
            | Message::RemoveFileOk { .. }
            | Message::RemoveFileFailed { .. }
            | Message::MovePathOk { .. }
            | Message::MovePathFailed { .. }) => {
                // Server-to-client-only message types arriving from a
                // client are malformed requests, not a protocol error:
                // echo the standard Unknown reply with the request's own
                // first field, same as a genuinely unrecognized type code.
                let echoed = other.first_field();
                self.logger.warn(&format!("unexpected message from session {session}: {other:?}"), "server");
                self.sessions.send(session, Message::Unknown(echoed));
                false
            }
        }
    }

    fn handle_lock(self: &Arc<Self>, session: SessionId, key: LockKey) -> bool {
        let sessions = self.sessions.clone();
        let result = self.lock_manager.lock(
            session,
            &key,
            move |target, msg| sessions.send(target, msg),
            STEAL_TIMEOUT,
        );
        if let LockResult::Granted(reply) = result {
            self.sessions.send(session, reply);
        }
        false
    }

    fn handle_unlock(self: &Arc<Self>, session: SessionId, key: LockKey) -> bool {
        for (target, reply) in self.lock_manager.unlock(session, &key) {
            self.sessions.send(target, reply);
        }
        false
    }

    fn handle_uds_query(self: &Arc<Self>, session: SessionId, hostname: String) -> bool {
        if !transport::same_host(&hostname) {
            self.sessions.send(session, Message::UdsFailed);
            return false;
        }

        #[cfg(unix)]
        {
            let path = transport::socket_path(self.config.port);
            let server = self.clone();
            let started = self.uds.ensure_started(path.clone(), self.logger.clone(), move |stream| {
                let peer_addr = format!("uds:{}", server.config.port);
                server.clone().accept_session(Transport::Unix(stream), peer_addr);
            });

            match started {
                Ok(()) => {
                    self.sessions.send(session, Message::UdsOk { path: path.display().to_string() });
                    true
                }
                Err(e) => {
                    self.logger.error(&format!("failed to start uds listener: {e}"), "server");
                    self.sessions.send(session, Message::UdsFailed);
                    false
                }
            }
        }

        #[cfg(not(unix))]
        {
            self.sessions.send(session, Message::UdsFailed);
            false
        }
    }

    fn teardown_session(self: &Arc<Self>, session: SessionId) {
        self.sessions.remove(session);
        for (target, reply) in self.lock_manager.release_session(session) {
            self.sessions.send(target, reply);
        }
        self.logger.info(&format!("session {session} disconnected"), "server");
    }
}
