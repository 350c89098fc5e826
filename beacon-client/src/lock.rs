//! Client-side handle onto a named, priority-stealable lock.
//!
//! Acquiring returns a [`LockGuard`] that releases on drop, the same
//! affordance `std::sync::Mutex` gives a single process — here the
//! mutual exclusion spans every client talking to the same server.

use crate::connection::Connection;
use crate::error::ClientError;
use common::LockKey;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use beacon_protocol::Message;

pub const DEFAULT_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);

/// A named resource (or set of resources) a client can lock.
pub struct Lock {
    connection: Arc<Connection>,
    priority: i32,
    names: Vec<String>,
}

impl Lock {
    pub fn new(connection: Arc<Connection>, priority: i32, names: Vec<String>) -> Self {
        Lock { connection, priority, names }
    }

    fn key(&self) -> LockKey {
        LockKey::new(self.priority, self.names.clone())
    }

    /// Blocks until the lock is granted or `timeout` elapses, re-issuing
    /// `Lock` every time the server sends `LockRetry` (a waiter that
    /// never re-asks never gets woken: the server only retries the
    /// requests it still has on file).
    pub fn acquire(&self, timeout: Duration) -> Result<LockGuard<'_>, ClientError> {
        if self.names.is_empty() {
            return Ok(LockGuard { lock: self, stolen: Arc::new(AtomicBool::new(false)), released: true });
        }

        let key = self.key();
        let encoded = key.encode();
        let deadline = Instant::now() + timeout;

        loop {
            let rx = self.connection.await_lock_reply(&encoded);
            self.connection.send(Message::Lock { key: key.clone() })?;

            let reply = Connection::recv_until(&rx, deadline, "lock")?;
            match reply {
                Message::LockOk { .. } => {
                    let stolen = Arc::new(AtomicBool::new(false));
                    self.connection.watch_stolen(&key.encode_names(), stolen.clone());
                    return Ok(LockGuard { lock: self, stolen, released: false });
                }
                Message::LockRetry { .. } => {
                    if Instant::now() >= deadline {
                        return Err(ClientError::timeout("lock retried past the acquire deadline", "lock"));
                    }
                    continue;
                }
                other => {
                    return Err(ClientError::invalid_request(
                        format!("unexpected reply while acquiring a lock: {other:?}"),
                        "lock",
                    ));
                }
            }
        }
    }
}

/// RAII handle on a granted lock. Dropping it sends `Unlock`.
pub struct LockGuard<'a> {
    lock: &'a Lock,
    stolen: Arc<AtomicBool>,
    released: bool,
}

impl LockGuard<'_> {
    /// True once the server has handed this lock to a higher-priority
    /// requester. The holder is expected to stop touching the guarded
    /// resource and drop the guard promptly.
    pub fn is_stolen(&self) -> bool {
        self.stolen.load(Ordering::SeqCst)
    }

    pub fn names(&self) -> &[String] {
        &self.lock.names
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        self.lock.connection.unwatch_stolen(&self.lock.key().encode_names());
        let _ = self.lock.connection.send(Message::Unlock { key: self.lock.key() });
    }
}
