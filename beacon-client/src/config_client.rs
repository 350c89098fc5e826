//! Request/reply helpers over the configuration store's wire messages,
//! each tagged with a fresh `msgkey` so replies can be told apart on a
//! connection that several callers may be using at once.

use crate::connection::Connection;
use crate::error::ClientError;
use beacon_protocol::Message;
use std::sync::Arc;
use std::time::{Duration, Instant};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A file under the config store, alongside the path it was fetched
/// from — returned in bulk by [`ConfigClient::get_db_tree`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreFile {
    pub path: String,
    pub content: Vec<u8>,
}

pub struct ConfigClient {
    connection: Arc<Connection>,
}

impl ConfigClient {
    pub fn new(connection: Arc<Connection>) -> Self {
        ConfigClient { connection }
    }

    pub fn get_file(&self, path: &str) -> Result<Vec<u8>, ClientError> {
        self.get_file_with_timeout(path, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn get_file_with_timeout(&self, path: &str, timeout: Duration) -> Result<Vec<u8>, ClientError> {
        let msgkey = self.connection.next_msgkey();
        let rx = self.connection.await_msgkey(&msgkey);
        let deadline = Instant::now() + timeout;

        self.connection.send(Message::GetFile { msgkey: msgkey.clone(), path: path.to_string() })?;
        let reply = Connection::recv_until(&rx, deadline, "config_client");
        self.connection.forget_msgkey(&msgkey);

        match reply? {
            Message::GetFileOk { content, .. } => Ok(content),
            Message::GetFileFailed { error, .. } => Err(ClientError::not_found(error, "config_client")),
            other => Err(unexpected(other)),
        }
    }

    pub fn set_file(&self, path: &str, content: &[u8]) -> Result<(), ClientError> {
        self.set_file_with_timeout(path, content, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn set_file_with_timeout(&self, path: &str, content: &[u8], timeout: Duration) -> Result<(), ClientError> {
        let msgkey = self.connection.next_msgkey();
        let rx = self.connection.await_msgkey(&msgkey);
        let deadline = Instant::now() + timeout;

        self.connection.send(Message::SetFile {
            msgkey: msgkey.clone(),
            path: path.to_string(),
            content: content.to_vec(),
        })?;
        let reply = Connection::recv_until(&rx, deadline, "config_client");
        self.connection.forget_msgkey(&msgkey);

        match reply? {
            Message::SetFileOk { .. } => Ok(()),
            Message::SetFileFailed { error, .. } => Err(ClientError::invalid_request(error, "config_client")),
            other => Err(unexpected(other)),
        }
    }

    pub fn remove_file(&self, path: &str) -> Result<(), ClientError> {
        self.remove_file_with_timeout(path, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn remove_file_with_timeout(&self, path: &str, timeout: Duration) -> Result<(), ClientError> {
        let msgkey = self.connection.next_msgkey();
        let rx = self.connection.await_msgkey(&msgkey);
        let deadline = Instant::now() + timeout;

        self.connection.send(Message::RemoveFile { msgkey: msgkey.clone(), path: path.to_string() })?;
        let reply = Connection::recv_until(&rx, deadline, "config_client");
        self.connection.forget_msgkey(&msgkey);

        match reply? {
            Message::RemoveFileOk { .. } => Ok(()),
            Message::RemoveFileFailed { error, .. } => Err(ClientError::not_found(error, "config_client")),
            other => Err(unexpected(other)),
        }
    }

    pub fn move_path(&self, src: &str, dst: &str) -> Result<(), ClientError> {
        self.move_path_with_timeout(src, dst, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn move_path_with_timeout(&self, src: &str, dst: &str, timeout: Duration) -> Result<(), ClientError> {
        let msgkey = self.connection.next_msgkey();
        let rx = self.connection.await_msgkey(&msgkey);
        let deadline = Instant::now() + timeout;

        self.connection.send(Message::MovePath {
            msgkey: msgkey.clone(),
            src: src.to_string(),
            dst: dst.to_string(),
        })?;
        let reply = Connection::recv_until(&rx, deadline, "config_client");
        self.connection.forget_msgkey(&msgkey);

        match reply? {
            Message::MovePathOk { .. } => Ok(()),
            Message::MovePathFailed { error, .. } => Err(ClientError::conflict(error, "config_client")),
            other => Err(unexpected(other)),
        }
    }

    /// Fetches every file under `base_path`, draining `DbFile` replies
    /// until the server's terminal `DbEnd`.
    pub fn get_db_tree(&self, base_path: &str) -> Result<Vec<StoreFile>, ClientError> {
        self.get_db_tree_with_timeout(base_path, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn get_db_tree_with_timeout(&self, base_path: &str, timeout: Duration) -> Result<Vec<StoreFile>, ClientError> {
        let msgkey = self.connection.next_msgkey();
        let rx = self.connection.await_msgkey(&msgkey);
        let deadline = Instant::now() + timeout;

        self.connection
            .send(Message::GetDbTree { msgkey: msgkey.clone(), base_path: base_path.to_string() })?;

        let mut files = Vec::new();
        loop {
            match Connection::recv_until(&rx, deadline, "config_client") {
                Ok(Message::DbFile { rel_path, content, .. }) => {
                    files.push(StoreFile { path: rel_path, content });
                }
                Ok(Message::DbEnd { .. }) => break,
                Ok(other) => return Err(unexpected(other)),
                Err(e) => return Err(e),
            }
        }
        Ok(files)
    }
}

fn unexpected(message: Message) -> ClientError {
    ClientError::invalid_request(format!("unexpected reply from config store: {message:?}"), "config_client")
}
