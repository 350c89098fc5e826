//! Client-side error type, mirroring the server's `BeaconError` shape.

use std::fmt;
use std::io;

#[derive(Debug)]
pub struct ClientError {
    pub kind: ClientErrorKind,
    pub description: String,
    pub module: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientErrorKind {
    NotFound,
    InvalidRequest,
    Timeout,
    Stolen,
    Disconnected,
    Conflict,
    Io,
}

impl ClientError {
    pub fn not_found(description: impl Into<String>, module: &'static str) -> Self {
        ClientError { kind: ClientErrorKind::NotFound, description: description.into(), module: module.to_string() }
    }

    pub fn timeout(description: impl Into<String>, module: &'static str) -> Self {
        ClientError { kind: ClientErrorKind::Timeout, description: description.into(), module: module.to_string() }
    }

    pub fn stolen(description: impl Into<String>, module: &'static str) -> Self {
        ClientError { kind: ClientErrorKind::Stolen, description: description.into(), module: module.to_string() }
    }

    pub fn disconnected(description: impl Into<String>, module: &'static str) -> Self {
        ClientError {
            kind: ClientErrorKind::Disconnected,
            description: description.into(),
            module: module.to_string(),
        }
    }

    pub fn invalid_request(description: impl Into<String>, module: &'static str) -> Self {
        ClientError {
            kind: ClientErrorKind::InvalidRequest,
            description: description.into(),
            module: module.to_string(),
        }
    }

    pub fn conflict(description: impl Into<String>, module: &'static str) -> Self {
        ClientError { kind: ClientErrorKind::Conflict, description: description.into(), module: module.to_string() }
    }

    pub fn io(e: io::Error, module: &'static str) -> Self {
        ClientError { kind: ClientErrorKind::Io, description: format!("{e}"), module: module.to_string() }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {:?}: {}", self.module, self.kind, self.description)
    }
}

impl std::error::Error for ClientError {}

impl From<io::Error> for ClientError {
    fn from(e: io::Error) -> Self {
        ClientError::io(e, "io")
    }
}
