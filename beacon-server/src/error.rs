//! Errors raised inside the Beacon process, in the same shape the wire
//! protocol turns into `*Failed` replies.

use std::fmt;
use std::io;

#[derive(Debug)]
pub struct BeaconError {
    pub kind: BeaconErrorKind,
    pub description: String,
    pub module: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BeaconErrorKind {
    NotFound,
    InvalidRequest,
    Timeout,
    Stolen,
    Disconnected,
    Conflict,
    Io,
}

impl BeaconError {
    pub fn not_found(description: impl Into<String>, module: &'static str) -> Self {
        BeaconError { kind: BeaconErrorKind::NotFound, description: description.into(), module: module.to_string() }
    }

    pub fn invalid_request(description: impl Into<String>, module: &'static str) -> Self {
        BeaconError {
            kind: BeaconErrorKind::InvalidRequest,
            description: description.into(),
            module: module.to_string(),
        }
    }

    pub fn timeout(description: impl Into<String>, module: &'static str) -> Self {
        BeaconError { kind: BeaconErrorKind::Timeout, description: description.into(), module: module.to_string() }
    }

    pub fn conflict(description: impl Into<String>, module: &'static str) -> Self {
        BeaconError { kind: BeaconErrorKind::Conflict, description: description.into(), module: module.to_string() }
    }

    pub fn disconnected(description: impl Into<String>, module: &'static str) -> Self {
        BeaconError {
            kind: BeaconErrorKind::Disconnected,
            description: description.into(),
            module: module.to_string(),
        }
    }

    pub fn io(e: io::Error, module: &'static str) -> Self {
        BeaconError { kind: BeaconErrorKind::Io, description: format!("{e}"), module: module.to_string() }
    }
}

impl fmt::Display for BeaconError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {:?}: {}", self.module, self.kind, self.description)
    }
}

impl std::error::Error for BeaconError {}

impl From<io::Error> for BeaconError {
    fn from(e: io::Error) -> Self {
        BeaconError::io(e, "io")
    }
}
