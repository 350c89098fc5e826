use std::fmt;

/// Errors raised while decoding a frame or a message payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Not enough bytes have been buffered yet to decode a complete
    /// frame. Not a failure: the caller should read more and retry.
    Incomplete,
    /// The bytes read were structurally invalid (e.g. a payload missing
    /// a required `|`-separated field).
    Invalid(String),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtocolError::Incomplete => write!(f, "incomplete frame"),
            ProtocolError::Invalid(msg) => write!(f, "invalid frame: {msg}"),
        }
    }
}

impl std::error::Error for ProtocolError {}
