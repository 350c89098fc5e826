//! Wire protocol codec shared by the server and the client library.
//!
//! A frame is an 8-byte little-endian header `{ i32 type; i32 length }`
//! followed by `length` bytes of payload. The codec in this crate is
//! stateless: it only knows how to turn a [`Message`] into a [`Frame`]
//! and back, it never touches a socket.

pub mod error;
pub mod frame;
pub mod message;

pub use error::ProtocolError;
pub use frame::Frame;
pub use message::{Message, MessageCode};
