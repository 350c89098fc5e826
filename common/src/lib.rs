//! Small set of types shared between the protocol codec, the server and
//! the client library. Kept dependency-free on purpose: anything that
//! needs an external crate belongs in the component that actually uses it.

pub mod lock_key;

pub use lock_key::LockKey;
