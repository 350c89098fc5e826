//! Client library for talking to a Beacon server: connection management
//! (with the Unix-socket upgrade), the priority lock manager, the
//! configuration store, and the peer-to-peer channel bus.

pub mod bus;
pub mod config_client;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod lock;
pub mod redis_addr;

pub use bus::Bus;
pub use config_client::ConfigClient;
pub use connection::Connection;
pub use error::{ClientError, ClientErrorKind};
pub use lock::Lock;

use logger::logger::Logger;
use std::sync::Arc;

/// Discovers a Beacon server by UDP broadcast and establishes a
/// connection to it (transparently upgrading to a Unix socket when the
/// server is local).
pub fn discover_and_connect(discovery_port: u16, logger: Logger) -> Result<Arc<Connection>, ClientError> {
    let found = discovery::discover(discovery_port, None)?;
    Connection::establish(&found.host, found.port, logger)
}
