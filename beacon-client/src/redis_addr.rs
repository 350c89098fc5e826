//! Asks the server for the Redis endpoint backing the channel bus.

use crate::connection::Connection;
use crate::error::ClientError;
use beacon_protocol::Message;
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

pub fn fetch_redis_address(connection: &Arc<Connection>) -> Result<String, ClientError> {
    fetch_redis_address_with_timeout(connection, DEFAULT_TIMEOUT)
}

pub fn fetch_redis_address_with_timeout(
    connection: &Arc<Connection>,
    timeout: Duration,
) -> Result<String, ClientError> {
    let rx = connection.await_redis_address();
    let deadline = Instant::now() + timeout;
    connection.send(Message::RedisAddrQuery)?;

    match Connection::recv_until(&rx, deadline, "redis_addr")? {
        Message::RedisAddrReply { address } => Ok(address),
        other => Err(ClientError::invalid_request(
            format!("unexpected reply to redis address query: {other:?}"),
            "redis_addr",
        )),
    }
}
