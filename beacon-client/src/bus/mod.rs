//! Distributed pub/sub channel bus.
//!
//! The server only brokers a Redis address; every byte of channel data
//! flows peer-to-peer over a mesh of plain TCP connections the `Bus`
//! maintains itself. Redis is used purely as a rendezvous directory: two
//! sets holding `"host:port"` strings, one per broadcast endpoint and one
//! per survey endpoint.

use beacon_protocol::Frame;
use logger::logger::Logger;
use redis::Commands;
use std::collections::HashMap;
use std::net::{TcpListener, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::ClientError;

const BROADCAST_SET: &str = "beacon:bus:broadcast";
const SURVEY_SET: &str = "beacon:bus:survey";

const FRAME_PUBLISH: i32 = 1;
const FRAME_SURVEY_REQUEST: i32 = 2;
const FRAME_SURVEY_REPLY: i32 = 3;

pub const DEFAULT_SURVEY_TIMEOUT: Duration = Duration::from_secs(1);
pub const DEFAULT_SURVEY_RETRIES: u32 = 3;
pub const DEFAULT_INITIAL_VALUE_TIMEOUT: Duration = Duration::from_secs(3);

fn split_once_payload(payload: &[u8]) -> Option<(String, Vec<u8>)> {
    let idx = payload.iter().position(|&b| b == b'|')?;
    let name = String::from_utf8(payload[..idx].to_vec()).ok()?;
    Some((name, payload[idx + 1..].to_vec()))
}

struct ChannelState {
    value: Option<Vec<u8>>,
    next_id: u64,
    callbacks: HashMap<u64, Box<dyn Fn(&[u8]) + Send + Sync>>,
}

impl ChannelState {
    fn empty() -> Self {
        ChannelState { value: None, next_id: 1, callbacks: HashMap::new() }
    }
}

/// A single named channel. Every live call to [`Bus::channel`] for the
/// same name returns a clone of the same `Arc<Channel>`; the entry in
/// the bus's channel table is a `Weak` reference, so once the last
/// `Arc<Channel>` anywhere is dropped, `Channel`'s own `Drop` removes it
/// and the channel (and every subscription on it) is gone for good —
/// the next call to [`Bus::channel`] builds it fresh, surveying peers
/// again.
pub struct Channel {
    name: String,
    bus: Arc<BusInner>,
    state: Mutex<ChannelState>,
    self_weak: Weak<Channel>,
}

impl Channel {
    fn new(bus: Arc<BusInner>, name: String, channels: &mut HashMap<String, Weak<Channel>>) -> Arc<Channel> {
        Arc::new_cyclic(|weak| {
            channels.insert(name.clone(), weak.clone());
            Channel { name, bus, state: Mutex::new(ChannelState::empty()), self_weak: weak.clone() }
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn get(&self) -> Option<Vec<u8>> {
        self.state.lock().unwrap().value.clone()
    }

    /// Stores `value` locally and broadcasts it to every connected peer,
    /// unless it's unchanged from the cached value.
    pub fn publish(&self, value: Vec<u8>) {
        let mut state = self.state.lock().unwrap();
        if state.value.as_ref() == Some(&value) {
            return;
        }
        state.value = Some(value.clone());
        drop(state);
        self.bus.broadcast(&self.name, &value);
    }

    /// Registers `callback` to run whenever a new value for this channel
    /// arrives from any peer. The returned [`Subscription`] deregisters
    /// it on drop.
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        let mut state = self.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        state.callbacks.insert(id, Box::new(callback));
        Subscription { channel: self.self_weak.clone(), id }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        let mut channels = self.bus.channels.lock().unwrap();
        if let Some(entry) = channels.get(&self.name) {
            if entry.as_ptr() == self.self_weak.as_ptr() {
                channels.remove(&self.name);
            }
        }
    }
}

/// RAII handle returned by [`Channel::subscribe`]; dropping it removes
/// the callback. A no-op if the channel itself was already destroyed.
pub struct Subscription {
    channel: Weak<Channel>,
    id: u64,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.upgrade() {
            channel.state.lock().unwrap().callbacks.remove(&self.id);
        }
    }
}

struct BusInner {
    redis: redis::Client,
    broadcast_addr: String,
    survey_addr: String,
    channels: Mutex<HashMap<String, Weak<Channel>>>,
    peers: Mutex<HashMap<String, TcpStream>>,
    next_peer_id: AtomicU64,
    logger: Logger,
}

impl BusInner {
    fn deliver(&self, name: &str, value: &[u8]) {
        let channel = {
            let channels = self.channels.lock().unwrap();
            channels.get(name).and_then(Weak::upgrade)
        };
        let Some(channel) = channel else { return };
        let mut guard = channel.state.lock().unwrap();
        guard.value = Some(value.to_vec());
        for callback in guard.callbacks.values() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| callback(value)));
            if result.is_err() {
                self.logger.error(&format!("channel '{name}' subscriber panicked"), "bus");
            }
        }
    }

    fn broadcast(&self, name: &str, value: &[u8]) {
        let mut payload = name.as_bytes().to_vec();
        payload.push(b'|');
        payload.extend_from_slice(value);
        let frame = Frame::new(FRAME_PUBLISH, payload);

        let mut peers = self.peers.lock().unwrap();
        let mut dead = Vec::new();
        for (key, stream) in peers.iter_mut() {
            if frame.write_to(stream).is_err() {
                dead.push(key.clone());
            }
        }
        for key in dead {
            peers.remove(&key);
            self.evict_peer(&key);
        }
    }

    fn evict_peer(&self, key: &str) {
        if let Ok(mut conn) = self.redis.get_connection() {
            let _: redis::RedisResult<i64> = conn.srem(BROADCAST_SET, key);
        }
    }

    fn register_peer(&self, key: String, stream: TcpStream) {
        self.peers.lock().unwrap().insert(key, stream);
    }
}

/// One process's share of the distributed channel mesh.
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    /// Connects to Redis at `redis_url`, binds the broadcast and survey
    /// listeners, registers both endpoints, and dials every peer already
    /// registered.
    pub fn new(redis_url: &str, logger: Logger) -> Result<Arc<Self>, ClientError> {
        let redis_client = redis::Client::open(redis_url).map_err(redis_error)?;

        let broadcast_listener = TcpListener::bind(("0.0.0.0", 0))?;
        let survey_listener = TcpListener::bind(("0.0.0.0", 0))?;
        let host = crate::discovery::local_hostname();
        let broadcast_addr = format!("{host}:{}", broadcast_listener.local_addr()?.port());
        let survey_addr = format!("{host}:{}", survey_listener.local_addr()?.port());

        let inner = Arc::new(BusInner {
            redis: redis_client,
            broadcast_addr: broadcast_addr.clone(),
            survey_addr: survey_addr.clone(),
            channels: Mutex::new(HashMap::new()),
            peers: Mutex::new(HashMap::new()),
            next_peer_id: AtomicU64::new(1),
            logger: logger.clone(),
        });

        let existing_broadcast_peers: Vec<String> = {
            let mut conn = inner.redis.get_connection().map_err(redis_error)?;
            conn.smembers(BROADCAST_SET).map_err(redis_error)?
        };

        {
            let mut conn = inner.redis.get_connection().map_err(redis_error)?;
            let _: redis::RedisResult<i64> = conn.sadd(BROADCAST_SET, &broadcast_addr);
            let _: redis::RedisResult<i64> = conn.sadd(SURVEY_SET, &survey_addr);
        }

        spawn_broadcast_accept_loop(broadcast_listener, inner.clone());
        spawn_survey_accept_loop(survey_listener, inner.clone());

        for peer in existing_broadcast_peers {
            if peer == broadcast_addr {
                continue;
            }
            dial_peer(&peer, &inner);
        }

        Ok(Arc::new(Bus { inner }))
    }

    pub fn broadcast_addr(&self) -> &str {
        &self.inner.broadcast_addr
    }

    pub fn survey_addr(&self) -> &str {
        &self.inner.survey_addr
    }

    /// Returns the channel handle for `name`: a clone of the currently
    /// live `Arc<Channel>` if one exists, otherwise a freshly built one
    /// (surveying peers for its current value) inserted into the bus's
    /// channel table.
    pub fn channel(&self, name: &str) -> Arc<Channel> {
        let mut channels = self.inner.channels.lock().unwrap();
        if let Some(existing) = channels.get(name).and_then(Weak::upgrade) {
            return existing;
        }
        let channel = Channel::new(self.inner_handle(), name.to_string(), &mut channels);
        drop(channels);

        if let Some(value) = self.survey(name, DEFAULT_SURVEY_TIMEOUT, DEFAULT_SURVEY_RETRIES) {
            channel.state.lock().unwrap().value = Some(value);
        }
        channel
    }

    /// Like [`Bus::channel`], but with an initial value to publish if no
    /// peer already has one. Blocks up to `timeout` while the survey
    /// races a would-be publish.
    pub fn channel_with_initial(&self, name: &str, value: Vec<u8>, timeout: Duration) -> Arc<Channel> {
        let mut channels = self.inner.channels.lock().unwrap();
        if let Some(existing) = channels.get(name).and_then(Weak::upgrade) {
            return existing;
        }
        let channel = Channel::new(self.inner_handle(), name.to_string(), &mut channels);
        drop(channels);

        match self.survey(name, timeout, DEFAULT_SURVEY_RETRIES) {
            Some(found) => {
                channel.state.lock().unwrap().value = Some(found);
            }
            None => {
                channel.publish(value);
            }
        }
        channel
    }

    fn inner_handle(&self) -> Arc<BusInner> {
        self.inner.clone()
    }

    /// Asks every known survey peer for `name`'s current value, racing
    /// their replies and keeping the first one to arrive. Retries up to
    /// `retries` times if nobody answers within `timeout`.
    fn survey(&self, name: &str, timeout: Duration, retries: u32) -> Option<Vec<u8>> {
        for _ in 0..retries.max(1) {
            let peers: Vec<String> = {
                let mut conn = self.inner.redis.get_connection().ok()?;
                conn.smembers(SURVEY_SET).ok()?
            };
            let peers: Vec<String> = peers.into_iter().filter(|p| p != &self.inner.survey_addr).collect();
            if peers.is_empty() {
                return None;
            }

            let (tx, rx) = std::sync::mpsc::channel();
            for peer in peers {
                let tx = tx.clone();
                let name = name.to_string();
                thread::spawn(move || {
                    if let Some(value) = query_survey_peer(&peer, &name, timeout) {
                        let _ = tx.send(value);
                    }
                });
            }
            drop(tx);

            let deadline = Instant::now() + timeout;
            if let Ok(value) = rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
                return Some(value);
            }
        }
        None
    }
}

impl Drop for Bus {
    fn drop(&mut self) {
        if let Ok(mut conn) = self.inner.redis.get_connection() {
            let _: redis::RedisResult<i64> = conn.srem(BROADCAST_SET, &self.inner.broadcast_addr);
            let _: redis::RedisResult<i64> = conn.srem(SURVEY_SET, &self.inner.survey_addr);
        }
    }
}

fn dial_peer(peer_addr: &str, inner: &Arc<BusInner>) {
    let Ok(stream) = TcpStream::connect(peer_addr) else {
        inner.logger.warn(&format!("could not dial bus peer {peer_addr}"), "bus");
        return;
    };
    let reader = stream.try_clone().expect("tcp stream clone");
    inner.register_peer(peer_addr.to_string(), stream);
    spawn_peer_reader(reader, inner.clone(), peer_addr.to_string());
}

fn spawn_broadcast_accept_loop(listener: TcpListener, inner: Arc<BusInner>) {
    thread::spawn(move || {
        for incoming in listener.incoming() {
            let Ok(stream) = incoming else { continue };
            let key = format!("in:{}", inner.next_peer_id.fetch_add(1, Ordering::SeqCst));
            let reader = match stream.try_clone() {
                Ok(r) => r,
                Err(_) => continue,
            };
            inner.register_peer(key.clone(), stream);
            spawn_peer_reader(reader, inner.clone(), key);
        }
    });
}

fn spawn_peer_reader(mut stream: TcpStream, inner: Arc<BusInner>, key: String) {
    thread::spawn(move || {
        loop {
            let frame = match Frame::read_from(&mut stream) {
                Ok(f) => f,
                Err(_) => break,
            };
            if frame.type_code == FRAME_PUBLISH {
                if let Some((name, value)) = split_once_payload(&frame.payload) {
                    inner.deliver(&name, &value);
                }
            }
        }
        inner.peers.lock().unwrap().remove(&key);
    });
}

fn spawn_survey_accept_loop(listener: TcpListener, inner: Arc<BusInner>) {
    thread::spawn(move || {
        for incoming in listener.incoming() {
            let Ok(mut stream) = incoming else { continue };
            let inner = inner.clone();
            thread::spawn(move || {
                let frame = match Frame::read_from(&mut stream) {
                    Ok(f) => f,
                    Err(_) => return,
                };
                if frame.type_code != FRAME_SURVEY_REQUEST {
                    return;
                }
                let Ok(name) = String::from_utf8(frame.payload) else { return };
                let channel = {
                    let channels = inner.channels.lock().unwrap();
                    channels.get(&name).and_then(Weak::upgrade)
                };
                let Some(channel) = channel else { return };
                let value = channel.state.lock().unwrap().value.clone();
                if let Some(value) = value {
                    let mut payload = name.into_bytes();
                    payload.push(b'|');
                    payload.extend_from_slice(&value);
                    let _ = Frame::new(FRAME_SURVEY_REPLY, payload).write_to(&mut stream);
                }
            });
        }
    });
}

fn query_survey_peer(peer_addr: &str, name: &str, timeout: Duration) -> Option<Vec<u8>> {
    use std::net::ToSocketAddrs;
    let addr = peer_addr.to_socket_addrs().ok()?.next()?;
    let mut stream = TcpStream::connect_timeout(&addr, timeout).ok()?;
    stream.set_read_timeout(Some(timeout)).ok()?;
    Frame::new(FRAME_SURVEY_REQUEST, name.as_bytes().to_vec()).write_to(&mut stream).ok()?;

    let frame = Frame::read_from(&mut stream).ok()?;
    if frame.type_code != FRAME_SURVEY_REPLY {
        return None;
    }
    let (reply_name, value) = split_once_payload(&frame.payload)?;
    if reply_name != name {
        return None;
    }
    Some(value)
}

fn redis_error(e: redis::RedisError) -> ClientError {
    ClientError::io(std::io::Error::other(e.to_string()), "bus")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_once_payload_separates_name_and_value() {
        let (name, value) = split_once_payload(b"robz|4200").unwrap();
        assert_eq!(name, "robz");
        assert_eq!(value, b"4200");
    }

    #[test]
    fn split_once_payload_rejects_missing_separator() {
        assert!(split_once_payload(b"no-separator").is_none());
    }

    /// A `BusInner` wired up to real local listeners but never touching
    /// Redis, for exercising channel delivery and peer framing without a
    /// broker running.
    fn test_inner() -> Arc<BusInner> {
        let broadcast_listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let survey_listener = TcpListener::bind(("127.0.0.1", 0)).unwrap();
        let broadcast_addr = format!("127.0.0.1:{}", broadcast_listener.local_addr().unwrap().port());
        let survey_addr = format!("127.0.0.1:{}", survey_listener.local_addr().unwrap().port());

        let inner = Arc::new(BusInner {
            redis: redis::Client::open("redis://127.0.0.1:6379").unwrap(),
            broadcast_addr,
            survey_addr,
            channels: Mutex::new(HashMap::new()),
            peers: Mutex::new(HashMap::new()),
            next_peer_id: AtomicU64::new(1),
            logger: Logger::null(),
        });
        spawn_broadcast_accept_loop(broadcast_listener, inner.clone());
        spawn_survey_accept_loop(survey_listener, inner.clone());
        inner
    }

    fn test_channel(inner: &Arc<BusInner>, name: &str) -> Arc<Channel> {
        let mut channels = inner.channels.lock().unwrap();
        Channel::new(inner.clone(), name.to_string(), &mut channels)
    }

    #[test]
    fn publish_suppresses_unchanged_value() {
        let inner = test_inner();
        let channel = test_channel(&inner, "x");

        channel.publish(b"42".to_vec());
        assert_eq!(channel.get(), Some(b"42".to_vec()));

        // Re-publishing the same value must not panic or deadlock even
        // with zero connected peers; the suppression check happens
        // before any broadcast is attempted.
        channel.publish(b"42".to_vec());
        assert_eq!(channel.get(), Some(b"42".to_vec()));
    }

    #[test]
    fn deliver_updates_value_and_invokes_callbacks() {
        let inner = test_inner();
        let channel = test_channel(&inner, "robz");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = seen.clone();
        let _sub = channel.subscribe(move |value| seen_clone.lock().unwrap().push(value.to_vec()));

        inner.deliver("robz", b"100");
        assert_eq!(channel.get(), Some(b"100".to_vec()));
        assert_eq!(seen.lock().unwrap().as_slice(), [b"100".to_vec()]);
    }

    #[test]
    fn deliver_to_unknown_channel_is_ignored() {
        let inner = test_inner();
        // No channel named "ghost" was ever constructed; delivery must
        // not panic or create one.
        inner.deliver("ghost", b"1");
    }

    #[test]
    fn dropping_subscription_deregisters_callback() {
        let inner = test_inner();
        let channel = test_channel(&inner, "robz");

        let calls = Arc::new(Mutex::new(0));
        let calls_clone = calls.clone();
        let sub = channel.subscribe(move |_| *calls_clone.lock().unwrap() += 1);

        inner.deliver("robz", b"1");
        assert_eq!(*calls.lock().unwrap(), 1);

        drop(sub);
        inner.deliver("robz", b"2");
        assert_eq!(*calls.lock().unwrap(), 1, "callback must not fire after its subscription is dropped");
    }

    #[test]
    fn panicking_callback_does_not_block_the_others() {
        let inner = test_inner();
        let channel = test_channel(&inner, "robz");

        let calls = Arc::new(Mutex::new(0));
        let calls_clone = calls.clone();
        let _bad = channel.subscribe(|_| panic!("subscriber blew up"));
        let _good = channel.subscribe(move |_| *calls_clone.lock().unwrap() += 1);

        inner.deliver("robz", b"1");
        assert_eq!(*calls.lock().unwrap(), 1);
    }

    #[test]
    fn peer_broadcast_delivers_across_a_real_socket() {
        let inner_a = test_inner();
        let inner_b = test_inner();

        let channel_b = test_channel(&inner_b, "robz");
        let seen = Arc::new(Mutex::new(None));
        let seen_clone = seen.clone();
        let _sub = channel_b.subscribe(move |value| *seen_clone.lock().unwrap() = Some(value.to_vec()));

        // Dial B's broadcast listener from A, bypassing Redis rendezvous
        // entirely: this exercises the same frame path `dial_peer` uses.
        dial_peer(&inner_b.broadcast_addr, &inner_a);
        thread::sleep(Duration::from_millis(50));

        inner_a.broadcast("robz", b"4200");
        thread::sleep(Duration::from_millis(100));

        assert_eq!(seen.lock().unwrap().as_deref(), Some(b"4200".as_slice()));
    }

    #[test]
    fn survey_reply_round_trips_over_a_real_socket() {
        let inner = test_inner();
        let channel = test_channel(&inner, "robz");
        channel.publish(b"99".to_vec());

        let value = query_survey_peer(&inner.survey_addr, "robz", Duration::from_millis(500));
        assert_eq!(value, Some(b"99".to_vec()));
    }

    #[test]
    fn survey_of_uninitialized_channel_gets_no_reply() {
        let inner = test_inner();
        let _channel = test_channel(&inner, "robz");

        let value = query_survey_peer(&inner.survey_addr, "robz", Duration::from_millis(300));
        assert_eq!(value, None);
    }

    #[test]
    fn repeated_lookups_share_one_channel_identity() {
        let inner = test_inner();
        let first = test_channel(&inner, "robz");
        let second = {
            let channels = inner.channels.lock().unwrap();
            channels.get("robz").and_then(Weak::upgrade).unwrap()
        };
        assert!(Arc::ptr_eq(&first, &second), "both lookups must return the same channel instance");
    }

    #[test]
    fn dropping_the_last_handle_removes_the_channel_from_the_table() {
        let inner = test_inner();
        let channel = test_channel(&inner, "robz");
        assert!(inner.channels.lock().unwrap().contains_key("robz"));

        drop(channel);
        assert!(
            inner.channels.lock().unwrap().get("robz").and_then(Weak::upgrade).is_none(),
            "the table entry must be gone once the last Arc<Channel> is dropped"
        );
    }

    #[test]
    fn dropping_a_channel_also_drops_its_subscriptions() {
        let inner = test_inner();
        let channel = test_channel(&inner, "robz");

        let calls = Arc::new(Mutex::new(0));
        let calls_clone = calls.clone();
        let sub = channel.subscribe(move |_| *calls_clone.lock().unwrap() += 1);

        drop(channel);
        // The channel is gone; dropping its now-dangling subscription
        // must not panic.
        drop(sub);
        assert_eq!(*calls.lock().unwrap(), 0);
    }
}
