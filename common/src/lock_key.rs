//! Normalization of `LOCK`/`UNLOCK` payloads into the canonical key string
//! used to match holders, waiters and stolen-lock notifications.

use std::fmt;

/// Default priority assigned to a lock request that doesn't specify one.
pub const DEFAULT_PRIORITY: i32 = 50;

/// A parsed `priority|name1|name2|...` lock request.
///
/// The encoding, not some derived set, is the matching key: two requests
/// naming the same resources in a different order produce different keys
/// and do not contend with each other. Callers are expected to submit
/// names in a consistent order for a given resource combination.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockKey {
    priority: i32,
    names: Vec<String>,
}

impl LockKey {
    pub fn new(priority: i32, names: Vec<String>) -> Self {
        LockKey { priority, names }
    }

    /// Parses a `LOCK`/`UNLOCK` payload. A zero-length payload parses to
    /// an empty key (no names) rather than an error; callers treat an
    /// empty key as a no-op, per the wire contract's boundary behavior.
    pub fn parse(payload: &str) -> Self {
        if payload.is_empty() {
            return LockKey {
                priority: DEFAULT_PRIORITY,
                names: Vec::new(),
            };
        }

        let mut parts = payload.split('|');
        let priority = parts
            .next()
            .and_then(|p| p.parse::<i32>().ok())
            .unwrap_or(DEFAULT_PRIORITY);
        let names = parts.map(str::to_string).collect();

        LockKey { priority, names }
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Canonical wire encoding, also used as the hash map key under which
    /// waiters and holders are tracked.
    pub fn encode(&self) -> String {
        self.to_string()
    }

    /// Encodes just the resource names, `|`-joined, as used in the
    /// `LOCK_STOLEN`/`LOCK_STOLEN_ACK` payload.
    pub fn encode_names(&self) -> String {
        self.names.join("|")
    }
}

impl fmt::Display for LockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.priority)?;
        for name in &self.names {
            write!(f, "|{name}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_priority_and_names() {
        let key = LockKey::parse("100|mot1|mot2");
        assert_eq!(key.priority(), 100);
        assert_eq!(key.names(), &["mot1".to_string(), "mot2".to_string()]);
    }

    #[test]
    fn empty_payload_is_empty_key() {
        let key = LockKey::parse("");
        assert!(key.is_empty());
        assert_eq!(key.priority(), DEFAULT_PRIORITY);
    }

    #[test]
    fn encode_round_trips_through_parse() {
        let key = LockKey::new(75, vec!["shutter".to_string(), "beamstop".to_string()]);
        let encoded = key.encode();
        assert_eq!(encoded, "75|shutter|beamstop");
        let reparsed = LockKey::parse(&encoded);
        assert_eq!(reparsed, key);
    }

    #[test]
    fn encode_names_omits_priority() {
        let key = LockKey::new(50, vec!["mot1".to_string()]);
        assert_eq!(key.encode_names(), "mot1");
    }
}
