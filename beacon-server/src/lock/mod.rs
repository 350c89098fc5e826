//! The distributed named-lock manager.
//!
//! One coarse `Mutex` guards the whole table: the critical sections are
//! short (string comparisons and small map updates), and holding it across
//! a network write is exactly what this module is built to avoid. Callers
//! get back the messages they need to send and do the actual write after
//! releasing any guard.

use beacon_protocol::Message;
use common::LockKey;
use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

pub type SessionId = u64;

struct Holder {
    session: SessionId,
    priority: i32,
    names: Vec<String>,
    refcount: u32,
}

struct Waiter {
    session: SessionId,
    priority: i32,
    key: LockKey,
}

#[derive(Default)]
struct State {
    /// lock-key string -> holder
    holders: HashMap<String, Holder>,
    /// resource name -> lock-key string of the token currently holding it
    name_owner: HashMap<String, String>,
    waiters: Vec<Waiter>,
    /// `(stolen_session, "|"-joined stolen names)` -> true once the ack
    /// arrived. Keyed on names rather than the full lock-key string
    /// because `LockStolenAck` echoes only the names, not the priority.
    pending_acks: HashMap<(SessionId, String), bool>,
}

/// Outcome of a `Lock` request once `LockManager::lock` returns.
pub enum LockResult {
    /// Grant the lock; send this message back to the requester.
    Granted(Message),
    /// The requester was enqueued as a waiter; no reply is sent yet.
    Queued,
}

pub struct LockManager {
    state: Mutex<State>,
    condvar: Condvar,
}

impl Default for LockManager {
    fn default() -> Self {
        Self::new()
    }
}

impl LockManager {
    pub fn new() -> Self {
        LockManager { state: Mutex::new(State::default()), condvar: Condvar::new() }
    }

    fn blocking_holders(state: &State, key: &LockKey) -> Vec<(SessionId, i32, String)> {
        let mut seen = std::collections::HashSet::new();
        let mut out = Vec::new();
        for name in key.names() {
            if let Some(owner_key) = state.name_owner.get(name) {
                if seen.insert(owner_key.clone()) {
                    if let Some(holder) = state.holders.get(owner_key) {
                        out.push((holder.session, holder.priority, owner_key.clone()));
                    }
                }
            }
        }
        out
    }

    fn grant(state: &mut State, session: SessionId, key: &LockKey) {
        let key_str = key.encode();
        for name in key.names() {
            state.name_owner.insert(name.clone(), key_str.clone());
        }
        state.holders.insert(
            key_str,
            Holder { session, priority: key.priority(), names: key.names().to_vec(), refcount: 1 },
        );
    }

    /// Attempts to acquire `key` on behalf of `session`, stealing from
    /// lower-priority holders if necessary. `send` is used to deliver
    /// `LockStolen` to any preempted session; it must not be called while
    /// this function holds its internal lock, which it respects by only
    /// invoking `send` between calls to `state.lock()`.
    pub fn lock(
        &self,
        session: SessionId,
        key: &LockKey,
        send: impl Fn(SessionId, Message),
        steal_timeout: Duration,
    ) -> LockResult {
        if key.is_empty() {
            return LockResult::Granted(Message::LockOk { key: key.encode() });
        }

        let mut state = self.state.lock().unwrap();
        let key_str = key.encode();

        if let Some(holder) = state.holders.get_mut(&key_str) {
            if holder.session == session {
                holder.refcount += 1;
                return LockResult::Granted(Message::LockOk { key: key_str });
            }
        }

        let blockers = Self::blocking_holders(&state, key);
        if blockers.is_empty() {
            Self::grant(&mut state, session, key);
            return LockResult::Granted(Message::LockOk { key: key_str });
        }

        let can_steal = blockers.iter().all(|(_, prio, _)| key.priority() > *prio);
        if !can_steal {
            state.waiters.push(Waiter { session, priority: key.priority(), key: key.clone() });
            return LockResult::Queued;
        }

        // Stealing: notify every blocking holder, then wait (bounded) for
        // all the acks before handing the lock over.
        let mut targets: Vec<(SessionId, String, Vec<String>)> = Vec::new();
        for (holder_session, _, holder_key) in &blockers {
            let stolen_names = state
                .holders
                .get(holder_key)
                .map(|h| h.names.clone())
                .unwrap_or_default();
            let names_key = stolen_names.join("|");
            state.pending_acks.insert((*holder_session, names_key), false);
            targets.push((*holder_session, holder_key.clone(), stolen_names));
        }
        drop(state);

        for (holder_session, _, names) in &targets {
            send(*holder_session, Message::LockStolen { names: names.clone() });
        }

        let deadline = Instant::now() + steal_timeout;
        let mut state = self.state.lock().unwrap();
        loop {
            let all_acked = targets
                .iter()
                .all(|(s, _, names)| state.pending_acks.get(&(*s, names.join("|"))).copied().unwrap_or(true));
            if all_acked {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _timeout_result) = self.condvar.wait_timeout(state, deadline - now).unwrap();
            state = guard;
        }

        for (holder_session, holder_key, names) in &targets {
            state.pending_acks.remove(&(*holder_session, names.join("|")));
            state.holders.remove(holder_key);
            for name in names {
                state.name_owner.remove(name);
            }
        }
        Self::grant(&mut state, session, key);
        LockResult::Granted(Message::LockOk { key: key_str })
    }

    /// Records that `session` acknowledged being stolen from for
    /// `names`, the `|`-joined resource list echoed in `LockStolenAck`.
    pub fn ack_stolen(&self, session: SessionId, names: &[String]) {
        let mut state = self.state.lock().unwrap();
        if let Some(flag) = state.pending_acks.get_mut(&(session, names.join("|"))) {
            *flag = true;
        }
        self.condvar.notify_all();
    }

    /// Releases one reference to `key` held by `session`. Returns the
    /// `LockRetry` messages to send to whichever waiters might now be able
    /// to proceed.
    pub fn unlock(&self, session: SessionId, key: &LockKey) -> Vec<(SessionId, Message)> {
        if key.is_empty() {
            return Vec::new();
        }
        let mut state = self.state.lock().unwrap();
        let key_str = key.encode();

        let released = match state.holders.get_mut(&key_str) {
            Some(holder) if holder.session == session => {
                holder.refcount -= 1;
                if holder.refcount == 0 {
                    let names = holder.names.clone();
                    state.holders.remove(&key_str);
                    for name in &names {
                        state.name_owner.remove(name);
                    }
                    names
                } else {
                    return Vec::new();
                }
            }
            _ => return Vec::new(),
        };

        Self::wake_waiters(&mut state, &released)
    }

    fn wake_waiters(state: &mut State, released_names: &[String]) -> Vec<(SessionId, Message)> {
        let mut replies = Vec::new();
        let mut remaining = Vec::new();
        for waiter in state.waiters.drain(..) {
            if waiter.key.names().iter().any(|n| released_names.contains(n)) {
                replies.push((waiter.session, Message::LockRetry { key: waiter.key.encode() }));
            } else {
                remaining.push(waiter);
            }
        }
        state.waiters = remaining;
        replies
    }

    /// Releases every lock `session` holds and drops every waiter it had
    /// enqueued, as if it had disconnected. Returns the `LockRetry`
    /// messages to send as a result.
    pub fn release_session(&self, session: SessionId) -> Vec<(SessionId, Message)> {
        let mut state = self.state.lock().unwrap();

        let held_keys: Vec<String> = state
            .holders
            .iter()
            .filter(|(_, h)| h.session == session)
            .map(|(k, _)| k.clone())
            .collect();

        let mut released_names = Vec::new();
        for key_str in held_keys {
            if let Some(holder) = state.holders.remove(&key_str) {
                for name in &holder.names {
                    state.name_owner.remove(name);
                }
                released_names.extend(holder.names);
            }
        }

        state.waiters.retain(|w| w.session != session);

        let stale_acks: Vec<(SessionId, String)> =
            state.pending_acks.keys().filter(|(s, _)| *s == session).cloned().collect();
        for key in stale_acks {
            state.pending_acks.insert(key, true);
        }
        self.condvar.notify_all();

        Self::wake_waiters(&mut state, &released_names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(priority: i32, names: &[&str]) -> LockKey {
        LockKey::new(priority, names.iter().map(|s| s.to_string()).collect())
    }

    #[test]
    fn grants_when_free() {
        let mgr = LockManager::new();
        let result = mgr.lock(1, &key(50, &["mot1"]), |_, _| {}, Duration::from_millis(50));
        assert!(matches!(result, LockResult::Granted(_)));
    }

    #[test]
    fn reentrant_lock_requires_matching_unlocks() {
        let mgr = LockManager::new();
        let k = key(50, &["mot1"]);
        assert!(matches!(mgr.lock(1, &k, |_, _| {}, Duration::from_millis(50)), LockResult::Granted(_)));
        assert!(matches!(mgr.lock(1, &k, |_, _| {}, Duration::from_millis(50)), LockResult::Granted(_)));

        assert!(mgr.unlock(1, &k).is_empty());
        // still held once more; a second session should queue, not grant
        let result = mgr.lock(2, &k, |_, _| {}, Duration::from_millis(50));
        assert!(matches!(result, LockResult::Queued));

        let replies = mgr.unlock(1, &k);
        assert_eq!(replies.len(), 1);
    }

    #[test]
    fn lower_priority_request_queues() {
        let mgr = LockManager::new();
        let k = key(50, &["mot1"]);
        mgr.lock(1, &k, |_, _| {}, Duration::from_millis(50));
        let result = mgr.lock(2, &key(10, &["mot1"]), |_, _| {}, Duration::from_millis(50));
        assert!(matches!(result, LockResult::Queued));
    }

    #[test]
    fn higher_priority_steals_after_ack() {
        let mgr = LockManager::new();
        let low = key(10, &["mot1"]);
        mgr.lock(1, &low, |_, _| {}, Duration::from_millis(50));

        let mgr_ref = &mgr;
        let result = mgr.lock(
            2,
            &key(100, &["mot1"]),
            |session, msg| {
                assert_eq!(session, 1);
                if let Message::LockStolen { names } = msg {
                    mgr_ref.ack_stolen(1, &names);
                }
            },
            Duration::from_millis(200),
        );
        assert!(matches!(result, LockResult::Granted(_)));
    }

    #[test]
    fn equal_priority_never_steals() {
        let mgr = LockManager::new();
        let k = key(50, &["mot1"]);
        mgr.lock(1, &k, |_, _| {}, Duration::from_millis(50));
        let result = mgr.lock(2, &key(50, &["mot1"]), |_, _| panic!("should not steal"), Duration::from_millis(50));
        assert!(matches!(result, LockResult::Queued));
    }

    #[test]
    fn session_death_releases_and_wakes_waiters() {
        let mgr = LockManager::new();
        let k = key(50, &["mot1"]);
        mgr.lock(1, &k, |_, _| {}, Duration::from_millis(50));
        assert!(matches!(mgr.lock(2, &k, |_, _| {}, Duration::from_millis(50)), LockResult::Queued));

        let replies = mgr.release_session(1);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].0, 2);
    }

    #[test]
    fn empty_key_is_a_no_op() {
        let mgr = LockManager::new();
        let empty = LockKey::parse("");
        assert!(matches!(mgr.lock(1, &empty, |_, _| {}, Duration::from_millis(50)), LockResult::Granted(_)));
        assert!(mgr.unlock(1, &empty).is_empty());
    }
}
