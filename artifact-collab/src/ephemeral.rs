//! Debounced state with TTL.
//!
//! One keyed primitive for every short-lived signal in a room:
//!
//! - typing indicators use the TTL (an entry dies unless refreshed)
//! - cursor/selection fan-out uses the debounce (at most one emission per
//!   key per interval; the latest value is flushed on the trailing edge)
//!
//! Callers pass `now` explicitly so the sweep and the tests drive time.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::Duration;

use tokio::time::Instant;

/// Result of [`Ephemeral::offer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Offer {
    /// No live entry existed for the key before this offer.
    pub fresh: bool,
    /// The caller should emit now; otherwise the value is pending.
    pub emit: bool,
}

struct Slot<V> {
    value: V,
    expires_at: Option<Instant>,
    last_emit: Option<Instant>,
    pending: bool,
}

impl<V> Slot<V> {
    fn expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

pub struct Ephemeral<K, V> {
    entries: HashMap<K, Slot<V>>,
    ttl: Option<Duration>,
    debounce: Duration,
}

impl<K: Eq + Hash + Clone, V: Clone> Ephemeral<K, V> {
    /// Entries expire `ttl` after their last offer; no debounce.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl: Some(ttl),
            debounce: Duration::ZERO,
        }
    }

    /// Entries never expire; emissions per key are spaced by `interval`.
    pub fn debounced(interval: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            ttl: None,
            debounce: interval,
        }
    }

    /// Store `value` for `key`, refreshing its TTL.
    pub fn offer(&mut self, key: K, value: V, now: Instant) -> Offer {
        let expires_at = self.ttl.map(|ttl| now + ttl);
        let debounce = self.debounce;

        let fresh = self.entries.get(&key).map_or(true, |slot| slot.expired(now));
        let slot = self.entries.entry(key).or_insert_with(|| Slot {
            value: value.clone(),
            expires_at,
            last_emit: None,
            pending: false,
        });
        slot.value = value;
        slot.expires_at = expires_at;

        let emit = slot.last_emit.map_or(true, |at| now >= at + debounce);
        if emit {
            slot.last_emit = Some(now);
            slot.pending = false;
        } else {
            slot.pending = true;
        }
        Offer { fresh, emit }
    }

    /// Drop an entry explicitly. Returns its value if one was stored.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.entries.remove(key).map(|slot| slot.value)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).map(|slot| &slot.value)
    }

    pub fn is_live(&self, key: &K, now: Instant) -> bool {
        self.entries.get(key).is_some_and(|slot| !slot.expired(now))
    }

    /// Keys whose entries have not expired.
    pub fn live_keys(&self, now: Instant) -> Vec<K> {
        self.entries
            .iter()
            .filter(|(_, slot)| !slot.expired(now))
            .map(|(key, _)| key.clone())
            .collect()
    }

    /// Pending values whose debounce window has elapsed (trailing edge).
    pub fn take_due(&mut self, now: Instant) -> Vec<(K, V)> {
        let debounce = self.debounce;
        let mut due = Vec::new();
        for (key, slot) in self.entries.iter_mut() {
            let window_open = slot.last_emit.map_or(true, |at| now >= at + debounce);
            if slot.pending && window_open {
                slot.pending = false;
                slot.last_emit = Some(now);
                due.push((key.clone(), slot.value.clone()));
            }
        }
        due
    }

    /// Remove and return every entry past its TTL.
    pub fn expire(&mut self, now: Instant) -> Vec<(K, V)> {
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, slot)| slot.expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|key| self.entries.remove(&key).map(|slot| (key, slot.value)))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MS: Duration = Duration::from_millis(1);

    #[test]
    fn test_ttl_fresh_then_refresh() {
        let now = Instant::now();
        let mut typing: Ephemeral<&str, ()> = Ephemeral::with_ttl(3000 * MS);

        let first = typing.offer("alice", (), now);
        assert!(first.fresh);
        assert!(first.emit);

        let again = typing.offer("alice", (), now + 1000 * MS);
        assert!(!again.fresh);
        assert!(typing.is_live(&"alice", now + 3500 * MS));
    }

    #[test]
    fn test_ttl_expiry() {
        let now = Instant::now();
        let mut typing: Ephemeral<&str, ()> = Ephemeral::with_ttl(3000 * MS);
        typing.offer("alice", (), now);
        typing.offer("bob", (), now + 2000 * MS);

        assert!(typing.expire(now + 2999 * MS).is_empty());
        let expired = typing.expire(now + 3000 * MS);
        assert_eq!(expired, vec![("alice", ())]);
        assert!(!typing.is_live(&"alice", now + 3000 * MS));
        assert!(typing.is_live(&"bob", now + 3000 * MS));

        // Expiry removes the entry, so it can only be reported once.
        assert!(typing.expire(now + 4000 * MS).iter().all(|(k, _)| *k != "alice"));
    }

    #[test]
    fn test_offer_after_expiry_is_fresh() {
        let now = Instant::now();
        let mut typing: Ephemeral<&str, ()> = Ephemeral::with_ttl(100 * MS);
        typing.offer("alice", (), now);
        let offer = typing.offer("alice", (), now + 150 * MS);
        assert!(offer.fresh);
    }

    #[test]
    fn test_remove() {
        let now = Instant::now();
        let mut typing: Ephemeral<&str, ()> = Ephemeral::with_ttl(100 * MS);
        typing.offer("alice", (), now);
        assert_eq!(typing.remove(&"alice"), Some(()));
        assert_eq!(typing.remove(&"alice"), None);
        assert!(typing.is_empty());
    }

    #[test]
    fn test_debounce_leading_edge_then_pending() {
        let now = Instant::now();
        let mut cursors: Ephemeral<u32, i32> = Ephemeral::debounced(100 * MS);

        assert!(cursors.offer(1, 10, now).emit);
        assert!(!cursors.offer(1, 11, now + 20 * MS).emit);
        assert!(!cursors.offer(1, 12, now + 50 * MS).emit);

        // Window still closed.
        assert!(cursors.take_due(now + 90 * MS).is_empty());

        // Only the latest value is flushed.
        assert_eq!(cursors.take_due(now + 100 * MS), vec![(1, 12)]);
        assert!(cursors.take_due(now + 500 * MS).is_empty());
    }

    #[test]
    fn test_debounce_independent_keys() {
        let now = Instant::now();
        let mut cursors: Ephemeral<u32, i32> = Ephemeral::debounced(100 * MS);
        assert!(cursors.offer(1, 10, now).emit);
        assert!(cursors.offer(2, 20, now).emit);
        assert_eq!(cursors.get(&2), Some(&20));
    }

    #[test]
    fn test_debounced_entries_never_expire() {
        let now = Instant::now();
        let mut cursors: Ephemeral<u32, i32> = Ephemeral::debounced(100 * MS);
        cursors.offer(1, 10, now);
        assert!(cursors.expire(now + Duration::from_secs(3600)).is_empty());
        assert_eq!(cursors.live_keys(now + Duration::from_secs(3600)), vec![1]);
    }
}
