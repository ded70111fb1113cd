//! Explicit per-key debounce: a map from key to deadline plus the latest
//! buffered payload. Signaling a key restarts its countdown and overwrites
//! the payload; the scheduler drains keys whose deadline has passed. Teardown
//! on rebuild is just [`DebounceMap::clear`].

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

struct Entry<V> {
    deadline: Instant,
    payload: V,
}

pub struct DebounceMap<K, V> {
    entries: HashMap<K, Entry<V>>,
}

impl<K: Eq + Hash + Clone, V> DebounceMap<K, V> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// (Re)start the quiet countdown for `key`, buffering `payload` as the
    /// value to deliver once the countdown elapses undisturbed.
    pub fn signal(&mut self, key: K, payload: V, quiet: Duration) {
        self.entries.insert(
            key,
            Entry {
                deadline: Instant::now() + quiet,
                payload,
            },
        );
    }

    /// Remove and return the buffered payloads of all keys whose quiet
    /// period has elapsed as of `now`.
    pub fn take_due(&mut self, now: Instant) -> Vec<(K, V)> {
        let due: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.deadline <= now)
            .map(|(key, _)| key.clone())
            .collect();

        due.into_iter()
            .filter_map(|key| self.entries.remove_entry(&key))
            .map(|(key, entry)| (key, entry.payload))
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Eq + Hash + Clone, V> Default for DebounceMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
