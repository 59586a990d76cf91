use std::collections::{HashSet, VecDeque};
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Small LRU set for dropping redelivered events by a stable key.
/// Remembers only the last `cap` keys.
#[derive(Debug)]
pub(crate) struct RecentKeys<K> {
    cap: usize,
    order: VecDeque<K>,
    keys: HashSet<K>,
}

impl<K: Eq + Hash + Clone> RecentKeys<K> {
    pub(crate) fn with_capacity(cap: usize) -> Self {
        Self {
            cap: cap.max(1),
            order: VecDeque::new(),
            keys: HashSet::new(),
        }
    }

    /// Records `key`; returns false if it was already remembered.
    pub(crate) fn insert(&mut self, key: K) -> bool {
        if self.keys.contains(&key) {
            // Refresh recency so a hot key is not evicted while still redelivered
            self.order.retain(|k| *k != key);
            self.order.push_back(key);
            return false;
        }
        if self.order.len() >= self.cap {
            if let Some(old) = self.order.pop_front() {
                self.keys.remove(&old);
            }
        }
        self.keys.insert(key.clone());
        self.order.push_back(key);
        true
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.order.len()
    }
}

/// Time-boxed set: everything is forgotten once `ttl` has elapsed since the
/// last clear. Duplicate delivery windows are short, so a coarse wipe keeps
/// memory bounded without per-key timers.
#[derive(Debug)]
pub(crate) struct SeenWindow<K> {
    ttl: Duration,
    cleared_at: Instant,
    keys: HashSet<K>,
}

impl<K: Eq + Hash> SeenWindow<K> {
    pub(crate) fn new(ttl: Duration, now: Instant) -> Self {
        Self {
            ttl,
            cleared_at: now,
            keys: HashSet::new(),
        }
    }

    /// Clears the window if it expired; returns true when it did.
    pub(crate) fn roll(&mut self, now: Instant) -> bool {
        if now.saturating_duration_since(self.cleared_at) >= self.ttl {
            self.keys.clear();
            self.cleared_at = now;
            return true;
        }
        false
    }

    /// Records `key`; returns false if it was already seen in this window.
    pub(crate) fn insert(&mut self, key: K, now: Instant) -> bool {
        self.roll(now);
        self.keys.insert(key)
    }

    pub(crate) fn contains(&self, key: &K) -> bool {
        self.keys.contains(key)
    }

    pub(crate) fn remove(&mut self, key: &K) -> bool {
        self.keys.remove(key)
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.keys.len()
    }
}
