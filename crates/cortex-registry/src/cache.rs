//! A small capacity-bounded cache with per-entry TTL and LRU eviction.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

pub struct TtlCache<K, V> {
    capacity: usize,
    ttl: Duration,
    entries: HashMap<K, Entry<V>>,
    clock: u64,
}

struct Entry<V> {
    value: V,
    inserted: Instant,
    last_used: u64,
}

impl<K: Eq + Hash + Clone, V: Clone> TtlCache<K, V> {
    pub fn new(capacity: usize, ttl: Duration) -> Self {
        Self {
            capacity,
            ttl,
            entries: HashMap::new(),
            clock: 0,
        }
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        let ttl = self.ttl;
        let expired = match self.entries.get(key) {
            Some(entry) => entry.inserted.elapsed() > ttl,
            None => return None,
        };
        if expired {
            self.entries.remove(key);
            return None;
        }

        self.clock += 1;
        let clock = self.clock;
        let entry = self.entries.get_mut(key)?;
        entry.last_used = clock;
        Some(entry.value.clone())
    }

    pub fn insert(&mut self, key: K, value: V) {
        self.clock += 1;
        if self.entries.len() >= self.capacity && !self.entries.contains_key(&key) {
            self.evict_one();
        }
        self.entries.insert(
            key,
            Entry {
                value,
                inserted: Instant::now(),
                last_used: self.clock,
            },
        );
    }

    /// Drop entries matching a predicate over keys.
    pub fn retain<F: FnMut(&K) -> bool>(&mut self, mut keep: F) {
        self.entries.retain(|k, _| keep(k));
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

    fn evict_one(&mut self) {
        // Expired entries go first, then the least recently used.
        let ttl = self.ttl;
        if let Some(key) = self
            .entries
            .iter()
            .find(|(_, e)| e.inserted.elapsed() > ttl)
            .map(|(k, _)| k.clone())
        {
            self.entries.remove(&key);
            return;
        }
        if let Some(key) = self
            .entries
            .iter()
            .min_by_key(|(_, e)| e.last_used)
            .map(|(k, _)| k.clone())
        {
            self.entries.remove(&key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_and_insert() {
        let mut cache = TtlCache::new(4, Duration::from_secs(60));
        cache.insert("a", 1);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"b"), None);
    }

    #[test]
    fn test_capacity_evicts_lru() {
        let mut cache = TtlCache::new(2, Duration::from_secs(60));
        cache.insert("a", 1);
        cache.insert("b", 2);
        // Touch "a" so "b" is the eviction candidate.
        cache.get(&"a");
        cache.insert("c", 3);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"c"), Some(3));
    }

    #[test]
    fn test_ttl_expiry() {
        let mut cache = TtlCache::new(4, Duration::from_millis(0));
        cache.insert("a", 1);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.get(&"a"), None);
        assert!(cache.is_empty());
    }

    #[test]
    fn test_retain() {
        let mut cache = TtlCache::new(8, Duration::from_secs(60));
        cache.insert(("u1", "g1"), 1);
        cache.insert(("u2", "g1"), 2);
        cache.retain(|(user, _)| *user != "u1");
        assert_eq!(cache.get(&("u1", "g1")), None);
        assert_eq!(cache.get(&("u2", "g1")), Some(2));
    }
}
