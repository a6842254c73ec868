//! The resolver cache: TTL expiry plus LRU eviction bounded by entry count
//! and byte size.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

struct CacheEntry<V> {
    value: V,
    expires: Instant,
    bytes: usize,
    last_used: u64,
}

pub(crate) struct Cache<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    max_entries: usize,
    max_bytes: usize,
    bytes: usize,
    clock: u64,
}

impl<K: Eq + Hash + Clone, V: Clone> Cache<K, V> {
    pub(crate) fn new(max_entries: usize, max_bytes: usize) -> Cache<K, V> {
        Cache {
            entries: HashMap::new(),
            max_entries,
            max_bytes,
            bytes: 0,
            clock: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns the live value for `key`, refreshing its recency. Expired
    /// entries are evicted on the way.
    pub(crate) fn get(&mut self, key: &K, now: Instant) -> Option<V> {
        let expired = match self.entries.get(key) {
            Some(entry) => entry.expires <= now,
            None => return None,
        };
        if expired {
            self.remove(key);
            return None;
        }
        self.clock += 1;
        let entry = self.entries.get_mut(key).unwrap();
        entry.last_used = self.clock;
        Some(entry.value.clone())
    }

    pub(crate) fn put(&mut self, key: K, value: V, ttl: Duration, bytes: usize, now: Instant) {
        self.remove(&key);
        self.clock += 1;
        self.bytes += bytes;
        self.entries.insert(
            key,
            CacheEntry {
                value,
                expires: now + ttl,
                bytes,
                last_used: self.clock,
            },
        );
        self.evict(now);
    }

    fn remove(&mut self, key: &K) {
        if let Some(entry) = self.entries.remove(key) {
            self.bytes -= entry.bytes;
        }
    }

    /// Drops expired entries, then least-recently-used ones while either
    /// bound is exceeded.
    fn evict(&mut self, now: Instant) {
        let expired: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.expires <= now)
            .map(|(key, _)| key.clone())
            .collect();
        for key in expired {
            self.remove(&key);
        }
        while self.entries.len() > self.max_entries || self.bytes > self.max_bytes {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, entry)| entry.last_used)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => self.remove(&key),
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_expiry() {
        let mut cache: Cache<&str, u32> = Cache::new(16, 1024);
        let t0 = Instant::now();
        cache.put("a", 1, Duration::from_secs(10), 8, t0);
        assert_eq!(cache.get(&"a", t0 + Duration::from_secs(5)), Some(1));
        assert_eq!(cache.get(&"a", t0 + Duration::from_secs(11)), None);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn lru_eviction_by_count() {
        let mut cache: Cache<u32, u32> = Cache::new(2, 1024);
        let t0 = Instant::now();
        cache.put(1, 10, Duration::from_secs(60), 8, t0);
        cache.put(2, 20, Duration::from_secs(60), 8, t0);
        // Touch 1 so 2 becomes the eviction victim.
        assert_eq!(cache.get(&1, t0), Some(10));
        cache.put(3, 30, Duration::from_secs(60), 8, t0);
        assert_eq!(cache.get(&2, t0), None);
        assert_eq!(cache.get(&1, t0), Some(10));
        assert_eq!(cache.get(&3, t0), Some(30));
    }

    #[test]
    fn eviction_by_bytes() {
        let mut cache: Cache<u32, u32> = Cache::new(100, 100);
        let t0 = Instant::now();
        cache.put(1, 10, Duration::from_secs(60), 60, t0);
        cache.put(2, 20, Duration::from_secs(60), 60, t0);
        // 120 bytes exceeds the bound; the older entry goes.
        assert_eq!(cache.get(&1, t0), None);
        assert_eq!(cache.get(&2, t0), Some(20));
    }

    #[test]
    fn replacement_updates_bytes() {
        let mut cache: Cache<&str, u32> = Cache::new(4, 100);
        let t0 = Instant::now();
        cache.put("a", 1, Duration::from_secs(60), 90, t0);
        cache.put("a", 2, Duration::from_secs(60), 10, t0);
        cache.put("b", 3, Duration::from_secs(60), 80, t0);
        assert_eq!(cache.get(&"a", t0), Some(2));
        assert_eq!(cache.get(&"b", t0), Some(3));
    }
}
