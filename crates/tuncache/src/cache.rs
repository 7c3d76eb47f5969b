//! RegistryCache: thread-safe, weight-bounded LRU cache

use std::hash::Hash;

use parking_lot::Mutex;
use tracing::debug;

use crate::lru::LruCache;
use crate::stats::{CacheStats, Counters};
use crate::weight::Weighted;

/// Weight-bounded LRU cache shared between connection tasks.
///
/// Every operation, lookups included, takes the same exclusive lock for
/// its whole duration, so the recency list and the key index can never be
/// observed out of step. Nothing here performs I/O while holding the lock.
pub struct RegistryCache<K, V> {
    inner: Mutex<LruCache<K, V>>,
    counters: Counters,
}

/// Registry cache keyed by client or tunnel identifier
pub type StringCache<V> = RegistryCache<String, V>;

impl<K, V> RegistryCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Weighted + Clone,
{
    /// Create an empty cache bounded by `capacity` units of weight
    pub fn new(capacity: u64) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
            counters: Counters::new(),
        }
    }

    /// Get a value, marking it most recently used
    pub fn get(&self, key: &K) -> Option<V> {
        let mut lru = self.inner.lock();
        match lru.get(key) {
            Some(value) => {
                self.counters.record_hit();
                Some(value.clone())
            }
            None => {
                self.counters.record_miss();
                None
            }
        }
    }

    /// Insert or replace a value, then evict down to capacity
    pub fn set(&self, key: K, value: V) {
        let evicted = self.inner.lock().put(key, value);
        self.counters.record_insert();
        self.note_evictions(evicted);
    }

    /// Insert a value only when `key` is absent.
    ///
    /// An existing entry keeps its value and weight; it is only marked as
    /// recently used.
    pub fn set_if_absent(&self, key: K, value: V) {
        let evicted = self.inner.lock().put_if_absent(key, value);
        self.note_evictions(evicted);
    }

    /// Remove a key, returning whether it was present
    pub fn delete(&self, key: &K) -> bool {
        self.inner.lock().remove(key).is_some()
    }

    /// Remove every entry
    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    /// Change the capacity, evicting immediately if the cache no longer fits
    pub fn set_capacity(&self, capacity: u64) {
        let evicted = self.inner.lock().set_capacity(capacity);
        self.note_evictions(evicted);
    }

    /// Snapshot sizes and counters
    pub fn stats(&self) -> CacheStats {
        let lru = self.inner.lock();
        CacheStats {
            length: lru.len() as u64,
            size: lru.size(),
            capacity: lru.capacity(),
            oldest_access: lru.oldest_access(),
            hits: self.counters.hits(),
            misses: self.counters.misses(),
            evictions: self.counters.evictions(),
            inserts: self.counters.inserts(),
        }
    }

    /// Stats rendered as JSON
    pub fn stats_json(&self) -> String {
        self.stats().to_json()
    }

    /// All keys, most recently used first
    pub fn keys(&self) -> Vec<K> {
        self.inner.lock().iter().map(|(k, _)| k.clone()).collect()
    }

    /// All entries, most recently used first
    pub fn items(&self) -> Vec<(K, V)> {
        self.inner
            .lock()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    /// Check if the cache is empty
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    fn note_evictions(&self, evicted: usize) {
        if evicted > 0 {
            debug!(evicted, "registry cache evicted entries over capacity");
            self.counters.record_evictions(evicted);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn cache(capacity: u64) -> RegistryCache<String, String> {
        RegistryCache::new(capacity)
    }

    fn total_of(cache: &RegistryCache<String, String>) -> u64 {
        cache.items().iter().map(|(_, v)| v.size()).sum()
    }

    #[test]
    fn test_set_then_get() {
        let cache = cache(100);

        cache.set("a".to_string(), "alpha".to_string());

        assert_eq!(cache.get(&"a".to_string()), Some("alpha".to_string()));
        assert_eq!(cache.get(&"missing".to_string()), None);

        let stats = cache.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
    }

    #[test]
    fn test_capacity_ten_two_sixes() {
        let cache = cache(10);

        cache.set("a".to_string(), "aaaaaa".to_string());
        cache.set("b".to_string(), "bbbbbb".to_string());

        assert_eq!(cache.keys(), vec!["b".to_string()]);
        let stats = cache.stats();
        assert_eq!(stats.length, 1);
        assert_eq!(stats.size, 6);
        assert_eq!(stats.evictions, 1);
        assert_eq!(stats.inserts, 2);
    }

    #[test]
    fn test_least_recent_is_evicted() {
        let cache = cache(3);

        cache.set("a".to_string(), "1".to_string());
        cache.set("b".to_string(), "2".to_string());
        cache.set("c".to_string(), "3".to_string());
        cache.get(&"a".to_string());
        cache.get(&"b".to_string());
        cache.get(&"c".to_string());
        cache.set("d".to_string(), "4".to_string());

        assert_eq!(cache.get(&"a".to_string()), None);
        assert_eq!(cache.keys(), vec!["d", "c", "b"]);
    }

    #[test]
    fn test_weight_tracks_entries() {
        let cache = cache(20);
        let writes = [
            ("a", "aaaa"),
            ("b", "bbbbbbb"),
            ("a", "a"),
            ("c", "cccccccccc"),
            ("d", "dddddd"),
            ("b", "bbbbbbbbbbbbbbbbbbbbbbbbb"),
            ("e", "ee"),
        ];

        for (k, v) in writes {
            cache.set(k.to_string(), v.to_string());
            let stats = cache.stats();
            assert_eq!(stats.size, total_of(&cache));
            assert!(stats.size <= stats.capacity);
        }
    }

    #[test]
    fn test_set_same_value_twice() {
        let cache = cache(50);

        cache.set("a".to_string(), "value".to_string());
        let once = cache.stats().size;
        cache.set("a".to_string(), "value".to_string());

        assert_eq!(cache.stats().size, once);
    }

    #[test]
    fn test_set_if_absent_only_promotes() {
        let cache = cache(50);

        cache.set("a".to_string(), "first".to_string());
        cache.set("b".to_string(), "b".to_string());
        cache.set_if_absent("a".to_string(), "a much longer value".to_string());

        assert_eq!(cache.keys(), vec!["a", "b"]);
        assert_eq!(cache.get(&"a".to_string()), Some("first".to_string()));
        assert_eq!(cache.stats().size, 6);

        cache.set_if_absent("c".to_string(), "cc".to_string());
        assert_eq!(cache.get(&"c".to_string()), Some("cc".to_string()));
    }

    #[test]
    fn test_delete_and_clear() {
        let cache = cache(50);

        cache.set("a".to_string(), "aa".to_string());
        cache.set("b".to_string(), "bbb".to_string());

        assert!(cache.delete(&"a".to_string()));
        assert!(!cache.delete(&"a".to_string()));
        assert_eq!(cache.stats().size, 3);

        cache.clear();
        let stats = cache.stats();
        assert_eq!(stats.length, 0);
        assert_eq!(stats.size, 0);
        assert_eq!(stats.oldest_access, None);
    }

    #[test]
    fn test_set_capacity_evicts() {
        let cache = cache(50);

        cache.set("a".to_string(), "aaaa".to_string());
        cache.set("b".to_string(), "bbbb".to_string());
        cache.set_capacity(5);

        assert_eq!(cache.keys(), vec!["b"]);

        cache.set_capacity(0);
        assert!(cache.is_empty());
        assert_eq!(cache.stats().capacity, 0);
    }

    #[test]
    fn test_snapshots_are_detached() {
        let cache = cache(50);

        cache.set("a".to_string(), "a".to_string());
        cache.set("b".to_string(), "b".to_string());
        let keys = cache.keys();
        let items = cache.items();

        cache.delete(&"a".to_string());
        cache.set("c".to_string(), "c".to_string());

        assert_eq!(keys, vec!["b", "a"]);
        assert_eq!(items.len(), 2);
        assert_eq!(items[1], ("a".to_string(), "a".to_string()));
    }

    #[test]
    fn test_oldest_access_follows_tail() {
        let cache = cache(50);

        cache.set("a".to_string(), "a".to_string());
        thread::sleep(std::time::Duration::from_millis(5));
        cache.set("b".to_string(), "b".to_string());
        let oldest = cache.stats().oldest_access.unwrap();

        thread::sleep(std::time::Duration::from_millis(5));
        cache.get(&"a".to_string());

        let newer = cache.stats().oldest_access.unwrap();
        assert!(newer >= oldest);
        assert!(cache.stats_json().contains("\"length\":2"));
    }

    #[test]
    fn test_concurrent_writers_keep_accounting() {
        let cache = Arc::new(RegistryCache::<String, String>::new(64));

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let cache = Arc::clone(&cache);
                thread::spawn(move || {
                    for i in 0..200 {
                        let key = format!("k{}", (t * 7 + i) % 40);
                        cache.set(key.clone(), "x".repeat(i % 9));
                        cache.get(&key);
                        if i % 13 == 0 {
                            cache.delete(&key);
                        }
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        let stats = cache.stats();
        assert!(stats.size <= 64);
        assert_eq!(stats.size, total_of(&cache));
    }
}
