//! Bounded in-memory caches.
//!
//! [`LruCache`] is a generic capacity-bounded map with optional per-cache
//! TTL and hit/miss/eviction metrics. The engine instantiates it three
//! ways: the embedding cache (keyed on model + text hash, no TTL), the
//! search-result cache (keyed on query + options, 5 minute TTL, cleared on
//! index build), and the category description cache used by the index
//! build's LLM post-pass.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Counters exposed by every cache instance.
#[derive(Debug, Clone, Copy, Default)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
}

impl CacheMetrics {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

struct Slot<V> {
    value: V,
    inserted_at: Instant,
    /// Recency stamp; must match the newest queue entry for this key.
    stamp: u64,
}

/// Capacity-bounded LRU map with optional TTL.
///
/// Recency is tracked with a stamp queue: each get/set pushes `(stamp, key)`
/// and stale queue entries (stamp no longer current) are skipped during
/// eviction, giving amortized O(1) get/set.
pub struct LruCache<K, V> {
    capacity: usize,
    ttl: Option<Duration>,
    map: HashMap<K, Slot<V>>,
    queue: VecDeque<(u64, K)>,
    next_stamp: u64,
    metrics: CacheMetrics,
}

impl<K: Eq + Hash + Clone, V: Clone> LruCache<K, V> {
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            capacity: capacity.max(1),
            ttl,
            map: HashMap::new(),
            queue: VecDeque::new(),
            next_stamp: 0,
            metrics: CacheMetrics::default(),
        }
    }

    pub fn get(&mut self, key: &K) -> Option<V> {
        let expired = match self.map.get(key) {
            Some(slot) => match self.ttl {
                Some(ttl) => slot.inserted_at.elapsed() > ttl,
                None => false,
            },
            None => {
                self.metrics.misses += 1;
                return None;
            }
        };

        if expired {
            self.map.remove(key);
            self.metrics.misses += 1;
            return None;
        }

        let stamp = self.bump_stamp();
        match self.map.get_mut(key) {
            Some(slot) => {
                slot.stamp = stamp;
                let value = slot.value.clone();
                self.queue.push_back((stamp, key.clone()));
                self.metrics.hits += 1;
                Some(value)
            }
            None => {
                self.metrics.misses += 1;
                None
            }
        }
    }

    pub fn put(&mut self, key: K, value: V) {
        let stamp = self.bump_stamp();
        self.queue.push_back((stamp, key.clone()));
        self.map.insert(
            key,
            Slot {
                value,
                inserted_at: Instant::now(),
                stamp,
            },
        );
        self.evict_over_capacity();
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.queue.clear();
    }

    pub fn metrics(&self) -> CacheMetrics {
        self.metrics
    }

    fn bump_stamp(&mut self) -> u64 {
        self.next_stamp += 1;
        self.next_stamp
    }

    fn evict_over_capacity(&mut self) {
        while self.map.len() > self.capacity {
            match self.queue.pop_front() {
                Some((stamp, key)) => {
                    let current = self.map.get(&key).map(|s| s.stamp == stamp).unwrap_or(false);
                    if current {
                        self.map.remove(&key);
                        self.metrics.evictions += 1;
                    }
                }
                None => break,
            }
        }
        // Keep the stamp queue from growing unboundedly on hot keys.
        while self.queue.len() > self.capacity * 4 {
            match self.queue.pop_front() {
                Some((stamp, key)) => {
                    let current = self.map.get(&key).map(|s| s.stamp == stamp).unwrap_or(false);
                    if current {
                        // Oldest live entry reached; restore it and stop.
                        self.queue.push_front((stamp, key));
                        break;
                    }
                }
                None => break,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_and_put_round_trip() {
        let mut cache: LruCache<String, u32> = LruCache::new(4, None);
        cache.put("a".into(), 1);
        assert_eq!(cache.get(&"a".to_string()), Some(1));
        assert_eq!(cache.get(&"b".to_string()), None);
        let m = cache.metrics();
        assert_eq!(m.hits, 1);
        assert_eq!(m.misses, 1);
    }

    #[test]
    fn evicts_least_recently_used() {
        let mut cache: LruCache<u32, u32> = LruCache::new(2, None);
        cache.put(1, 10);
        cache.put(2, 20);
        // Touch 1 so 2 becomes the LRU.
        assert_eq!(cache.get(&1), Some(10));
        cache.put(3, 30);
        assert_eq!(cache.get(&2), None);
        assert_eq!(cache.get(&1), Some(10));
        assert_eq!(cache.get(&3), Some(30));
        assert_eq!(cache.metrics().evictions, 1);
    }

    #[test]
    fn ttl_expires_entries() {
        let mut cache: LruCache<u32, u32> = LruCache::new(4, Some(Duration::from_millis(0)));
        cache.put(1, 10);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.get(&1), None);
    }

    #[test]
    fn no_ttl_never_expires() {
        let mut cache: LruCache<u32, u32> = LruCache::new(4, None);
        cache.put(1, 10);
        std::thread::sleep(Duration::from_millis(2));
        assert_eq!(cache.get(&1), Some(10));
    }

    #[test]
    fn overwrite_keeps_single_entry() {
        let mut cache: LruCache<u32, u32> = LruCache::new(2, None);
        cache.put(1, 10);
        cache.put(1, 11);
        cache.put(2, 20);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get(&1), Some(11));
    }

    #[test]
    fn hit_rate() {
        let mut cache: LruCache<u32, u32> = LruCache::new(4, None);
        cache.put(1, 10);
        cache.get(&1);
        cache.get(&1);
        cache.get(&2);
        assert!((cache.metrics().hit_rate() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn clear_empties_cache() {
        let mut cache: LruCache<u32, u32> = LruCache::new(4, None);
        cache.put(1, 10);
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(cache.get(&1), None);
    }
}
