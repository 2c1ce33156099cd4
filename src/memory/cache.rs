//! Byte-budgeted LRU cache.

use indexmap::IndexMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

/// Cache hit/miss/eviction counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups that found their key.
    pub hits: u64,
    /// Lookups that missed.
    pub misses: u64,
    /// Entries removed to make room.
    pub evictions: u64,
}

impl CacheStats {
    /// Hit rate in `[0, 1]`; zero when nothing was looked up yet.
    #[must_use]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            {
                self.hits as f64 / total as f64
            }
        }
    }
}

struct Slot<V> {
    value: V,
    size: usize,
}

struct Inner<K, V> {
    /// Insertion order doubles as recency order: front = LRU, back = MRU.
    map: IndexMap<K, Slot<V>>,
    used_bytes: usize,
}

/// Thread-safe LRU cache with per-item byte accounting.
///
/// One mutex covers both the map and the recency order, so every operation
/// observes a consistent pair. Capacity is a byte budget, not an entry
/// count: `put` evicts from the LRU end until the new item fits and rejects
/// items larger than the whole budget outright.
pub struct LruCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    capacity_bytes: usize,
    inner: Mutex<Inner<K, V>>,
    hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
}

impl<K, V> LruCache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone,
{
    /// Creates a cache with the given byte budget.
    #[must_use]
    pub fn new(capacity_bytes: usize) -> Self {
        Self {
            capacity_bytes,
            inner: Mutex::new(Inner {
                map: IndexMap::new(),
                used_bytes: 0,
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<K, V>> {
        self.inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// The byte budget.
    #[must_use]
    pub fn capacity_bytes(&self) -> usize {
        self.capacity_bytes
    }

    /// Bytes currently held.
    #[must_use]
    pub fn size_bytes(&self) -> usize {
        self.lock().used_bytes
    }

    /// Number of cached entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().map.len()
    }

    /// True when the cache holds nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().map.is_empty()
    }

    /// Inserts `value` under `key`, charging `size` bytes.
    ///
    /// Returns false (and caches nothing) if `size` exceeds the whole
    /// budget. Otherwise evicts LRU entries until the item fits.
    pub fn put(&self, key: K, value: V, size: usize) -> bool {
        if size > self.capacity_bytes {
            return false;
        }
        let mut inner = self.lock();

        if let Some(old) = inner.map.shift_remove(&key) {
            inner.used_bytes -= old.size;
        }

        while inner.used_bytes + size > self.capacity_bytes {
            if let Some((_, slot)) = inner.map.shift_remove_index(0) {
                inner.used_bytes -= slot.size;
                self.evictions.fetch_add(1, Ordering::Relaxed);
            } else {
                break;
            }
        }

        inner.used_bytes += size;
        inner.map.insert(key, Slot { value, size });
        true
    }

    /// Looks up `key`, promoting it to most-recently-used.
    #[must_use]
    pub fn get(&self, key: &K) -> Option<V> {
        let mut inner = self.lock();
        // Remove and re-insert at the back to bump recency.
        if let Some(slot) = inner.map.shift_remove(key) {
            let value = slot.value.clone();
            inner.map.insert(key.clone(), slot);
            self.hits.fetch_add(1, Ordering::Relaxed);
            Some(value)
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            None
        }
    }

    /// Looks up without touching recency.
    #[must_use]
    pub fn peek(&self, key: &K) -> Option<V> {
        self.lock().map.get(key).map(|slot| slot.value.clone())
    }

    /// Removes one entry, returning the bytes it held.
    pub fn remove(&self, key: &K) -> usize {
        let mut inner = self.lock();
        if let Some(slot) = inner.map.shift_remove(key) {
            inner.used_bytes -= slot.size;
            slot.size
        } else {
            0
        }
    }

    /// Frees at least `bytes` from the LRU end, or empties the cache.
    /// Returns the bytes actually freed.
    pub fn evict(&self, bytes: usize) -> usize {
        let mut inner = self.lock();
        let mut freed = 0usize;
        while freed < bytes {
            let Some((_, slot)) = inner.map.shift_remove_index(0) else {
                break;
            };
            inner.used_bytes -= slot.size;
            freed += slot.size;
            self.evictions.fetch_add(1, Ordering::Relaxed);
        }
        freed
    }

    /// Drops everything, returning the bytes freed.
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let freed = inner.used_bytes;
        inner.map.clear();
        inner.used_bytes = 0;
        freed
    }

    /// Counter snapshot.
    #[must_use]
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
        }
    }
}
