//! Bounded LRU cache for storage reads.

use std::num::NonZeroUsize;
use std::sync::Mutex;

use lru::LruCache;

/// Cache ceilings. Both bounds hold at the same time.
#[derive(Debug, Clone, Copy)]
pub struct CacheConfig {
    /// Maximum number of cached values
    pub max_entries: usize,
    /// Maximum total cached bytes
    pub max_bytes: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 256,
            max_bytes: 32 * 1024 * 1024, // 32 MiB
        }
    }
}

/// LRU read cache bounded by entry count and total bytes.
///
/// Values larger than the byte ceiling are never cached. Writers must call
/// [`ReadCache::invalidate`] or [`ReadCache::put`] to keep the cache
/// coherent with the backend.
#[derive(Debug)]
pub struct ReadCache {
    inner: Mutex<CacheInner>,
    max_bytes: usize,
}

#[derive(Debug)]
struct CacheInner {
    entries: LruCache<String, Vec<u8>>,
    bytes: usize,
}

impl ReadCache {
    /// Create a cache with the given ceilings.
    #[must_use]
    pub fn new(config: CacheConfig) -> Self {
        let cap = NonZeroUsize::new(config.max_entries.max(1)).expect("max(1) is non-zero");
        Self {
            inner: Mutex::new(CacheInner {
                entries: LruCache::new(cap),
                bytes: 0,
            }),
            max_bytes: config.max_bytes,
        }
    }

    /// Look up `key`, refreshing its recency on hit.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<Vec<u8>> {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        inner.entries.get(key).cloned()
    }

    /// Insert a value, evicting least-recently-used entries until both
    /// ceilings hold again.
    pub fn put(&self, key: &str, value: &[u8]) {
        if value.len() > self.max_bytes {
            return;
        }
        let mut inner = self.inner.lock().expect("cache lock poisoned");

        if let Some(old) = inner.entries.pop(key) {
            inner.bytes -= old.len();
        }
        if let Some((_, evicted)) = inner.entries.push(key.to_string(), value.to_vec()) {
            inner.bytes -= evicted.len();
        }
        inner.bytes += value.len();

        while inner.bytes > self.max_bytes {
            match inner.entries.pop_lru() {
                Some((_, evicted)) => inner.bytes -= evicted.len(),
                None => break,
            }
        }
    }

    /// Drop the entry at `key` if present.
    pub fn invalidate(&self, key: &str) {
        let mut inner = self.inner.lock().expect("cache lock poisoned");
        if let Some(old) = inner.entries.pop(key) {
            inner.bytes -= old.len();
        }
    }

    /// Current total of cached bytes.
    #[must_use]
    pub fn bytes(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").bytes
    }

    /// Current number of cached entries.
    #[must_use]
    pub fn entries(&self) -> usize {
        self.inner.lock().expect("cache lock poisoned").entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_cache() -> ReadCache {
        ReadCache::new(CacheConfig {
            max_entries: 3,
            max_bytes: 100,
        })
    }

    #[test]
    fn test_hit_and_miss() {
        let cache = small_cache();
        assert_eq!(cache.get("a"), None);
        cache.put("a", b"hello");
        assert_eq!(cache.get("a").unwrap(), b"hello");
    }

    #[test]
    fn test_entry_ceiling_evicts_lru() {
        let cache = small_cache();
        cache.put("a", b"1");
        cache.put("b", b"2");
        cache.put("c", b"3");
        // Touch "a" so "b" is the least recently used
        let _ = cache.get("a");
        cache.put("d", b"4");

        assert!(cache.get("b").is_none());
        assert!(cache.get("a").is_some());
        assert_eq!(cache.entries(), 3);
    }

    #[test]
    fn test_byte_ceiling_evicts() {
        let cache = small_cache();
        cache.put("a", &[0u8; 60]);
        cache.put("b", &[0u8; 60]);
        // 120 bytes exceeds the 100-byte ceiling; "a" must go
        assert!(cache.get("a").is_none());
        assert!(cache.get("b").is_some());
        assert!(cache.bytes() <= 100);
    }

    #[test]
    fn test_oversized_value_not_cached() {
        let cache = small_cache();
        cache.put("big", &[0u8; 200]);
        assert!(cache.get("big").is_none());
        assert_eq!(cache.bytes(), 0);
    }

    #[test]
    fn test_replace_updates_byte_accounting() {
        let cache = small_cache();
        cache.put("a", &[0u8; 40]);
        cache.put("a", &[0u8; 10]);
        assert_eq!(cache.bytes(), 10);
        assert_eq!(cache.entries(), 1);
    }

    #[test]
    fn test_invalidate() {
        let cache = small_cache();
        cache.put("a", b"value");
        cache.invalidate("a");
        assert!(cache.get("a").is_none());
        assert_eq!(cache.bytes(), 0);
    }
}
