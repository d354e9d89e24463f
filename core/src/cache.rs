use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::hash::Hash;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Memoization table scoped to a single investigation
///
/// Values are computed at most once per key: the first caller runs the
/// compute function while holding the entry's shard lock, later callers get
/// the same `Arc`. There is no expiry; drop the cache with its investigation.
///
/// # Example
/// ```
/// use faultline_core::cache::MemoCache;
///
/// let cache: MemoCache<String, usize> = MemoCache::new();
/// let first = cache.get_or_compute("trace-1".to_string(), || 42);
/// let second = cache.get_or_compute("trace-1".to_string(), || unreachable!());
/// assert_eq!(*first, *second);
/// assert_eq!(cache.stats().hits, 1);
/// ```
pub struct MemoCache<K, V> {
    entries: DashMap<K, Arc<V>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub entries: usize,
}

impl<K: Eq + Hash, V> MemoCache<K, V> {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    /// Return the cached value for `key`, computing it on first use.
    pub fn get_or_compute<F>(&self, key: K, compute: F) -> Arc<V>
    where
        F: FnOnce() -> V,
    {
        match self.entries.entry(key) {
            Entry::Occupied(entry) => {
                self.hits.fetch_add(1, Ordering::Relaxed);
                Arc::clone(entry.get())
            }
            Entry::Vacant(entry) => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                let value = Arc::new(compute());
                entry.insert(Arc::clone(&value));
                value
            }
        }
    }

    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.entries.get(key).map(|entry| Arc::clone(entry.value()))
    }

    pub fn contains(&self, key: &K) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget every entry; counters are kept.
    pub fn invalidate(&self) {
        self.entries.clear();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.entries.len(),
        }
    }
}

impl<K: Eq + Hash, V> Default for MemoCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_cache_returns_cached_value() {
        let cache = MemoCache::new();
        let call_count = AtomicUsize::new(0);

        let compute = || {
            call_count.fetch_add(1, Ordering::SeqCst);
            vec!["bundle".to_string()]
        };
        let first = cache.get_or_compute("t1", compute);
        let second = cache.get_or_compute("t1", || {
            call_count.fetch_add(1, Ordering::SeqCst);
            vec!["other".to_string()]
        });

        assert_eq!(call_count.load(Ordering::SeqCst), 1);
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(
            cache.stats(),
            CacheStats {
                hits: 1,
                misses: 1,
                entries: 1
            }
        );
    }

    #[test]
    fn test_cache_invalidation() {
        let cache = MemoCache::new();
        cache.get_or_compute(1u32, || "a");
        cache.invalidate();
        assert!(cache.is_empty());
        assert_eq!(*cache.get_or_compute(1u32, || "b"), "b");
        assert_eq!(cache.stats().misses, 2);
    }

    #[tokio::test]
    async fn test_concurrent_access_computes_once() {
        let cache = Arc::new(MemoCache::new());
        let call_count = Arc::new(AtomicUsize::new(0));

        let mut handles = vec![];
        for _ in 0..10 {
            let cache = cache.clone();
            let call_count = call_count.clone();
            handles.push(tokio::spawn(async move {
                *cache.get_or_compute("shared", || {
                    call_count.fetch_add(1, Ordering::SeqCst);
                    7usize
                })
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap(), 7);
        }
        assert_eq!(call_count.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().hits, 9);
    }
}
