//! Memoized audits: an LRU of [`Prepared`] sources keyed by SHA-256.
//!
//! Hosts tend to run the same guest snippets over and over against fresh
//! sandboxes; lexing and parsing them once is enough because the audit only
//! depends on the text.
//!
//! `PYJAIL_PREPARE_CACHE_SIZE` sets the capacity of the process-wide instance
//! (default 256, `0` is treated as `1`).

use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, OnceLock};

use lru::LruCache;
use sha2::{Digest, Sha256};

use crate::audit::{prepare, Prepared};

pub type CacheKey = [u8; 32];

pub fn cache_key(source: &str) -> CacheKey {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.finalize().into()
}

pub struct PreparedCache {
    inner: Mutex<LruCache<CacheKey, Prepared>>,
}

impl PreparedCache {
    /// `capacity` is clamped to at least 1.
    pub fn new(capacity: usize) -> Self {
        let cap = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(cap)),
        }
    }

    pub fn global() -> &'static PreparedCache {
        static INSTANCE: OnceLock<PreparedCache> = OnceLock::new();
        INSTANCE.get_or_init(|| {
            let capacity = std::env::var("PYJAIL_PREPARE_CACHE_SIZE")
                .ok()
                .and_then(|v| v.parse::<usize>().ok())
                .unwrap_or(256);
            PreparedCache::new(capacity)
        })
    }

    // Entries are immutable values; a poisoned lock cannot hold a torn entry.
    fn lock(&self) -> MutexGuard<'_, LruCache<CacheKey, Prepared>> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the cached audit for `source`, auditing it on a miss.
    pub fn prepare(&self, source: &str) -> Prepared {
        let key = cache_key(source);
        if let Some(hit) = self.lock().get(&key) {
            return hit.clone();
        }
        // Audit outside the lock; concurrent misses on the same text just race
        // to insert identical values.
        let prepared = prepare(source);
        self.lock().put(key, prepared.clone());
        prepared
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[cfg(test)]
    fn get(&self, key: &CacheKey) -> Option<Prepared> {
        self.lock().get(key).cloned()
    }

    #[cfg(test)]
    fn capacity(&self) -> usize {
        self.lock().cap().get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_stable_and_distinct() {
        assert_eq!(cache_key("x = 1"), cache_key("x = 1"));
        assert_ne!(cache_key("x = 1"), cache_key("x = 2"));
    }

    #[test]
    fn prepare_populates_and_hits() {
        let cache = PreparedCache::new(8);
        let first = cache.prepare("1 + 1");
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.get(&cache_key("1 + 1")), Some(first.clone()));
        assert_eq!(cache.prepare("1 + 1"), first);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn rejected_sources_are_cached_too() {
        let cache = PreparedCache::new(8);
        let prepared = cache.prepare("f.__globals__");
        assert!(prepared.verdict.is_err());
        assert!(cache
            .get(&cache_key("f.__globals__"))
            .is_some_and(|p| p.verdict.is_err()));
    }

    #[test]
    fn least_recently_used_entry_is_evicted() {
        let cache = PreparedCache::new(2);
        cache.prepare("a");
        cache.prepare("b");
        let _ = cache.get(&cache_key("a"));
        cache.prepare("c");
        assert_eq!(cache.len(), 2);
        assert!(cache.get(&cache_key("b")).is_none());
        assert!(cache.get(&cache_key("a")).is_some());
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let cache = PreparedCache::new(0);
        assert_eq!(cache.capacity(), 1);
        cache.prepare("x");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn fresh_cache_is_empty() {
        let cache = PreparedCache::new(4);
        assert!(cache.is_empty());
        cache.prepare("x");
        assert!(!cache.is_empty());
    }

    #[test]
    fn concurrent_use_does_not_panic() {
        use std::sync::Arc;

        let cache = Arc::new(PreparedCache::new(16));
        let handles: Vec<_> = (0..4)
            .map(|i| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for j in 0..16 {
                        cache.prepare(&format!("v_{i}_{j} = {j}"));
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("thread should not panic");
        }
        assert_eq!(cache.len(), 16);
    }
}
