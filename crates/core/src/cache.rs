//! Read-through cache for read-heavy forge lookups (grader membership,
//! group member lists).
//!
//! Values are loaded on first access and kept until they expire or are
//! explicitly invalidated. Callers never pass "use the cache" flags; they
//! either read through the cache or call [`ReadThroughCache::refresh`].

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::time::{Duration, Instant};

use tracing::debug;

#[derive(Debug, Clone)]
struct CacheEntry<V> {
    value: V,
    loaded_at: Instant,
}

/// A keyed read-through cache with an optional time-to-live.
#[derive(Debug)]
pub struct ReadThroughCache<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    ttl: Option<Duration>,
    hits: u64,
    misses: u64,
}

impl<K, V> ReadThroughCache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    /// A cache whose entries never expire on their own.
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
            ttl: None,
            hits: 0,
            misses: 0,
        }
    }

    /// A cache whose entries are reloaded once older than `ttl`.
    pub fn with_ttl(ttl: Duration) -> Self {
        Self {
            ttl: Some(ttl),
            ..Self::new()
        }
    }

    fn is_fresh(&self, entry: &CacheEntry<V>) -> bool {
        match self.ttl {
            Some(ttl) => entry.loaded_at.elapsed() < ttl,
            None => true,
        }
    }

    /// Return the cached value for `key`, loading it with `loader` when
    /// absent or expired. A failed load leaves the cache untouched.
    pub async fn get_or_load<E, F, Fut>(&mut self, key: &K, loader: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(entry) = self.entries.get(key) {
            if self.is_fresh(entry) {
                self.hits += 1;
                return Ok(entry.value.clone());
            }
        }
        self.misses += 1;
        self.refresh(key, loader).await
    }

    /// Unconditionally reload `key` and store the result.
    pub async fn refresh<E, F, Fut>(&mut self, key: &K, loader: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        debug!(key = ?key, "cache load");
        let value = loader().await?;
        self.entries.insert(
            key.clone(),
            CacheEntry {
                value: value.clone(),
                loaded_at: Instant::now(),
            },
        );
        Ok(value)
    }

    /// Drop the cached value for `key`. Returns whether anything was cached.
    pub fn invalidate(&mut self, key: &K) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn invalidate_all(&mut self) {
        self.entries.clear();
    }

    /// Cached value without loading, if present and fresh.
    #[cfg(test)]
    pub fn peek(&self, key: &K) -> Option<&V> {
        self.entries
            .get(key)
            .filter(|e| self.is_fresh(e))
            .map(|e| &e.value)
    }

    /// `(hits, misses)` since creation.
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }
}

impl<K, V> Default for ReadThroughCache<K, V>
where
    K: Eq + Hash + Clone + std::fmt::Debug,
    V: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test]
    async fn test_loads_once_then_hits() {
        let mut cache: ReadThroughCache<String, Vec<String>> = ReadThroughCache::new();
        let loads = Cell::new(0);
        let key = "graders".to_string();

        for _ in 0..3 {
            let v: Result<_, ()> = cache
                .get_or_load(&key, || async {
                    loads.set(loads.get() + 1);
                    Ok(vec!["alice".to_string()])
                })
                .await;
            assert_eq!(v.unwrap(), vec!["alice"]);
        }
        assert_eq!(loads.get(), 1);
        assert_eq!(cache.stats(), (2, 1));
    }

    #[tokio::test]
    async fn test_invalidate_forces_reload() {
        let mut cache: ReadThroughCache<&'static str, u32> = ReadThroughCache::new();
        let _: Result<_, ()> = cache.get_or_load(&"k", || async { Ok(1) }).await;
        assert!(cache.invalidate(&"k"));
        assert!(!cache.invalidate(&"k"));
        let v: Result<_, ()> = cache.get_or_load(&"k", || async { Ok(2) }).await;
        assert_eq!(v.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_refresh_replaces_value() {
        let mut cache: ReadThroughCache<&'static str, u32> = ReadThroughCache::new();
        let _: Result<_, ()> = cache.get_or_load(&"k", || async { Ok(1) }).await;
        let _: Result<_, ()> = cache.refresh(&"k", || async { Ok(5) }).await;
        assert_eq!(cache.peek(&"k"), Some(&5));
    }

    #[tokio::test]
    async fn test_failed_load_not_cached() {
        let mut cache: ReadThroughCache<&'static str, u32> = ReadThroughCache::new();
        let v: Result<u32, &str> = cache.get_or_load(&"k", || async { Err("boom") }).await;
        assert!(v.is_err());
        assert!(cache.peek(&"k").is_none());
    }

    #[tokio::test]
    async fn test_expired_entries_reload() {
        let mut cache: ReadThroughCache<&'static str, u32> =
            ReadThroughCache::with_ttl(Duration::from_millis(0));
        let _: Result<_, ()> = cache.get_or_load(&"k", || async { Ok(1) }).await;
        assert!(cache.peek(&"k").is_none());
        let v: Result<_, ()> = cache.get_or_load(&"k", || async { Ok(2) }).await;
        assert_eq!(v.unwrap(), 2);
    }

    #[test]
    fn test_invalidate_all() {
        let mut cache: ReadThroughCache<u8, u8> = ReadThroughCache::new();
        cache.entries.insert(
            1,
            CacheEntry {
                value: 1,
                loaded_at: Instant::now(),
            },
        );
        cache.invalidate_all();
        assert!(cache.peek(&1).is_none());
    }
}
