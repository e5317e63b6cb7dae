//! Bounded LRU cache with TTL expiry and single-flight computation.
//!
//! [`Cache::get_or_compute`] guarantees at most one in-flight computation
//! per key: the first caller registers a [`Shared`] future in the pending
//! map and every concurrent caller for the same key awaits that same
//! future. A failed computation is handed to every waiter as the same
//! [`CacheComputeError`] and nothing is stored.
//!
//! Two caches sit in front of the retriever: one for query embeddings keyed
//! by [`embedding_key`], one for whole retrieval results keyed by
//! [`query_key`]. The latter includes the generations of both stores, so
//! any write to either makes older results unreachable.

use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::error::CacheComputeError;
use crate::metadata_store::MetadataFilter;

type Computation<V> = Shared<BoxFuture<'static, Result<V, CacheComputeError>>>;

struct Pending<V> {
    id: u64,
    future: Computation<V>,
}

struct Stored<V> {
    value: V,
    inserted_at: Instant,
}

struct State<K: Hash + Eq, V> {
    entries: LruCache<K, Stored<V>>,
    pending: HashMap<K, Pending<V>>,
    next_id: u64,
}

/// Counters since the cache was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Compute functions actually started.
    pub computations: u64,
    pub entries: usize,
}

pub struct Cache<K: Hash + Eq, V> {
    state: Mutex<State<K, V>>,
    ttl: Option<Duration>,
    hits: AtomicU64,
    misses: AtomicU64,
    computations: AtomicU64,
}

impl<K, V> Cache<K, V>
where
    K: Hash + Eq + Clone,
    V: Clone + Send + Sync + 'static,
{
    /// `ttl` of `None` keeps entries until evicted by capacity.
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        Self {
            state: Mutex::new(State {
                entries: LruCache::new(capacity),
                pending: HashMap::new(),
                next_id: 0,
            }),
            ttl,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            computations: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<K, V>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_fresh(&self, stored: &Stored<V>) -> bool {
        match self.ttl {
            Some(ttl) => stored.inserted_at.elapsed() < ttl,
            None => true,
        }
    }

    /// Look up a fresh entry, dropping it if it has expired.
    fn lookup(&self, state: &mut State<K, V>, key: &K) -> Option<V> {
        let expired = match state.entries.get(key) {
            Some(stored) if self.is_fresh(stored) => return Some(stored.value.clone()),
            Some(_) => true,
            None => false,
        };
        if expired {
            state.entries.pop(key);
        }
        None
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut state = self.lock();
        let found = self.lookup(&mut state, key);
        drop(state);
        match &found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    pub fn insert(&self, key: K, value: V) {
        self.lock().entries.put(
            key,
            Stored {
                value,
                inserted_at: Instant::now(),
            },
        );
    }

    /// Drop the entry for `key`. A computation already running for it will
    /// still answer its waiters but will not be stored.
    pub fn invalidate(&self, key: &K) {
        let mut state = self.lock();
        state.entries.pop(key);
        state.pending.remove(key);
    }

    pub fn clear(&self) {
        let mut state = self.lock();
        state.entries.clear();
        state.pending.clear();
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            computations: self.computations.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }

    /// Return the cached value for `key`, or run `compute` exactly once
    /// across all concurrent callers and cache its success.
    pub async fn get_or_compute<F, Fut>(&self, key: K, compute: F) -> Result<V, CacheComputeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let (id, future) = {
            let mut state = self.lock();
            if let Some(value) = self.lookup(&mut state, &key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(value);
            }
            self.misses.fetch_add(1, Ordering::Relaxed);

            match state.pending.get(&key) {
                Some(pending) => (pending.id, pending.future.clone()),
                None => {
                    let id = state.next_id;
                    state.next_id += 1;
                    let future = compute()
                        .map(|result| result.map_err(|e| CacheComputeError(Arc::new(e))))
                        .boxed()
                        .shared();
                    state.pending.insert(
                        key.clone(),
                        Pending {
                            id,
                            future: future.clone(),
                        },
                    );
                    self.computations.fetch_add(1, Ordering::Relaxed);
                    (id, future)
                }
            }
        };

        let result = future.await;

        // Whichever waiter finishes first retires the pending entry. If the
        // key was invalidated meanwhile the entry is gone and nothing is stored.
        let mut state = self.lock();
        let ours = state.pending.get(&key).is_some_and(|p| p.id == id);
        if ours {
            state.pending.remove(&key);
            if let Ok(value) = &result {
                state.entries.put(
                    key,
                    Stored {
                        value: value.clone(),
                        inserted_at: Instant::now(),
                    },
                );
            }
        }
        result
    }
}

fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Cache key for one text embedded by one model.
pub fn embedding_key(model: &str, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(model.as_bytes());
    hasher.update([0u8]);
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Cache key for one retrieval against one state of the vector and
/// metadata stores.
pub fn query_key(
    query: &str,
    top_k: usize,
    filters: &MetadataFilter,
    vector_generation: u64,
    metadata_generation: u64,
) -> String {
    let canonical = serde_json::json!({
        "query": query,
        "top_k": top_k,
        "filters": filters,
        "vector_generation": vector_generation,
        "metadata_generation": metadata_generation,
    });
    sha256_hex(canonical.to_string().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn test_concurrent_callers_share_one_computation() {
        let cache: Arc<Cache<String, u64>> = Arc::new(Cache::new(16, None));
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = Arc::clone(&cache);
            let runs = Arc::clone(&runs);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("k".to_string(), move || async move {
                        runs.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(42)
                    })
                    .await
            }));
        }

        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), 42);
        }
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats().computations, 1);
        assert_eq!(cache.get(&"k".to_string()), Some(42));
    }

    #[tokio::test]
    async fn test_error_reaches_every_waiter_and_is_not_cached() {
        let cache: Arc<Cache<String, u64>> = Arc::new(Cache::new(16, None));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cache = Arc::clone(&cache);
            handles.push(tokio::spawn(async move {
                cache
                    .get_or_compute("k".to_string(), || async {
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        Err(anyhow::anyhow!("service down"))
                    })
                    .await
            }));
        }

        let mut errors = Vec::new();
        for handle in handles {
            errors.push(handle.await.unwrap().unwrap_err());
        }
        assert!(errors.iter().all(|e| e.to_string().contains("service down")));
        assert!(errors.windows(2).all(|w| Arc::ptr_eq(&w[0].0, &w[1].0)));
        assert_eq!(cache.stats().computations, 1);
        assert!(cache.is_empty());

        // next call computes again
        let value = cache
            .get_or_compute("k".to_string(), || async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
        assert_eq!(cache.stats().computations, 2);
    }

    #[test]
    fn test_lru_eviction() {
        let cache: Cache<&str, u32> = Cache::new(2, None);
        cache.insert("a", 1);
        cache.insert("b", 2);
        assert_eq!(cache.get(&"a"), Some(1));
        cache.insert("c", 3);
        assert_eq!(cache.get(&"b"), None);
        assert_eq!(cache.get(&"a"), Some(1));
        assert_eq!(cache.get(&"c"), Some(3));
    }

    #[test]
    fn test_ttl_expiry() {
        let cache: Cache<&str, u32> = Cache::new(4, Some(Duration::from_millis(20)));
        cache.insert("a", 1);
        assert_eq!(cache.get(&"a"), Some(1));
        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(cache.get(&"a"), None);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_invalidate_during_compute_skips_store() {
        let cache: Arc<Cache<String, u64>> = Arc::new(Cache::new(4, None));
        let task = {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move {
                cache
                    .get_or_compute("k".to_string(), || async {
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(1)
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.invalidate(&"k".to_string());

        assert_eq!(task.await.unwrap().unwrap(), 1);
        assert_eq!(cache.get(&"k".to_string()), None);
    }

    #[test]
    fn test_stats_counts_hits_and_misses() {
        let cache: Cache<&str, u32> = Cache::new(4, None);
        assert_eq!(cache.get(&"a"), None);
        cache.insert("a", 1);
        cache.get(&"a");
        let stats = cache.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
    }

    #[test]
    fn test_keys() {
        assert_eq!(embedding_key("m", "text"), embedding_key("m", "text"));
        assert_ne!(embedding_key("m1", "text"), embedding_key("m2", "text"));
        assert_ne!(embedding_key("ab", "c"), embedding_key("a", "bc"));

        let filter = MetadataFilter::default();
        let k = query_key("q", 5, &filter, 1, 1);
        assert_eq!(k, query_key("q", 5, &filter, 1, 1));
        assert_ne!(k, query_key("q", 5, &filter, 2, 1));
        assert_ne!(k, query_key("q", 5, &filter, 1, 2));
        assert_ne!(k, query_key("q", 6, &filter, 1, 1));
        let lang = MetadataFilter {
            language: Some("rust".into()),
            ..Default::default()
        };
        assert_ne!(k, query_key("q", 5, &lang, 1, 1));
        assert_eq!(k.len(), 64);
    }
}
