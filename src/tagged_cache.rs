//! Generic in-memory cache with tag invalidation and request coalescing
//!
//! This module provides the storage engine behind the collection caches:
//! - Key to entry store backed by Moka, with per-entry expiry
//! - Tag to keys index for bulk eviction without scanning the store
//! - Single-flight computation: concurrent misses on one key share a result
//!
//! Every tag carries a generation counter. Invalidating a tag bumps it, and an
//! entry is only served while the generation it was computed under is still
//! current, so no value computed before an invalidation can be served after
//! it. Entries that Moka evicts on its own (expiry or capacity) leave the tag
//! index through an eviction listener.

use moka::Expiry;
use moka::future::Cache;
use moka::notification::RemovalCause;
use std::{
    collections::HashMap,
    fmt::Display,
    future::Future,
    hash::Hash,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use tokio::sync::{RwLock, watch};
use tracing::{debug, error, warn};

use crate::{BoxError, CacheConfig, CacheError};

/// Trait for types that can be cached
pub trait Cacheable: Send + Sync + 'static {}
impl<T> Cacheable for T where T: Send + Sync + 'static {}

/// Trait for cache key types. Every key belongs to exactly one tag.
pub trait CacheKey: Display + Hash + Eq + Clone + Send + Sync + 'static {
    type Tag: Display + Hash + Eq + Clone + Send + Sync + 'static;

    fn tag(&self) -> Self::Tag;
}

/// A stored value. Owned by the store and never handed out directly.
struct CacheEntry<K, V> {
    payload: Arc<V>,
    slot: Arc<TagSlot<K>>,
    /// Tag generation the payload was computed under
    generation: u64,
    /// Identifies this entry in the tag index
    stamp: u64,
    created_at: Instant,
    ttl: Duration,
}

impl<K, V> Clone for CacheEntry<K, V> {
    fn clone(&self) -> Self {
        Self {
            payload: Arc::clone(&self.payload),
            slot: Arc::clone(&self.slot),
            generation: self.generation,
            stamp: self.stamp,
            created_at: self.created_at,
            ttl: self.ttl,
        }
    }
}

impl<K, V> CacheEntry<K, V> {
    fn is_current(&self) -> bool {
        self.generation == self.slot.generation()
    }

    fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) < self.ttl
    }
}

/// Expires each entry after its own TTL, restarting on overwrite
struct EntryExpiry;

impl<K, V> Expiry<K, CacheEntry<K, V>> for EntryExpiry {
    fn expire_after_create(
        &self,
        _key: &K,
        entry: &CacheEntry<K, V>,
        _created_at: Instant,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }

    fn expire_after_update(
        &self,
        _key: &K,
        entry: &CacheEntry<K, V>,
        _updated_at: Instant,
        _duration_until_expiry: Option<Duration>,
    ) -> Option<Duration> {
        Some(entry.ttl)
    }
}

/// Keys currently stored under one tag, plus its invalidation generation
struct TagSlot<K> {
    generation: AtomicU64,
    next_stamp: AtomicU64,
    /// Stored keys, each mapped to the stamp of the entry holding it
    keys: Mutex<HashMap<K, u64>>,
}

impl<K> Default for TagSlot<K> {
    fn default() -> Self {
        Self {
            generation: AtomicU64::new(0),
            next_stamp: AtomicU64::new(0),
            keys: Mutex::new(HashMap::new()),
        }
    }
}

impl<K> TagSlot<K> {
    fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    /// Start a new generation, returning the keys stored under the old one
    fn advance(&self) -> Vec<K> {
        self.generation.fetch_add(1, Ordering::AcqRel);
        self.keys().drain().map(|(key, _)| key).collect()
    }

    // Never held across an await, and the eviction listener runs inline
    fn keys(&self) -> MutexGuard<'_, HashMap<K, u64>> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<K: Hash + Eq + Clone> TagSlot<K> {
    /// Index `key` and return the stamp for the entry about to hold it
    fn track(&self, key: &K) -> u64 {
        let stamp = self.next_stamp.fetch_add(1, Ordering::Relaxed);
        self.keys().insert(key.clone(), stamp);
        stamp
    }

    /// Unindex `key`, unless a newer entry has taken its place
    fn forget(&self, key: &K, stamp: u64) {
        let mut keys = self.keys();
        if keys.get(key) == Some(&stamp) {
            keys.remove(key);
        }
    }
}

/// Represents an in-flight computation that other requests can wait on
type InFlight<V> = watch::Receiver<Option<Result<Arc<V>, CacheError>>>;
type InFlightSender<V> = watch::Sender<Option<Result<Arc<V>, CacheError>>>;
type InFlightMap<K, V> = Arc<RwLock<HashMap<K, InFlight<V>>>>;

/// Guard that ensures in-flight entries are cleaned up even on panic/cancel.
///
/// Only removes the map slot it registered: after an invalidation the key may
/// already belong to a newer computation.
struct InFlightGuard<K: CacheKey, V: Cacheable> {
    key: K,
    in_flight: InFlightMap<K, V>,
    tx: Option<InFlightSender<V>>,
    rx: InFlight<V>,
}

impl<K: CacheKey, V: Cacheable> InFlightGuard<K, V> {
    fn new(key: K, in_flight: InFlightMap<K, V>, tx: InFlightSender<V>, rx: InFlight<V>) -> Self {
        Self {
            key,
            in_flight,
            tx: Some(tx),
            rx,
        }
    }

    /// Unregister the computation, then hand the result to its waiters.
    async fn complete(mut self, result: Result<Arc<V>, CacheError>) {
        {
            let mut in_flight = self.in_flight.write().await;
            remove_if_owned(&mut in_flight, &self.key, &self.rx);
        }
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(Some(result));
        }
    }
}

impl<K: CacheKey, V: Cacheable> Drop for InFlightGuard<K, V> {
    fn drop(&mut self) {
        // tx is only still present if complete() never ran
        let Some(tx) = self.tx.take() else {
            return;
        };

        warn!("In-flight computation for key {} was cancelled", self.key);
        // Closing the channel wakes the waiters, which take the computation over
        drop(tx);

        if let Ok(mut in_flight) = self.in_flight.try_write() {
            remove_if_owned(&mut in_flight, &self.key, &self.rx);
            return;
        }

        // Lock is busy; finish the cleanup asynchronously
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let key = self.key.clone();
            let rx = self.rx.clone();
            let in_flight = Arc::clone(&self.in_flight);
            handle.spawn(async move {
                let mut in_flight = in_flight.write().await;
                remove_if_owned(&mut in_flight, &key, &rx);
            });
        }
    }
}

fn remove_if_owned<K: CacheKey, V>(map: &mut HashMap<K, InFlight<V>>, key: &K, rx: &InFlight<V>) {
    if map.get(key).is_some_and(|current| current.same_channel(rx)) {
        map.remove(key);
    }
}

/// Wait for an in-flight computation to publish its result.
///
/// Returns `None` if the computation was abandoned before finishing.
async fn wait_for<V>(mut rx: InFlight<V>) -> Option<Result<Arc<V>, CacheError>> {
    loop {
        if let Some(result) = rx.borrow_and_update().as_ref() {
            return Some(result.clone());
        }
        if rx.changed().await.is_err() {
            return None;
        }
    }
}

struct TaggedCacheInner<K: CacheKey, V: Cacheable> {
    entries: Cache<K, CacheEntry<K, V>>,
    tags: RwLock<HashMap<K::Tag, Arc<TagSlot<K>>>>,
    /// Track in-flight computations for request coalescing
    in_flight: InFlightMap<K, V>,
    config: CacheConfig,
}

/// Generic tag-aware cache
pub struct TaggedCache<K: CacheKey, V: Cacheable> {
    inner: Arc<TaggedCacheInner<K, V>>,
}

impl<K: CacheKey, V: Cacheable> Clone for TaggedCache<K, V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: CacheKey, V: Cacheable> TaggedCache<K, V> {
    pub fn new(config: CacheConfig) -> Self {
        let entries = Cache::builder()
            .max_capacity(config.max_capacity)
            .expire_after(EntryExpiry)
            .eviction_listener(|key: Arc<K>, entry: CacheEntry<K, V>, cause: RemovalCause| {
                // Explicit removals come from invalidate(), which has already
                // drained the index, and replaced keys stay stored
                if cause.was_evicted() {
                    entry.slot.forget(&key, entry.stamp);
                }
            })
            .build();

        Self {
            inner: Arc::new(TaggedCacheInner {
                entries,
                tags: RwLock::new(HashMap::new()),
                in_flight: Arc::new(RwLock::new(HashMap::new())),
                config,
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Get the value for `key`, running `compute` only on a miss.
    ///
    /// Concurrent misses on the same key share one computation. A failed
    /// computation is reported to every caller waiting on it and is not
    /// stored. If the computation is dropped before finishing, one of its
    /// waiters runs its own `compute` instead.
    pub async fn get_with<F, Fut, E>(&self, key: &K, compute: F) -> Result<Arc<V>, CacheError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
        E: Into<BoxError>,
    {
        if let Some(value) = self.lookup(key).await {
            debug!("Cache hit for key: {}", key);
            return Ok(value);
        }

        debug!("Cache miss for key: {}", key);

        let guard = loop {
            // Check if there's already an in-flight computation for this key
            let existing = self.inner.in_flight.read().await.get(key).cloned();
            if let Some(rx) = existing {
                debug!("Waiting for in-flight computation for key: {}", key);
                if let Some(result) = wait_for(rx.clone()).await {
                    return result;
                }

                debug!("In-flight computation for key {} was abandoned", key);
                let mut in_flight = self.inner.in_flight.write().await;
                remove_if_owned(&mut in_flight, key, &rx);
                continue;
            }

            // Register this computation as in-flight
            let mut in_flight = self.inner.in_flight.write().await;
            // Double-check: another task might have registered while we waited for the write lock
            if in_flight.contains_key(key) {
                continue;
            }
            let (tx, rx) = watch::channel(None);
            in_flight.insert(key.clone(), rx.clone());
            break InFlightGuard::new(key.clone(), Arc::clone(&self.inner.in_flight), tx, rx);
        };

        // A computation that finished between the lookup and our registration
        // has already stored its value
        if let Some(value) = self.lookup(key).await {
            debug!("Cache hit after registration for key: {}", key);
            guard.complete(Ok(Arc::clone(&value))).await;
            return Ok(value);
        }

        let slot = self.tag_slot(&key.tag()).await;
        let generation = slot.generation();

        // The guard ensures waiters are released even on panic/cancellation
        let result = match compute().await {
            Ok(value) => {
                let value = Arc::new(value);
                self.store(key, Arc::clone(&value), slot, generation).await;
                Ok(value)
            }
            Err(e) => {
                let err = CacheError::compute(e);
                error!("Compute error for key {}: {}", key, err);
                Err(err)
            }
        };

        guard.complete(result.clone()).await;

        result
    }

    /// Remove every entry carrying `tag`.
    ///
    /// Once this returns, computations started before it can no longer store
    /// their results, and new callers never join them.
    pub async fn invalidate(&self, tag: &K::Tag) {
        let slot = self.tag_slot(tag).await;
        let keys = slot.advance();
        for key in &keys {
            self.inner.entries.invalidate(key).await;
        }

        // Detach computations still running under the old generation
        self.inner
            .in_flight
            .write()
            .await
            .retain(|key, _| key.tag() != *tag);

        debug!("Invalidated {} entries for tag: {}", keys.len(), tag);
    }

    async fn lookup(&self, key: &K) -> Option<Arc<V>> {
        let entry = self.inner.entries.get(key).await?;
        if !entry.is_current() {
            debug!("Entry for key {} predates an invalidation", key);
            return None;
        }
        if !entry.is_fresh(Instant::now()) {
            debug!("Stale entry for key: {} (tag {})", key, key.tag());
            return None;
        }
        Some(entry.payload)
    }

    async fn store(&self, key: &K, payload: Arc<V>, slot: Arc<TagSlot<K>>, generation: u64) {
        if slot.generation() != generation {
            debug!(
                "Tag {} was invalidated during computation, not storing key: {}",
                key.tag(),
                key
            );
            return;
        }

        // Indexed first, so an eviction during the insert finds the key
        let stamp = slot.track(key);
        let entry = CacheEntry {
            payload,
            slot,
            generation,
            stamp,
            created_at: Instant::now(),
            ttl: self.inner.config.ttl,
        };
        self.inner.entries.insert(key.clone(), entry).await;
    }

    async fn tag_slot(&self, tag: &K::Tag) -> Arc<TagSlot<K>> {
        if let Some(slot) = self.inner.tags.read().await.get(tag) {
            return Arc::clone(slot);
        }

        let mut tags = self.inner.tags.write().await;
        Arc::clone(tags.entry(tag.clone()).or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, PartialEq, Eq, Hash)]
    struct TestKey {
        group: &'static str,
        id: u32,
    }

    impl fmt::Display for TestKey {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}:{}", self.group, self.id)
        }
    }

    impl CacheKey for TestKey {
        type Tag = &'static str;

        fn tag(&self) -> Self::Tag {
            self.group
        }
    }

    fn key(group: &'static str, id: u32) -> TestKey {
        TestKey { group, id }
    }

    fn counting(
        calls: &Arc<AtomicUsize>,
        value: &'static str,
    ) -> impl FnOnce() -> std::future::Ready<Result<String, BoxError>> {
        let calls = Arc::clone(calls);
        move || {
            calls.fetch_add(1, Ordering::SeqCst);
            std::future::ready(Ok(value.to_owned()))
        }
    }

    async fn fetch(
        cache: &TaggedCache<TestKey, String>,
        key: &TestKey,
        calls: &Arc<AtomicUsize>,
        value: &'static str,
    ) -> Arc<String> {
        cache.get_with(key, counting(calls, value)).await.unwrap()
    }

    /// Number of keys indexed under `tag` once Moka's pending evictions ran
    async fn indexed(cache: &TaggedCache<TestKey, String>, tag: &'static str) -> usize {
        for _ in 0..3 {
            cache.inner.entries.run_pending_tasks().await;
        }
        let slot = cache.tag_slot(&tag).await;
        slot.keys().len()
    }

    #[tokio::test]
    async fn test_hit_skips_compute() {
        let cache: TaggedCache<TestKey, String> = TaggedCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        let first = fetch(&cache, &key("a", 1), &calls, "one").await;
        let second = fetch(&cache, &key("a", 1), &calls, "two").await;

        assert_eq!(*first, "one");
        assert_eq!(*second, "one");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_only_touches_tag() {
        let cache: TaggedCache<TestKey, String> = TaggedCache::new(CacheConfig::default());
        let calls = Arc::new(AtomicUsize::new(0));

        fetch(&cache, &key("a", 1), &calls, "a1").await;
        fetch(&cache, &key("a", 2), &calls, "a2").await;
        fetch(&cache, &key("b", 1), &calls, "b1").await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);

        cache.invalidate(&"a").await;

        let a1 = fetch(&cache, &key("a", 1), &calls, "a1'").await;
        let a2 = fetch(&cache, &key("a", 2), &calls, "a2'").await;
        let b1 = fetch(&cache, &key("b", 1), &calls, "b1'").await;

        assert_eq!(*a1, "a1'");
        assert_eq!(*a2, "a2'");
        assert_eq!(*b1, "b1");
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test]
    async fn test_invalidate_unknown_tag_is_noop() {
        let cache: TaggedCache<TestKey, String> = TaggedCache::new(CacheConfig::default());
        cache.invalidate(&"nothing-here").await;
    }

    #[tokio::test]
    async fn test_entry_expires_after_ttl() {
        let cache: TaggedCache<TestKey, String> = TaggedCache::new(CacheConfig {
            ttl: Duration::from_millis(100),
            ..Default::default()
        });
        let calls = Arc::new(AtomicUsize::new(0));

        fetch(&cache, &key("a", 1), &calls, "old").await;
        tokio::time::sleep(Duration::from_millis(250)).await;
        let value = fetch(&cache, &key("a", 1), &calls, "new").await;

        assert_eq!(*value, "new");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expired_keys_leave_tag_index() {
        let cache: TaggedCache<TestKey, String> = TaggedCache::new(CacheConfig {
            ttl: Duration::from_millis(200),
            ..Default::default()
        });
        let calls = Arc::new(AtomicUsize::new(0));

        for id in 0..20 {
            fetch(&cache, &key("a", id), &calls, "page").await;
        }
        assert_eq!(indexed(&cache, "a").await, 20);

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(indexed(&cache, "a").await, 0);
    }

    #[tokio::test]
    async fn test_capacity_evictions_leave_tag_index() {
        let cache: TaggedCache<TestKey, String> = TaggedCache::new(CacheConfig {
            max_capacity: 10,
            ..Default::default()
        });
        let calls = Arc::new(AtomicUsize::new(0));

        for id in 0..50 {
            fetch(&cache, &key("a", id), &calls, "page").await;
        }

        let indexed = indexed(&cache, "a").await;
        assert!(indexed <= 10, "{indexed} keys indexed");
        assert_eq!(indexed as u64, cache.inner.entries.entry_count());
    }

    #[tokio::test]
    async fn test_recomputed_key_stays_indexed() {
        let cache: TaggedCache<TestKey, String> = TaggedCache::new(CacheConfig {
            ttl: Duration::from_millis(200),
            ..Default::default()
        });
        let calls = Arc::new(AtomicUsize::new(0));

        fetch(&cache, &key("a", 1), &calls, "old").await;
        tokio::time::sleep(Duration::from_millis(400)).await;
        // Replaces the expired entry before Moka reports its eviction
        fetch(&cache, &key("a", 1), &calls, "new").await;
        assert_eq!(indexed(&cache, "a").await, 1);

        cache.invalidate(&"a").await;
        assert_eq!(indexed(&cache, "a").await, 0);
        assert_eq!(cache.inner.entries.entry_count(), 0);
    }

    #[tokio::test]
    async fn test_failed_compute_is_not_stored() {
        let cache: TaggedCache<TestKey, String> = TaggedCache::new(CacheConfig::default());

        let err = cache
            .get_with(&key("a", 1), || async { Err::<String, _>("boom") })
            .await
            .unwrap_err();
        assert!(matches!(err, CacheError::Compute(_)));
        assert_eq!(err.to_string(), "Compute error: boom");

        let calls = Arc::new(AtomicUsize::new(0));
        let value = fetch(&cache, &key("a", 1), &calls, "ok").await;
        assert_eq!(*value, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_invalidate_during_compute_discards_result() {
        let cache: TaggedCache<TestKey, String> = TaggedCache::new(CacheConfig::default());
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let leader = tokio::spawn({
            let cache = cache.clone();
            async move {
                cache
                    .get_with(&key("a", 1), || async move {
                        let _ = started_tx.send(());
                        let _ = release_rx.await;
                        Ok::<_, BoxError>("computed before invalidation".to_owned())
                    })
                    .await
            }
        });

        started_rx.await.unwrap();
        cache.invalidate(&"a").await;
        release_tx.send(()).unwrap();

        // The leader still answers its own caller
        let leader_value = leader.await.unwrap().unwrap();
        assert_eq!(*leader_value, "computed before invalidation");

        // But the result was not stored
        let calls = Arc::new(AtomicUsize::new(0));
        let value = fetch(&cache, &key("a", 1), &calls, "fresh").await;
        assert_eq!(*value, "fresh");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_cancelled_leader_hands_over_to_waiter() {
        let cache: TaggedCache<TestKey, String> = TaggedCache::new(CacheConfig::default());
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();

        let leader = tokio::spawn({
            let cache = cache.clone();
            async move {
                cache
                    .get_with(&key("a", 1), || async move {
                        let _ = started_tx.send(());
                        std::future::pending::<Result<String, BoxError>>().await
                    })
                    .await
            }
        });
        started_rx.await.unwrap();

        let waiter = tokio::spawn({
            let cache = cache.clone();
            async move {
                cache
                    .get_with(&key("a", 1), || async {
                        Ok::<_, BoxError>("computed by waiter".to_owned())
                    })
                    .await
            }
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        leader.abort();
        let value = waiter.await.unwrap().unwrap();
        assert_eq!(*value, "computed by waiter");

        // The waiter's result was stored
        let calls = Arc::new(AtomicUsize::new(0));
        let value = fetch(&cache, &key("a", 1), &calls, "unused").await;
        assert_eq!(*value, "computed by waiter");
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_caller_after_cancelled_leader_computes() {
        let cache: TaggedCache<TestKey, String> = TaggedCache::new(CacheConfig::default());
        let (started_tx, started_rx) = tokio::sync::oneshot::channel::<()>();

        let leader = tokio::spawn({
            let cache = cache.clone();
            async move {
                cache
                    .get_with(&key("a", 1), || async move {
                        let _ = started_tx.send(());
                        std::future::pending::<Result<String, BoxError>>().await
                    })
                    .await
            }
        });
        started_rx.await.unwrap();
        leader.abort();
        let _ = leader.await;

        // No pause: the cancelled registration may still be in the map
        let calls = Arc::new(AtomicUsize::new(0));
        let value = fetch(&cache, &key("a", 1), &calls, "retry").await;
        assert_eq!(*value, "retry");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_abandoned_registration_is_taken_over() {
        let cache: TaggedCache<TestKey, String> = TaggedCache::new(CacheConfig::default());

        // A registration whose sender is gone, as left by a leader dropped
        // while the map was locked and no runtime could finish the cleanup
        let (tx, rx) = watch::channel(None);
        drop(tx);
        cache.inner.in_flight.write().await.insert(key("a", 1), rx);

        let calls = Arc::new(AtomicUsize::new(0));
        let value = fetch(&cache, &key("a", 1), &calls, "recovered").await;
        assert_eq!(*value, "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!cache.inner.in_flight.read().await.contains_key(&key("a", 1)));
    }
}
