//! In-process cache backend.
//!
//! Entries may carry a timeout. Expiry is enforced twice: lazily on read, and
//! by a scheduled eviction task so unread entries do not linger. Every entry
//! owns its timers; replacing or deleting an entry cancels them, and each
//! eviction task only removes the exact entry generation it was scheduled for,
//! so a late timer can never evict a newer value stored under the same key.
//!
//! [`MemoryCache::memoize`] adds an optional background refresh that keeps an
//! entry warm by recomputing it on a fixed cadence, independent of reads. The
//! refresh outlives timeout eviction: an evicted key keeps its refresh task
//! parked until the next tick stores a fresh value. Only `delete`, an
//! overwrite or `dispose` cancel it.
//!
//! Timers are Tokio tasks: methods that schedule them must run inside a Tokio
//! runtime.

use async_trait::async_trait;
use common_redis::pattern;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::task::AbortHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::error::{CacheError, Result};
use crate::store::Cache;

struct RefreshTask {
    id: u64,
    handle: AbortHandle,
}

impl Drop for RefreshTask {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
    generation: u64,
    eviction: Option<AbortHandle>,
    refresh: Option<RefreshTask>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    fn refresh_id(&self) -> Option<u64> {
        self.refresh.as_ref().map(|task| task.id)
    }
}

impl Drop for Entry {
    fn drop(&mut self) {
        if let Some(eviction) = self.eviction.take() {
            eviction.abort();
        }
    }
}

#[derive(Default)]
struct Slots {
    entries: HashMap<String, Entry>,
    /// Refresh tasks of keys whose entry expired, waiting for their next tick.
    parked: HashMap<String, RefreshTask>,
}

impl Slots {
    /// Drop an expired entry but keep its refresh task alive.
    fn expire(&mut self, key: &str) {
        if let Some(mut entry) = self.entries.remove(key) {
            if let Some(refresh) = entry.refresh.take() {
                self.parked.insert(key.to_string(), refresh);
            }
        }
    }

    /// Drop an entry together with any refresh task for its key.
    fn remove(&mut self, key: &str) {
        self.entries.remove(key);
        self.parked.remove(key);
    }

    fn refresh_id(&self, key: &str) -> Option<u64> {
        match self.entries.get(key) {
            Some(entry) => entry.refresh_id(),
            None => self.parked.get(key).map(|task| task.id),
        }
    }

    fn take_refresh(&mut self, key: &str) -> Option<RefreshTask> {
        match self.entries.get_mut(key) {
            Some(entry) => entry.refresh.take(),
            None => self.parked.remove(key),
        }
    }
}

#[derive(Default)]
struct Inner {
    slots: Mutex<Slots>,
    ids: AtomicU64,
}

impl Inner {
    fn next_id(&self) -> u64 {
        self.ids.fetch_add(1, Ordering::Relaxed)
    }

    fn evict(&self, key: &str, generation: u64) {
        let mut slots = self.slots.lock();
        if slots
            .entries
            .get(key)
            .is_some_and(|entry| entry.generation == generation)
        {
            slots.expire(key);
            debug!(key = %key, "Evicted expired in-memory cache entry");
        }
    }
}

/// Options for [`MemoryCache::memoize`].
pub struct MemoizeOptions<T> {
    timeout: Option<Duration>,
    refresh: Option<Duration>,
    ignore_cache: Option<Arc<dyn Fn(&T) -> bool + Send + Sync>>,
}

impl<T> Default for MemoizeOptions<T> {
    fn default() -> Self {
        Self {
            timeout: None,
            refresh: None,
            ignore_cache: None,
        }
    }
}

impl<T> Clone for MemoizeOptions<T> {
    fn clone(&self) -> Self {
        Self {
            timeout: self.timeout,
            refresh: self.refresh,
            ignore_cache: self.ignore_cache.clone(),
        }
    }
}

impl<T> fmt::Debug for MemoizeOptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoizeOptions")
            .field("timeout", &self.timeout)
            .field("refresh", &self.refresh)
            .field("ignore_cache", &self.ignore_cache.is_some())
            .finish()
    }
}

impl<T> MemoizeOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Evict the cached value this long after it was stored.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Recompute and overwrite the cached value on this cadence.
    pub fn refresh(mut self, every: Duration) -> Self {
        self.refresh = Some(every);
        self
    }

    /// Never cache a computed value for which `predicate` returns true.
    pub fn ignore_cache<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.ignore_cache = Some(Arc::new(predicate));
        self
    }

    fn validate(&self) -> Result<()> {
        validate_duration("timeout", self.timeout)?;
        validate_duration("refresh", self.refresh)
    }

    fn ignores(&self, value: &T) -> bool {
        self.ignore_cache
            .as_ref()
            .is_some_and(|predicate| predicate(value))
    }
}

fn validate_duration(name: &str, duration: Option<Duration>) -> Result<()> {
    match duration {
        Some(d) if d.is_zero() => Err(CacheError::InvalidConfiguration(format!(
            "{name} must be greater than zero - use None to disable it"
        ))),
        _ => Ok(()),
    }
}

/// Process-local cache with timer-based expiry.
///
/// Cloning shares the same entries. Owned by the process bootstrap: construct
/// it, pass it to whatever needs it, and call [`MemoryCache::dispose`] (or drop
/// the last clone) on shutdown to cancel outstanding timers.
#[derive(Clone, Default)]
pub struct MemoryCache {
    inner: Arc<Inner>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value, replacing (and cancelling the timers of) any previous entry.
    ///
    /// # Errors
    /// `CacheError::InvalidConfiguration` for a zero timeout.
    pub fn insert(&self, key: &str, value: Value, timeout: Option<Duration>) -> Result<()> {
        validate_duration("timeout", timeout)?;
        self.put(key, value, timeout, None);
        Ok(())
    }

    /// Return the cached value for `key`, or compute, cache and return it.
    ///
    /// With a `refresh` interval, a background task recomputes the value on
    /// that cadence after the first population and overwrites the entry. A
    /// timeout eviction does not stop it; deleting or replacing the entry, or
    /// disposing the cache, does. A failed refresh keeps the previous value.
    ///
    /// # Errors
    /// Invalid options fail before `compute` runs. Errors from `compute` are
    /// returned unchanged and nothing is cached.
    pub async fn memoize<T, E, F, Fut>(
        &self,
        key: &str,
        compute: F,
        options: MemoizeOptions<T>,
    ) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned + Send + 'static,
        E: From<CacheError> + fmt::Display + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    {
        options.validate()?;

        if let Some(cached) = self.read(key) {
            match serde_json::from_value(cached) {
                Ok(value) => return Ok(value),
                Err(e) => warn!(key = %key, error = %e, "Memoized value did not decode, recomputing"),
            }
        }

        let value = compute().await?;
        if options.ignores(&value) {
            debug!(key = %key, "Computed value rejected by ignore_cache, not caching");
            return Ok(value);
        }

        let encoded = match serde_json::to_value(&value) {
            Ok(encoded) => encoded,
            Err(e) => {
                warn!(key = %key, error = %e, "Memoized value did not encode, not caching");
                return Ok(value);
            }
        };

        if let Some(generation) = self.put(key, encoded, options.timeout, None) {
            if let Some(every) = options.refresh {
                self.start_refresh(key, generation, every, compute, options);
            }
        }

        Ok(value)
    }

    /// Cancel every timer and drop every entry.
    pub fn dispose(&self) {
        let drained = std::mem::take(&mut *self.inner.slots.lock());
        debug!(
            entries = drained.entries.len(),
            parked_refreshes = drained.parked.len(),
            "Disposed in-memory cache"
        );
    }

    /// Number of stored entries, including expired ones not yet evicted.
    pub fn len(&self) -> usize {
        self.inner.slots.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self, key: &str) -> Option<Value> {
        let mut slots = self.inner.slots.lock();
        let entry = slots.entries.get(key)?;
        if entry.is_expired(Instant::now()) {
            slots.expire(key);
            return None;
        }
        Some(entry.value.clone())
    }

    /// Insert a new entry generation. When `refresh_id` is set the write comes
    /// from that refresh task: it carries the task over to the new entry, and
    /// is dropped (returning `None`) if the task no longer owns the key. Any
    /// other write cancels the key's refresh.
    fn put(
        &self,
        key: &str,
        value: Value,
        timeout: Option<Duration>,
        refresh_id: Option<u64>,
    ) -> Option<u64> {
        let generation = self.inner.next_id();
        let mut slots = self.inner.slots.lock();

        let refresh = match refresh_id {
            None => {
                slots.parked.remove(key);
                None
            }
            Some(id) if slots.refresh_id(key) == Some(id) => slots.take_refresh(key),
            Some(_) => return None,
        };

        let eviction = timeout.map(|t| self.spawn_eviction(key, generation, t));
        slots.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: timeout.map(|t| Instant::now() + t),
                generation,
                eviction,
                refresh,
            },
        );
        Some(generation)
    }

    fn spawn_eviction(&self, key: &str, generation: u64, timeout: Duration) -> AbortHandle {
        let inner: Weak<Inner> = Arc::downgrade(&self.inner);
        let key = key.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(inner) = inner.upgrade() {
                inner.evict(&key, generation);
            }
        })
        .abort_handle()
    }

    fn owns_refresh(&self, key: &str, id: u64) -> bool {
        self.inner.slots.lock().refresh_id(key) == Some(id)
    }

    fn start_refresh<T, E, F, Fut>(
        &self,
        key: &str,
        generation: u64,
        every: Duration,
        compute: F,
        options: MemoizeOptions<T>,
    ) where
        T: Serialize + Send + 'static,
        E: fmt::Display + Send + 'static,
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, E>> + Send + 'static,
    {
        let id = self.inner.next_id();
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let task_key = key.to_string();

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + every, every);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let result = compute().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let cache = MemoryCache { inner };

                let value = match result {
                    Ok(value) => value,
                    Err(e) => {
                        warn!(key = %task_key, error = %e, "Background refresh failed, keeping previous value");
                        if cache.owns_refresh(&task_key, id) {
                            continue;
                        }
                        break;
                    }
                };
                if options.ignores(&value) {
                    if cache.owns_refresh(&task_key, id) {
                        continue;
                    }
                    break;
                }
                match serde_json::to_value(&value) {
                    Ok(encoded) => {
                        if cache
                            .put(&task_key, encoded, options.timeout, Some(id))
                            .is_none()
                        {
                            break;
                        }
                        debug!(key = %task_key, "Refreshed memoized value");
                    }
                    Err(e) => {
                        warn!(key = %task_key, error = %e, "Refreshed value did not encode, keeping previous value");
                    }
                }
            }
        });

        let mut slots = self.inner.slots.lock();
        match slots.entries.get_mut(key) {
            Some(entry) if entry.generation == generation => {
                entry.refresh = Some(RefreshTask {
                    id,
                    handle: task.abort_handle(),
                });
            }
            _ => task.abort(),
        }
    }
}

#[async_trait]
impl Cache for MemoryCache {
    async fn get_json(&self, key: &str) -> Option<Value> {
        self.read(key)
    }

    async fn set_json(&self, key: &str, value: Value, ttl: Option<Duration>) {
        if let Err(e) = self.insert(key, value, ttl) {
            error!(key = %key, error = %e, "Refusing to cache value with invalid timeout");
        }
    }

    async fn delete(&self, key: &str) {
        self.inner.slots.lock().remove(key);
    }

    async fn delete_pattern(&self, pattern: &str) {
        let matcher = match pattern::compile(pattern) {
            Ok(matcher) => matcher,
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "Invalid invalidation pattern");
                return;
            }
        };
        let mut slots = self.inner.slots.lock();
        let before = slots.entries.len();
        slots.entries.retain(|key, _| !matcher.is_match(key));
        slots.parked.retain(|key, _| !matcher.is_match(key));
        debug!(pattern = %pattern, deleted = before - slots.entries.len(), "Deleted keys by pattern");
    }

    async fn exists(&self, key: &str) -> bool {
        self.read(key).is_some()
    }
}
