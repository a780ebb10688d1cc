//! Read-through helper.
//!
//! Check the cache, compute on a miss, store the result, return it. The cache
//! is optional: with `None` every call computes directly, so call sites work
//! unchanged in environments with no backend.
//!
//! Errors from the compute function propagate unchanged and are never cached.
//! Concurrent misses on one key each compute; there is no stampede protection.

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

use crate::metrics::record_read;
use crate::store::{Cache, CacheExt};
use crate::types::{CacheResult, CacheSource};

/// Key, TTL and optional store filter for one read-through call.
pub struct ReadThroughOptions<'a, T> {
    key: &'a str,
    ttl: Option<Duration>,
    ignore_if: Option<Box<dyn Fn(&T) -> bool + Send + Sync + 'a>>,
}

impl<'a, T> ReadThroughOptions<'a, T> {
    pub fn new(key: &'a str) -> Self {
        Self {
            key,
            ttl: None,
            ignore_if: None,
        }
    }

    pub fn ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Don't store computed values for which `predicate` returns true
    /// (e.g. an empty result that will soon be populated).
    pub fn ignore_if<P>(mut self, predicate: P) -> Self
    where
        P: Fn(&T) -> bool + Send + Sync + 'a,
    {
        self.ignore_if = Some(Box::new(predicate));
        self
    }

    pub fn key(&self) -> &str {
        self.key
    }
}

/// Return the cached value for `key`, or compute, store and return it.
pub async fn with_cache<T, E, F, Fut>(
    compute: F,
    cache: Option<&dyn Cache>,
    key: &str,
    ttl: Option<Duration>,
) -> Result<T, E>
where
    T: Serialize + DeserializeOwned + Send + Sync,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut options = ReadThroughOptions::new(key);
    options.ttl = ttl;
    with_cache_result(compute, cache, options)
        .await
        .map(CacheResult::into_value)
}

/// Like [`with_cache`], also reporting where the value came from.
pub async fn with_cache_result<T, E, F, Fut>(
    compute: F,
    cache: Option<&dyn Cache>,
    options: ReadThroughOptions<'_, T>,
) -> Result<CacheResult<T>, E>
where
    T: Serialize + DeserializeOwned + Send + Sync,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let Some(cache) = cache else {
        let value = compute().await?;
        record_read(CacheSource::NoCache);
        return Ok(CacheResult::new(value, CacheSource::NoCache));
    };

    if let Some(cached) = cache.get::<T>(options.key).await {
        record_read(CacheSource::PositiveCache);
        return Ok(CacheResult::new(cached, CacheSource::PositiveCache));
    }

    let value = compute().await?;

    if options
        .ignore_if
        .as_ref()
        .is_some_and(|predicate| predicate(&value))
    {
        debug!(key = %options.key, "Computed value ignored, not caching");
        record_read(CacheSource::LoaderIgnored);
        return Ok(CacheResult::new(value, CacheSource::LoaderIgnored));
    }

    cache.set(options.key, &value, options.ttl).await;
    record_read(CacheSource::LoaderCacheMiss);
    Ok(CacheResult::new(value, CacheSource::LoaderCacheMiss))
}
