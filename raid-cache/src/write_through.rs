//! Write-through invalidation helper.
//!
//! Runs the write, then (only on success, and only when both a cache and an
//! invalidation are supplied) drops whatever the write made stale. The write
//! result is returned untouched; invalidation can never fail it.

use std::future::Future;

use crate::invalidation::InvalidationFn;
use crate::store::Cache;

pub async fn write_with_invalidation<T, E, F, Fut>(
    write: F,
    cache: Option<&dyn Cache>,
    invalidation: Option<&dyn InvalidationFn<T>>,
) -> Result<T, E>
where
    T: Sync,
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let written = write().await?;

    if let (Some(cache), Some(invalidation)) = (cache, invalidation) {
        invalidation.invalidate(cache, &written).await;
    }

    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::invalidation::{after_update_raid, InvalidationTarget};
    use crate::keys;
    use crate::store::{CacheExt, MemoryCache};
    use parking_lot::Mutex;
    use serde_json::{json, Value};

    #[derive(Debug, PartialEq, thiserror::Error)]
    #[error("constraint violation")]
    struct WriteError;

    #[tokio::test]
    async fn test_invalidation_runs_after_successful_write() {
        let cache = MemoryCache::new();
        cache.set(&keys::raid("R"), &json!({"title": "old"}), None).await;

        let updated = write_with_invalidation(
            || async { Ok::<Value, WriteError>(json!({"id": "R", "serverId": "S", "title": "new"})) },
            Some(&cache),
            Some(&after_update_raid()),
        )
        .await
        .unwrap();

        assert_eq!(updated["title"], "new");
        assert!(!cache.exists(&keys::raid("R")).await);
    }

    #[tokio::test]
    async fn test_failed_write_skips_invalidation() {
        let cache = MemoryCache::new();
        cache.set(&keys::raid("R"), &1, None).await;

        let result: Result<Value, WriteError> = write_with_invalidation(
            || async { Err(WriteError) },
            Some(&cache),
            Some(&after_update_raid()),
        )
        .await;

        assert_eq!(result, Err(WriteError));
        assert!(cache.exists(&keys::raid("R")).await);
    }

    #[tokio::test]
    async fn test_write_happens_before_invalidation() {
        let cache = MemoryCache::new();
        let log = Mutex::new(Vec::new());

        let invalidation = |_: &u32| {
            log.lock().push("invalidate");
            Vec::<InvalidationTarget>::new()
        };
        write_with_invalidation(
            || async {
                log.lock().push("write");
                Ok::<u32, WriteError>(1)
            },
            Some(&cache),
            Some(&invalidation),
        )
        .await
        .unwrap();

        assert_eq!(*log.lock(), vec!["write", "invalidate"]);
    }

    #[tokio::test]
    async fn test_without_cache_returns_write_result() {
        let calls = Mutex::new(0);
        let invalidation = |_: &u32| {
            *calls.lock() += 1;
            Vec::<InvalidationTarget>::new()
        };

        let written = write_with_invalidation(
            || async { Ok::<u32, WriteError>(42) },
            None,
            Some(&invalidation),
        )
        .await
        .unwrap();

        assert_eq!(written, 42);
        assert_eq!(*calls.lock(), 0);
    }
}
