//! Cache store capability and its two backends.
//!
//! [`Cache`] methods never fail. Backends log their own failures and degrade:
//! `get` to a miss, writes and deletes to no-ops, `exists` to `false`. Values
//! cross the trait as JSON; [`CacheExt`] adds typed access on top.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;

pub mod memory;
pub mod redis;

pub use memory::{MemoizeOptions, MemoryCache};
pub use redis::RedisCache;

#[async_trait]
pub trait Cache: Send + Sync {
    async fn get_json(&self, key: &str) -> Option<Value>;

    /// Store a value. `ttl` of `None` means the backend default (which may be
    /// "no expiry" for the in-process backend).
    async fn set_json(&self, key: &str, value: Value, ttl: Option<Duration>);

    async fn delete(&self, key: &str);

    /// Delete every key matching a glob pattern. Matching nothing is a no-op.
    async fn delete_pattern(&self, pattern: &str);

    async fn exists(&self, key: &str) -> bool;
}

/// Typed access over any [`Cache`], including `dyn Cache`.
pub trait CacheExt: Cache {
    /// Read and decode a value. A value that does not decode as `T` is a miss.
    fn get<T>(&self, key: &str) -> impl Future<Output = Option<T>> + Send
    where
        T: DeserializeOwned + Send,
    {
        async move {
            let value = self.get_json(key).await?;
            match serde_json::from_value(value) {
                Ok(decoded) => Some(decoded),
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Cached value did not decode, treating as miss");
                    None
                }
            }
        }
    }

    /// Encode and store a value. A value that does not encode is not stored.
    fn set<T>(&self, key: &str, value: &T, ttl: Option<Duration>) -> impl Future<Output = ()> + Send
    where
        T: Serialize + Sync + ?Sized,
    {
        async move {
            match serde_json::to_value(value) {
                Ok(encoded) => self.set_json(key, encoded, ttl).await,
                Err(e) => {
                    tracing::warn!(key = %key, error = %e, "Value did not encode, not caching");
                }
            }
        }
    }
}

impl<C: Cache + ?Sized> CacheExt for C {}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;
    use std::sync::Arc;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Server {
        id: String,
        name: String,
    }

    #[tokio::test]
    async fn test_typed_access_through_dyn_cache() {
        let cache: Arc<dyn Cache> = Arc::new(MemoryCache::new());
        let server = Server {
            id: "s1".to_string(),
            name: "Guild".to_string(),
        };

        cache.set("server:s1", &server, None).await;
        let cached: Option<Server> = cache.get("server:s1").await;
        assert_eq!(cached, Some(server));
    }

    #[tokio::test]
    async fn test_decode_failure_is_a_miss() {
        let cache = MemoryCache::new();
        cache.set("server:s1", &"not a server", None).await;

        let cached: Option<Server> = cache.get("server:s1").await;
        assert_eq!(cached, None);
        assert!(cache.exists("server:s1").await);
    }
}
