//! Remote cache backend over a shared Redis client.

use async_trait::async_trait;
use common_redis::{Client as RedisClientTrait, CustomRedisError};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::codec;
use crate::error::{CacheError, Result};
use crate::metrics::record_backend_error;
use crate::store::Cache;

/// Cache backed by a remote key-value store.
///
/// Every key is namespaced as `{prefix}:{key}` so several logical caches can
/// share one backend. The prefix is a single segment: no `:` and no glob
/// metacharacters, so one cache can never see or pattern-delete another's keys. Every write carries a TTL; callers that pass none get
/// the store default. Backend and decode failures never escape: they are
/// logged and degrade to a miss, a no-op, or `false`.
pub struct RedisCache {
    client: Arc<dyn RedisClientTrait + Send + Sync>,
    prefix: String,
    default_ttl: Duration,
}

const RESERVED_PREFIX_CHARS: &[char] = &[':', '*', '?', '[', ']', '\\'];

impl RedisCache {
    /// # Errors
    /// `CacheError::InvalidConfiguration` for an empty prefix, or one holding
    /// `:` or a glob metacharacter.
    pub fn new(
        client: Arc<dyn RedisClientTrait + Send + Sync>,
        prefix: impl Into<String>,
        default_ttl: Duration,
    ) -> Result<Self> {
        let prefix = prefix.into();
        if prefix.is_empty() {
            return Err(CacheError::InvalidConfiguration(
                "cache prefix cannot be empty".to_string(),
            ));
        }
        if let Some(reserved) = prefix.chars().find(|c| RESERVED_PREFIX_CHARS.contains(c)) {
            return Err(CacheError::InvalidConfiguration(format!(
                "cache prefix {prefix:?} cannot contain {reserved:?}"
            )));
        }

        Ok(Self {
            client,
            prefix,
            default_ttl,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn namespaced(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    /// Redis TTLs are whole seconds; partial seconds round up.
    fn ttl_seconds(&self, ttl: Option<Duration>) -> u64 {
        let millis = ttl.unwrap_or(self.default_ttl).as_millis().div_ceil(1000);
        u64::try_from(millis).unwrap_or(u64::MAX).max(1)
    }
}

#[async_trait]
impl Cache for RedisCache {
    async fn get_json(&self, key: &str) -> Option<Value> {
        let payload = match self.client.get(self.namespaced(key)).await {
            Ok(payload) => payload,
            Err(CustomRedisError::NotFound) => {
                debug!(key = %key, "Cache miss");
                return None;
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Cache get failed, treating as miss");
                record_backend_error("get");
                return None;
            }
        };

        match codec::deserialize(&payload) {
            Ok(value) => {
                debug!(key = %key, "Cache hit");
                Some(value)
            }
            Err(e) => {
                warn!(key = %key, error = %e, "Corrupted cache payload, treating as miss");
                record_backend_error("decode");
                None
            }
        }
    }

    async fn set_json(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let payload = match codec::serialize(&value) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(key = %key, error = %e, "Value did not encode, not caching");
                record_backend_error("encode");
                return;
            }
        };

        let seconds = self.ttl_seconds(ttl);
        if let Err(e) = self
            .client
            .setex(self.namespaced(key), payload, seconds)
            .await
        {
            warn!(key = %key, error = %e, "Cache set failed");
            record_backend_error("set");
        }
    }

    async fn delete(&self, key: &str) {
        if let Err(e) = self.client.del(self.namespaced(key)).await {
            warn!(key = %key, error = %e, "Cache delete failed");
            record_backend_error("delete");
        }
    }

    async fn delete_pattern(&self, pattern: &str) {
        let keys = match self.client.keys(self.namespaced(pattern)).await {
            Ok(keys) => keys,
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "Cache key scan failed");
                record_backend_error("delete_pattern");
                return;
            }
        };
        if keys.is_empty() {
            return;
        }

        let count = keys.len();
        match self.client.batch_del(keys).await {
            Ok(()) => debug!(pattern = %pattern, deleted = count, "Deleted keys by pattern"),
            Err(e) => {
                warn!(pattern = %pattern, error = %e, "Cache pattern delete failed");
                record_backend_error("delete_pattern");
            }
        }
    }

    async fn exists(&self, key: &str) -> bool {
        match self.client.exists(self.namespaced(key)).await {
            Ok(exists) => exists,
            Err(e) => {
                warn!(key = %key, error = %e, "Cache exists check failed");
                record_backend_error("exists");
                false
            }
        }
    }
}
