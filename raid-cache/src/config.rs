use common_redis::{CustomRedisError, RedisClient};
use envconfig::Envconfig;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result as CacheResult;
use crate::store::RedisCache;

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(from = "REDIS_URL", default = "redis://localhost:6379/")]
    pub redis_url: String,

    #[envconfig(from = "CACHE_PREFIX", default = "raid")]
    pub cache_prefix: String,

    #[envconfig(from = "CACHE_DEFAULT_TTL_SECS", default = "300")]
    pub cache_default_ttl_secs: u64,

    #[envconfig(from = "REDIS_RESPONSE_TIMEOUT_MS", default = "250")]
    pub redis_response_timeout_ms: u64,

    #[envconfig(from = "REDIS_CONNECTION_TIMEOUT_MS", default = "5000")]
    pub redis_connection_timeout_ms: u64,

    // Comma separated
    #[envconfig(from = "EVENT_CHANNELS", default = "raid.events,registration.events")]
    pub event_channels: String,

    #[envconfig(from = "LOG_JSON", default = "false")]
    pub log_json: bool,
}

impl Config {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_default_ttl_secs)
    }

    pub fn channels(&self) -> Vec<String> {
        self.event_channels
            .split(',')
            .map(str::trim)
            .filter(|channel| !channel.is_empty())
            .map(str::to_string)
            .collect()
    }

    /// A zero millisecond setting disables that timeout.
    fn timeout(ms: u64) -> Option<Duration> {
        (ms > 0).then(|| Duration::from_millis(ms))
    }

    pub async fn redis_client(&self) -> Result<RedisClient, CustomRedisError> {
        RedisClient::with_config(
            self.redis_url.clone(),
            Self::timeout(self.redis_response_timeout_ms),
            Self::timeout(self.redis_connection_timeout_ms),
        )
        .await
    }

    pub fn redis_cache(&self, client: Arc<RedisClient>) -> CacheResult<RedisCache> {
        RedisCache::new(client, self.cache_prefix.clone(), self.default_ttl())
    }
}
