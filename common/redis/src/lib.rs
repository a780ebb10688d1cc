use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Error, Debug, Clone)]
pub enum CustomRedisError {
    #[error("Not found in redis")]
    NotFound,
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("Timeout error")]
    Timeout,
    #[error(transparent)]
    Redis(#[from] Arc<redis::RedisError>),
}

impl From<redis::RedisError> for CustomRedisError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_timeout() {
            CustomRedisError::Timeout
        } else {
            CustomRedisError::Redis(Arc::new(err))
        }
    }
}

impl From<std::string::FromUtf8Error> for CustomRedisError {
    fn from(err: std::string::FromUtf8Error) -> Self {
        CustomRedisError::ParseError(err.to_string())
    }
}

impl CustomRedisError {
    /// Create a Redis error from an ErrorKind (primarily for testing)
    pub fn from_redis_kind(kind: redis::ErrorKind, description: &'static str) -> Self {
        CustomRedisError::Redis(Arc::new(redis::RedisError::from((kind, description))))
    }

    /// Returns `true` for configuration errors and permanent failures, `false` for
    /// transient network/connection issues that may resolve on retry.
    pub fn is_unrecoverable_error(&self) -> bool {
        match self {
            CustomRedisError::Timeout => false,
            CustomRedisError::InvalidConfiguration(_) => true,
            CustomRedisError::ParseError(_) => true,
            CustomRedisError::NotFound => true,
            CustomRedisError::Redis(err) => {
                matches!(
                    err.kind(),
                    redis::ErrorKind::InvalidClientConfig | redis::ErrorKind::AuthenticationFailed
                ) || err.is_unrecoverable_error()
            }
        }
    }
}

/// Capacity of the buffer between a channel subscription and its consumer.
pub const SUBSCRIPTION_BUFFER_SIZE: usize = 1024;

/// A live subscription to a single pub/sub channel.
///
/// Payloads are delivered in publish order. Dropping the subscription tears the
/// underlying channel subscription down.
pub struct Subscription {
    channel: String,
    receiver: mpsc::Receiver<String>,
    forwarder: Option<JoinHandle<()>>,
}

impl Subscription {
    pub fn new(
        channel: String,
        receiver: mpsc::Receiver<String>,
        forwarder: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            channel,
            receiver,
            forwarder,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Wait for the next payload. Returns `None` once the subscription is closed.
    pub async fn recv(&mut self) -> Option<String> {
        self.receiver.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(forwarder) = self.forwarder.take() {
            forwarder.abort();
        }
    }
}

#[async_trait]
pub trait Client {
    async fn get(&self, k: String) -> Result<String, CustomRedisError>;
    async fn setex(&self, k: String, v: String, seconds: u64) -> Result<(), CustomRedisError>;
    async fn del(&self, k: String) -> Result<(), CustomRedisError>;
    /// Delete every key in one round-trip. An empty list is a no-op.
    async fn batch_del(&self, keys: Vec<String>) -> Result<(), CustomRedisError>;
    /// Resolve a glob pattern to the matching keys (`KEYS pattern`).
    async fn keys(&self, pattern: String) -> Result<Vec<String>, CustomRedisError>;
    async fn exists(&self, k: String) -> Result<bool, CustomRedisError>;
    /// Publish a payload, returning the number of receivers it reached.
    async fn publish(&self, channel: String, payload: String) -> Result<u64, CustomRedisError>;
    async fn subscribe(&self, channel: String) -> Result<Subscription, CustomRedisError>;
}

mod client;
mod mock;
pub mod pattern;

pub use client::RedisClient;
pub use mock::{MockRedisCall, MockRedisClient, MockRedisValue};
