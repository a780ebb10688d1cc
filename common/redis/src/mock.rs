use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

use crate::pattern::glob_matches;
use crate::{Client, CustomRedisError, Subscription, SUBSCRIPTION_BUFFER_SIZE};

/// Test double for [`Client`].
///
/// Canned per-key results win when configured; otherwise the mock behaves as an
/// in-memory Redis (values written by `setex` are readable by `get`, `keys`
/// and `exists`, and `publish` reaches mock subscribers). Clones share state,
/// so several clients built from one mock see the same backend.
#[derive(Clone, Default)]
pub struct MockRedisClient {
    get_ret: HashMap<String, Result<String, CustomRedisError>>,
    setex_ret: HashMap<String, Result<(), CustomRedisError>>,
    del_ret: HashMap<String, Result<(), CustomRedisError>>,
    batch_del_ret: Option<Result<(), CustomRedisError>>,
    keys_ret: HashMap<String, Result<Vec<String>, CustomRedisError>>,
    exists_ret: HashMap<String, Result<bool, CustomRedisError>>,
    publish_ret: HashMap<String, Result<u64, CustomRedisError>>,
    subscribe_err: HashMap<String, CustomRedisError>,
    store: Arc<Mutex<HashMap<String, String>>>,
    channels: Arc<Mutex<HashMap<String, Vec<mpsc::Sender<String>>>>>,
    calls: Arc<Mutex<Vec<MockRedisCall>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

impl MockRedisClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_ret(&mut self, key: &str, ret: Result<String, CustomRedisError>) -> Self {
        self.get_ret.insert(key.to_owned(), ret);
        self.clone()
    }

    pub fn setex_ret(&mut self, key: &str, ret: Result<(), CustomRedisError>) -> Self {
        self.setex_ret.insert(key.to_owned(), ret);
        self.clone()
    }

    pub fn del_ret(&mut self, key: &str, ret: Result<(), CustomRedisError>) -> Self {
        self.del_ret.insert(key.to_owned(), ret);
        self.clone()
    }

    pub fn batch_del_ret(&mut self, ret: Result<(), CustomRedisError>) -> Self {
        self.batch_del_ret = Some(ret);
        self.clone()
    }

    pub fn keys_ret(&mut self, pattern: &str, ret: Result<Vec<String>, CustomRedisError>) -> Self {
        self.keys_ret.insert(pattern.to_owned(), ret);
        self.clone()
    }

    pub fn exists_ret(&mut self, key: &str, ret: Result<bool, CustomRedisError>) -> Self {
        self.exists_ret.insert(key.to_owned(), ret);
        self.clone()
    }

    pub fn publish_ret(&mut self, channel: &str, ret: Result<u64, CustomRedisError>) -> Self {
        self.publish_ret.insert(channel.to_owned(), ret);
        self.clone()
    }

    pub fn subscribe_err(&mut self, channel: &str, err: CustomRedisError) -> Self {
        self.subscribe_err.insert(channel.to_owned(), err);
        self.clone()
    }

    pub fn get_calls(&self) -> Vec<MockRedisCall> {
        lock(&self.calls).clone()
    }

    /// Calls recorded for one operation, in order.
    pub fn calls_for(&self, op: &str) -> Vec<MockRedisCall> {
        lock(&self.calls)
            .iter()
            .filter(|call| call.op == op)
            .cloned()
            .collect()
    }

    /// Keys currently held by the in-memory backend.
    pub fn stored_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = lock(&self.store).keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Number of live mock subscriptions on a channel.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        lock(&self.channels)
            .get(channel)
            .map(|senders| senders.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    fn record(&self, op: &str, key: String, value: MockRedisValue) {
        lock(&self.calls).push(MockRedisCall {
            op: op.to_string(),
            key,
            value,
        });
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MockRedisValue {
    None,
    String(String),
    StringWithTTL(String, u64),
    VecString(Vec<String>),
}

#[derive(Debug, Clone)]
pub struct MockRedisCall {
    pub op: String,
    pub key: String,
    pub value: MockRedisValue,
}

#[async_trait]
impl Client for MockRedisClient {
    async fn get(&self, key: String) -> Result<String, CustomRedisError> {
        self.record("get", key.clone(), MockRedisValue::None);

        if let Some(ret) = self.get_ret.get(&key) {
            return ret.clone();
        }
        lock(&self.store)
            .get(&key)
            .cloned()
            .ok_or(CustomRedisError::NotFound)
    }

    async fn setex(&self, key: String, value: String, seconds: u64) -> Result<(), CustomRedisError> {
        self.record(
            "setex",
            key.clone(),
            MockRedisValue::StringWithTTL(value.clone(), seconds),
        );

        if let Some(ret) = self.setex_ret.get(&key) {
            return ret.clone();
        }
        lock(&self.store).insert(key, value);
        Ok(())
    }

    async fn del(&self, key: String) -> Result<(), CustomRedisError> {
        self.record("del", key.clone(), MockRedisValue::None);

        if let Some(ret) = self.del_ret.get(&key) {
            return ret.clone();
        }
        lock(&self.store).remove(&key);
        Ok(())
    }

    async fn batch_del(&self, keys: Vec<String>) -> Result<(), CustomRedisError> {
        self.record(
            "batch_del",
            format!("keys={}", keys.len()),
            MockRedisValue::VecString(keys.clone()),
        );

        if let Some(ret) = &self.batch_del_ret {
            return ret.clone();
        }
        let mut store = lock(&self.store);
        for key in keys {
            store.remove(&key);
        }
        Ok(())
    }

    async fn keys(&self, pattern: String) -> Result<Vec<String>, CustomRedisError> {
        self.record("keys", pattern.clone(), MockRedisValue::None);

        if let Some(ret) = self.keys_ret.get(&pattern) {
            return ret.clone();
        }
        let mut matched: Vec<String> = lock(&self.store)
            .keys()
            .filter(|key| glob_matches(&pattern, key))
            .cloned()
            .collect();
        matched.sort();
        Ok(matched)
    }

    async fn exists(&self, key: String) -> Result<bool, CustomRedisError> {
        self.record("exists", key.clone(), MockRedisValue::None);

        if let Some(ret) = self.exists_ret.get(&key) {
            return ret.clone();
        }
        Ok(lock(&self.store).contains_key(&key))
    }

    async fn publish(&self, channel: String, payload: String) -> Result<u64, CustomRedisError> {
        self.record(
            "publish",
            channel.clone(),
            MockRedisValue::String(payload.clone()),
        );

        if let Some(ret) = self.publish_ret.get(&channel) {
            return ret.clone();
        }

        let mut channels = lock(&self.channels);
        let Some(senders) = channels.get_mut(&channel) else {
            return Ok(0);
        };
        senders.retain(|tx| !tx.is_closed());

        let mut delivered = 0;
        for tx in senders.iter() {
            if tx.try_send(payload.clone()).is_ok() {
                delivered += 1;
            }
        }
        Ok(delivered)
    }

    async fn subscribe(&self, channel: String) -> Result<Subscription, CustomRedisError> {
        self.record("subscribe", channel.clone(), MockRedisValue::None);

        if let Some(err) = self.subscribe_err.get(&channel) {
            return Err(err.clone());
        }

        let (tx, rx) = mpsc::channel(SUBSCRIPTION_BUFFER_SIZE);
        lock(&self.channels)
            .entry(channel.clone())
            .or_default()
            .push(tx);
        Ok(Subscription::new(channel, rx, None))
    }
}
