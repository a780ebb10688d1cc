use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common_redis::{Client, CustomRedisError, MockRedisClient};
use raid_cache::events::{EventHandler, EventSubscriber, InvalidationHandler, RaidEventPublisher};
use raid_cache::invalidation::{after_update_raid, CacheAttributes};
use raid_cache::{
    keys, with_cache, write_with_invalidation, Cache, CacheExt, EntityAttributes, MemoryCache,
    RedisCache,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Raid {
    id: String,
    server_id: String,
    title: String,
    status: String,
}

impl CacheAttributes for Raid {
    fn cache_attributes(&self) -> EntityAttributes {
        EntityAttributes::with_id(self.id.clone()).server_id(self.server_id.clone())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("source of truth unavailable")]
struct SourceError;

/// A stand-in for the relational store, counting how often it is queried.
struct Source {
    raid: parking_lot::Mutex<Raid>,
    reads: AtomicUsize,
}

impl Source {
    fn new() -> Self {
        Self {
            raid: parking_lot::Mutex::new(Raid {
                id: "R".to_string(),
                server_id: "S".to_string(),
                title: "Weekly clear".to_string(),
                status: "OPEN".to_string(),
            }),
            reads: AtomicUsize::new(0),
        }
    }

    async fn open_raids(&self) -> Result<Vec<Raid>, SourceError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(vec![self.raid.lock().clone()])
    }

    async fn rename(&self, title: &str) -> Result<Raid, SourceError> {
        let mut raid = self.raid.lock();
        raid.title = title.to_string();
        Ok(raid.clone())
    }

    fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

fn redis_cache(mock: &MockRedisClient, prefix: &str) -> RedisCache {
    RedisCache::new(Arc::new(mock.clone()), prefix, Duration::from_secs(300)).unwrap()
}

async fn wait_until_absent(cache: &dyn Cache, key: &str) -> bool {
    for _ in 0..100 {
        if !cache.exists(key).await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

#[tokio::test]
async fn test_raid_update_invalidates_raid_and_server_lists() {
    let mock = MockRedisClient::new();
    let cache = redis_cache(&mock, "raid");
    let source = Source::new();
    let list_key = keys::raids_by_server_status("S", "OPEN");

    let raids = with_cache(|| source.open_raids(), Some(&cache), &list_key, None)
        .await
        .unwrap();
    cache.set(&keys::raid("R"), &raids[0], None).await;
    assert_eq!(source.reads(), 1);

    // Served from cache.
    with_cache(|| source.open_raids(), Some(&cache), &list_key, None)
        .await
        .unwrap();
    assert_eq!(source.reads(), 1);

    let updated = write_with_invalidation(
        || source.rename("Weekly clear (moved)"),
        Some(&cache),
        Some(&after_update_raid()),
    )
    .await
    .unwrap();
    assert_eq!(updated.title, "Weekly clear (moved)");

    assert!(!cache.exists(&keys::raid("R")).await);
    assert!(!cache.exists(&list_key).await);

    let raids = with_cache(|| source.open_raids(), Some(&cache), &list_key, None)
        .await
        .unwrap();
    assert_eq!(source.reads(), 2);
    assert_eq!(raids[0].title, "Weekly clear (moved)");
}

#[tokio::test]
async fn test_prefixed_caches_share_a_backend_safely() {
    let mock = MockRedisClient::new();
    let a = redis_cache(&mock, "a");
    let b = redis_cache(&mock, "b");

    a.set("server:1", &json!({"name": "Alpha"}), None).await;
    b.set("server:1", &json!({"name": "Beta"}), None).await;

    assert_eq!(
        a.get::<serde_json::Value>("server:1").await,
        Some(json!({"name": "Alpha"}))
    );
    assert_eq!(
        mock.stored_keys(),
        vec!["a:server:1".to_string(), "b:server:1".to_string()]
    );
}

#[tokio::test]
async fn test_backend_outage_never_fails_reads_or_writes() {
    let mut mock = MockRedisClient::new();
    let list_key = keys::raids_by_server_status("S", "OPEN");
    let namespaced = format!("raid:{list_key}");
    mock.get_ret(&namespaced, Err(CustomRedisError::Timeout));
    mock.setex_ret(&namespaced, Err(CustomRedisError::Timeout));
    let mock = mock.keys_ret("raid:raids:server:S:*", Err(CustomRedisError::Timeout));
    let cache = redis_cache(&mock, "raid");
    let source = Source::new();

    for expected_reads in 1..=2 {
        let raids = with_cache(|| source.open_raids(), Some(&cache), &list_key, None)
            .await
            .unwrap();
        assert_eq!(raids.len(), 1);
        assert_eq!(source.reads(), expected_reads);
    }

    let updated = write_with_invalidation(
        || source.rename("Still works"),
        Some(&cache),
        Some(&after_update_raid()),
    )
    .await
    .unwrap();
    assert_eq!(updated.title, "Still works");
}

#[tokio::test]
async fn test_no_cache_configured() {
    let source = Source::new();

    for expected_reads in 1..=3 {
        with_cache(|| source.open_raids(), None, "raids:server:S:OPEN", Some(Duration::from_secs(60)))
            .await
            .unwrap();
        assert_eq!(source.reads(), expected_reads);
    }

    let updated = write_with_invalidation(|| source.rename("No cache"), None, Some(&after_update_raid()))
        .await
        .unwrap();
    assert_eq!(updated.title, "No cache");
}

#[tokio::test]
async fn test_change_events_invalidate_other_processes() {
    let backend = MockRedisClient::new();

    // Another process holds its own in-memory cache and listens for events.
    let local = Arc::new(MemoryCache::new());
    local.set(&keys::raid("R"), &json!({"id": "R"}), None).await;
    local
        .set(&keys::raids_by_server_status("S", "OPEN"), &json!([]), None)
        .await;
    local.set(&keys::server("S"), &json!({"id": "S"}), None).await;

    let subscriber = EventSubscriber::new(Arc::new(backend.clone()), "raid.events");
    let handler: Arc<dyn EventHandler> = Arc::new(InvalidationHandler::new(local.clone()));
    subscriber.subscribe(handler).await.unwrap();

    // The writing process publishes after its write.
    let publisher = RaidEventPublisher::new(Arc::new(backend.clone()), "api");
    let receivers = publisher
        .raid_updated(
            "R",
            "S",
            &json!({"id": "R", "title": "New"}),
            &json!({"id": "R", "title": "Old"}),
        )
        .await;
    assert_eq!(receivers, 1);

    assert!(wait_until_absent(local.as_ref(), &keys::raid("R")).await);
    assert!(wait_until_absent(local.as_ref(), &keys::raids_by_server_status("S", "OPEN")).await);
    assert!(local.exists(&keys::server("S")).await);

    subscriber.unsubscribe(None).await;
    assert_eq!(backend.subscriber_count("raid.events"), 0);
}

#[tokio::test]
async fn test_events_are_lost_without_a_subscriber() {
    let backend = MockRedisClient::new();
    let publisher = RaidEventPublisher::new(Arc::new(backend.clone()), "api");

    assert_eq!(publisher.raid_deleted("R", "S").await, 0);

    // A subscriber that connects later does not see the earlier event.
    let mut late = backend.subscribe("raid.events".to_string()).await.unwrap();
    publisher.raid_deleted("R2", "S").await;
    let payload = late.recv().await.unwrap();
    assert!(payload.contains("\"entityId\":\"R2\""));
}
