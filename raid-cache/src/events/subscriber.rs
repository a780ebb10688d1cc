use async_trait::async_trait;
use common_redis::{Client as RedisClientTrait, Subscription};
use futures::FutureExt;
use parking_lot::RwLock;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::error::Result;
use crate::events::EventEnvelope;
use crate::metrics::record_dropped;

#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Shown in logs when the handler fails.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    async fn handle(&self, envelope: &EventEnvelope) -> anyhow::Result<()>;
}

/// Identifies one registered handler for [`EventSubscriber::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

type Handlers = Arc<RwLock<Vec<(HandlerId, Arc<dyn EventHandler>)>>>;
type SharedClient = Arc<dyn RedisClientTrait + Send + Sync>;

const RESUBSCRIBE_BACKOFF: Duration = Duration::from_millis(100);
const MAX_RESUBSCRIBE_BACKOFF: Duration = Duration::from_secs(30);

/// Delivers every envelope on one channel to a list of handlers.
///
/// The channel subscription is opened with the first handler and shared by
/// the rest; it is closed again once no handler remains. A payload that does
/// not parse is dropped. Each handler runs in its own failure boundary: an
/// error or a panic is logged and the remaining handlers still run.
///
/// If the underlying subscription ends (for example the pub/sub connection
/// dropped) the dispatcher resubscribes with exponential backoff. Events
/// published while it is disconnected are lost.
pub struct EventSubscriber {
    client: SharedClient,
    channel: String,
    handlers: Handlers,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

impl EventSubscriber {
    pub fn new(client: SharedClient, channel: impl Into<String>) -> Self {
        Self {
            client,
            channel: channel.into(),
            handlers: Arc::new(RwLock::new(Vec::new())),
            dispatcher: Mutex::new(None),
            next_id: AtomicU64::new(0),
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.read().len()
    }

    pub async fn is_subscribed(&self) -> bool {
        self.dispatcher
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }

    /// Register a handler, opening the channel subscription if this is the
    /// first one.
    ///
    /// # Errors
    /// Fails if the channel subscription cannot be opened; the handler is not
    /// registered in that case.
    pub async fn subscribe(&self, handler: Arc<dyn EventHandler>) -> Result<HandlerId> {
        let mut dispatcher = self.dispatcher.lock().await;

        if dispatcher.as_ref().is_some_and(|task| task.is_finished()) {
            warn!(channel = %self.channel, "Event dispatcher stopped, resubscribing");
            *dispatcher = None;
        }

        if dispatcher.is_none() {
            let subscription = self.client.subscribe(self.channel.clone()).await?;
            info!(channel = %self.channel, "Subscribed to change events");
            *dispatcher = Some(tokio::spawn(dispatch(
                self.client.clone(),
                subscription,
                self.handlers.clone(),
            )));
        }

        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers.write().push((id, handler));
        Ok(id)
    }

    /// Remove one handler, or all of them with `None`. Removing the last
    /// handler closes the channel subscription. Returns whether anything was
    /// removed.
    pub async fn unsubscribe(&self, id: Option<HandlerId>) -> bool {
        let mut dispatcher = self.dispatcher.lock().await;

        let (removed, now_empty) = {
            let mut handlers = self.handlers.write();
            let before = handlers.len();
            match id {
                Some(id) => handlers.retain(|(existing, _)| *existing != id),
                None => handlers.clear(),
            }
            (handlers.len() < before, handlers.is_empty())
        };

        if now_empty {
            if let Some(task) = dispatcher.take() {
                task.abort();
                if let Err(e) = task.await {
                    if !e.is_cancelled() {
                        warn!(channel = %self.channel, error = %e, "Event dispatcher ended abnormally");
                    }
                }
                info!(channel = %self.channel, "Unsubscribed from change events");
            }
        }

        removed
    }
}

impl Drop for EventSubscriber {
    fn drop(&mut self) {
        if let Some(task) = self.dispatcher.get_mut().take() {
            task.abort();
        }
    }
}

async fn dispatch(client: SharedClient, mut subscription: Subscription, handlers: Handlers) {
    let channel = subscription.channel().to_string();

    loop {
        while let Some(payload) = subscription.recv().await {
            deliver(&channel, &payload, &handlers).await;
        }

        warn!(channel = %channel, "Change event subscription closed, resubscribing");
        subscription = resubscribe(client.as_ref(), &channel).await;
        info!(channel = %channel, "Resubscribed to change events");
    }
}

async fn resubscribe(client: &(dyn RedisClientTrait + Send + Sync), channel: &str) -> Subscription {
    let mut backoff = RESUBSCRIBE_BACKOFF;
    loop {
        tokio::time::sleep(backoff).await;
        match client.subscribe(channel.to_string()).await {
            Ok(subscription) => return subscription,
            Err(e) => {
                backoff = (backoff * 2).min(MAX_RESUBSCRIBE_BACKOFF);
                warn!(
                    channel = %channel,
                    error = %e,
                    retry_in = ?backoff,
                    "Failed to resubscribe to change events"
                );
            }
        }
    }
}

async fn deliver(channel: &str, payload: &str, handlers: &Handlers) {
    let envelope: EventEnvelope = match serde_json::from_str(payload) {
        Ok(envelope) => envelope,
        Err(e) => {
            warn!(channel = %channel, error = %e, "Dropping unparseable change event");
            record_dropped(channel, "parse_error");
            return;
        }
    };

    let snapshot: Vec<(HandlerId, Arc<dyn EventHandler>)> = handlers.read().clone();
    for (id, handler) in snapshot {
        match AssertUnwindSafe(handler.handle(&envelope))
            .catch_unwind()
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!(
                    channel = %channel,
                    handler = %handler.name(),
                    handler_id = %id,
                    event_type = %envelope.event.event_type,
                    error = %e,
                    "Event handler failed"
                );
                record_dropped(channel, "handler_error");
            }
            Err(_) => {
                error!(
                    channel = %channel,
                    handler = %handler.name(),
                    handler_id = %id,
                    event_type = %envelope.event.event_type,
                    "Event handler panicked"
                );
                record_dropped(channel, "handler_panic");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{ChangeEvent, EventPublisher, RAID_CHANNEL};
    use common_redis::{CustomRedisError, MockRedisClient};
    use serde_json::Value;
    use std::collections::VecDeque;
    use tokio::sync::mpsc;

    enum Outage {
        /// Hand out a subscription whose stream has already ended.
        Closed,
        Fail,
    }

    /// Plays back scripted subscribe outages, then behaves like the mock.
    struct Flaky {
        inner: MockRedisClient,
        outages: parking_lot::Mutex<VecDeque<Outage>>,
        subscribes: AtomicU64,
    }

    impl Flaky {
        fn new(inner: MockRedisClient, outages: Vec<Outage>) -> Self {
            Self {
                inner,
                outages: parking_lot::Mutex::new(outages.into()),
                subscribes: AtomicU64::new(0),
            }
        }

        fn subscribes(&self) -> u64 {
            self.subscribes.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RedisClientTrait for Flaky {
        async fn get(&self, k: String) -> std::result::Result<String, CustomRedisError> {
            self.inner.get(k).await
        }

        async fn setex(&self, k: String, v: String, seconds: u64) -> std::result::Result<(), CustomRedisError> {
            self.inner.setex(k, v, seconds).await
        }

        async fn del(&self, k: String) -> std::result::Result<(), CustomRedisError> {
            self.inner.del(k).await
        }

        async fn batch_del(&self, keys: Vec<String>) -> std::result::Result<(), CustomRedisError> {
            self.inner.batch_del(keys).await
        }

        async fn keys(&self, pattern: String) -> std::result::Result<Vec<String>, CustomRedisError> {
            self.inner.keys(pattern).await
        }

        async fn exists(&self, k: String) -> std::result::Result<bool, CustomRedisError> {
            self.inner.exists(k).await
        }

        async fn publish(&self, channel: String, payload: String) -> std::result::Result<u64, CustomRedisError> {
            self.inner.publish(channel, payload).await
        }

        async fn subscribe(&self, channel: String) -> std::result::Result<Subscription, CustomRedisError> {
            self.subscribes.fetch_add(1, Ordering::SeqCst);
            let outage = self.outages.lock().pop_front();
            match outage {
                Some(Outage::Closed) => {
                    let (tx, rx) = mpsc::channel(1);
                    drop(tx);
                    Ok(Subscription::new(channel, rx, None))
                }
                Some(Outage::Fail) => Err(CustomRedisError::Timeout),
                None => self.inner.subscribe(channel).await,
            }
        }
    }

    struct Forward(mpsc::UnboundedSender<String>);

    #[async_trait]
    impl EventHandler for Forward {
        async fn handle(&self, envelope: &EventEnvelope) -> anyhow::Result<()> {
            self.0.send(envelope.event.entity_id.clone())?;
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl EventHandler for Failing {
        async fn handle(&self, _: &EventEnvelope) -> anyhow::Result<()> {
            anyhow::bail!("handler failed")
        }
    }

    struct Panicking;

    #[async_trait]
    impl EventHandler for Panicking {
        async fn handle(&self, _: &EventEnvelope) -> anyhow::Result<()> {
            panic!("handler panicked")
        }
    }

    fn forwarder() -> (Arc<dyn EventHandler>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(Forward(tx)), rx)
    }

    async fn publish(mock: &MockRedisClient, entity_id: &str) {
        let publisher = EventPublisher::new(Arc::new(mock.clone()), "test");
        let event = ChangeEvent::new("raid.updated", entity_id, Some("S".to_string()), Value::Null);
        publisher.publish_event(RAID_CHANNEL, event).await;
    }

    async fn next(rx: &mut mpsc::UnboundedReceiver<String>) -> Option<String> {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .ok()
            .flatten()
    }

    #[tokio::test]
    async fn test_handlers_share_one_subscription() {
        let mock = MockRedisClient::new();
        let subscriber = EventSubscriber::new(Arc::new(mock.clone()), RAID_CHANNEL);
        let (first, mut first_rx) = forwarder();
        let (second, mut second_rx) = forwarder();

        subscriber.subscribe(first).await.unwrap();
        subscriber.subscribe(second).await.unwrap();
        assert_eq!(mock.calls_for("subscribe").len(), 1);
        assert_eq!(subscriber.handler_count(), 2);

        publish(&mock, "R").await;
        assert_eq!(next(&mut first_rx).await.as_deref(), Some("R"));
        assert_eq!(next(&mut second_rx).await.as_deref(), Some("R"));
    }

    #[tokio::test]
    async fn test_failing_handlers_do_not_block_others() {
        let mock = MockRedisClient::new();
        let subscriber = EventSubscriber::new(Arc::new(mock.clone()), RAID_CHANNEL);
        let (forward, mut rx) = forwarder();

        subscriber.subscribe(Arc::new(Failing)).await.unwrap();
        subscriber.subscribe(Arc::new(Panicking)).await.unwrap();
        subscriber.subscribe(forward).await.unwrap();

        publish(&mock, "R1").await;
        publish(&mock, "R2").await;

        assert_eq!(next(&mut rx).await.as_deref(), Some("R1"));
        assert_eq!(next(&mut rx).await.as_deref(), Some("R2"));
    }

    #[tokio::test]
    async fn test_unparseable_payloads_are_dropped() {
        let mock = MockRedisClient::new();
        let subscriber = EventSubscriber::new(Arc::new(mock.clone()), RAID_CHANNEL);
        let (forward, mut rx) = forwarder();
        subscriber.subscribe(forward).await.unwrap();

        mock.publish(RAID_CHANNEL.to_string(), "{not json".to_string())
            .await
            .unwrap();
        publish(&mock, "R").await;

        assert_eq!(next(&mut rx).await.as_deref(), Some("R"));
    }

    #[tokio::test]
    async fn test_removing_one_handler_keeps_the_others() {
        let mock = MockRedisClient::new();
        let subscriber = EventSubscriber::new(Arc::new(mock.clone()), RAID_CHANNEL);
        let (first, mut first_rx) = forwarder();
        let (second, mut second_rx) = forwarder();

        let first_id = subscriber.subscribe(first).await.unwrap();
        subscriber.subscribe(second).await.unwrap();
        assert!(subscriber.unsubscribe(Some(first_id)).await);
        assert!(!subscriber.unsubscribe(Some(first_id)).await);
        assert!(subscriber.is_subscribed().await);

        publish(&mock, "R").await;
        assert_eq!(next(&mut second_rx).await.as_deref(), Some("R"));
        assert_eq!(first_rx.try_recv().ok(), None);
    }

    #[tokio::test]
    async fn test_unsubscribe_all_tears_down() {
        let mock = MockRedisClient::new();
        let subscriber = EventSubscriber::new(Arc::new(mock.clone()), RAID_CHANNEL);
        let (forward, _rx) = forwarder();
        subscriber.subscribe(forward).await.unwrap();
        assert_eq!(mock.subscriber_count(RAID_CHANNEL), 1);

        assert!(subscriber.unsubscribe(None).await);

        assert!(!subscriber.is_subscribed().await);
        assert_eq!(subscriber.handler_count(), 0);
        assert_eq!(mock.subscriber_count(RAID_CHANNEL), 0);

        // Subscribing again opens a fresh channel subscription.
        let (forward, mut rx) = forwarder();
        subscriber.subscribe(forward).await.unwrap();
        assert_eq!(mock.calls_for("subscribe").len(), 2);
        publish(&mock, "R").await;
        assert_eq!(next(&mut rx).await.as_deref(), Some("R"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_closed_subscription_is_reopened() {
        let mock = MockRedisClient::new();
        let client = Arc::new(Flaky::new(mock.clone(), vec![Outage::Closed]));
        let subscriber = EventSubscriber::new(client.clone(), RAID_CHANNEL);
        let (forward, mut rx) = forwarder();

        subscriber.subscribe(forward).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(client.subscribes(), 2);
        assert!(subscriber.is_subscribed().await);
        assert_eq!(mock.subscriber_count(RAID_CHANNEL), 1);

        publish(&mock, "R").await;
        assert_eq!(next(&mut rx).await.as_deref(), Some("R"));

        // Later handlers share the reopened subscription.
        let (second, _second_rx) = forwarder();
        subscriber.subscribe(second).await.unwrap();
        assert_eq!(client.subscribes(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_resubscribe_retries_with_backoff() {
        let mock = MockRedisClient::new();
        let client = Arc::new(Flaky::new(
            mock.clone(),
            vec![Outage::Closed, Outage::Fail, Outage::Fail],
        ));
        let subscriber = EventSubscriber::new(client.clone(), RAID_CHANNEL);
        let (forward, mut rx) = forwarder();
        subscriber.subscribe(forward).await.unwrap();

        // Attempts at 100ms and 300ms fail, the one at 700ms succeeds.
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(client.subscribes(), 2);
        tokio::time::sleep(Duration::from_millis(750)).await;
        assert_eq!(client.subscribes(), 4);

        publish(&mock, "R").await;
        assert_eq!(next(&mut rx).await.as_deref(), Some("R"));
    }

    #[tokio::test]
    async fn test_subscribe_failure_registers_nothing() {
        let mut mock = MockRedisClient::new();
        let mock = mock.subscribe_err(RAID_CHANNEL, CustomRedisError::Timeout);
        let subscriber = EventSubscriber::new(Arc::new(mock), RAID_CHANNEL);
        let (forward, _rx) = forwarder();

        assert!(subscriber.subscribe(forward).await.is_err());
        assert_eq!(subscriber.handler_count(), 0);
        assert!(!subscriber.is_subscribed().await);
    }
}
