use common_redis::Client as RedisClientTrait;
use serde::Serialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::events::{
    ChangeEvent, EventEnvelope, EventMetadata, EVENT_VERSION, RAID_CHANNEL, REGISTRATION_CHANNEL,
};
use crate::metrics::{record_dropped, record_published};

/// Fields of the previous raid state carried on `raid.updated`.
const RAID_DIFF_FIELDS: &[&str] = &[
    "title",
    "status",
    "startTime",
    "endTime",
    "maxParticipants",
    "buildId",
];

/// Publishes envelopes stamped with one source name.
///
/// Publishing is best-effort: a failure is logged and counted, and reported as
/// zero receivers, never as an error to the writer.
#[derive(Clone)]
pub struct EventPublisher {
    client: Arc<dyn RedisClientTrait + Send + Sync>,
    source: String,
}

impl EventPublisher {
    pub fn new(client: Arc<dyn RedisClientTrait + Send + Sync>, source: impl Into<String>) -> Self {
        Self {
            client,
            source: source.into(),
        }
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn envelope(&self, event: ChangeEvent) -> EventEnvelope {
        EventEnvelope {
            event,
            metadata: EventMetadata {
                source: self.source.clone(),
                version: EVENT_VERSION.to_string(),
            },
        }
    }

    /// Serialize and send an envelope, returning how many subscribers got it.
    pub async fn publish(&self, channel: &str, envelope: &EventEnvelope) -> u64 {
        let payload = match serde_json::to_string(envelope) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(channel = %channel, error = %e, "Event did not serialize, dropping");
                record_dropped(channel, "serialize");
                return 0;
            }
        };

        match self.client.publish(channel.to_string(), payload).await {
            Ok(receivers) => {
                debug!(
                    channel = %channel,
                    event_type = %envelope.event.event_type,
                    receivers,
                    "Published change event"
                );
                record_published(channel);
                receivers
            }
            Err(e) => {
                warn!(channel = %channel, error = %e, "Failed to publish change event");
                record_dropped(channel, "publish_failed");
                0
            }
        }
    }

    pub async fn publish_event(&self, channel: &str, event: ChangeEvent) -> u64 {
        let envelope = self.envelope(event);
        self.publish(channel, &envelope).await
    }
}

fn to_value<T: Serialize + ?Sized>(value: &T) -> Value {
    match serde_json::to_value(value) {
        Ok(value) => value,
        Err(e) => {
            warn!(error = %e, "Event payload did not serialize, sending null");
            Value::Null
        }
    }
}

fn diff_subset(previous: &Value) -> Value {
    let subset: Map<String, Value> = RAID_DIFF_FIELDS
        .iter()
        .filter_map(|field| {
            previous
                .get(*field)
                .map(|value| (field.to_string(), value.clone()))
        })
        .collect();
    Value::Object(subset)
}

/// `raid.created` / `raid.updated` / `raid.deleted` on [`RAID_CHANNEL`].
#[derive(Clone)]
pub struct RaidEventPublisher {
    publisher: EventPublisher,
}

impl RaidEventPublisher {
    pub fn new(client: Arc<dyn RedisClientTrait + Send + Sync>, source: impl Into<String>) -> Self {
        Self {
            publisher: EventPublisher::new(client, source),
        }
    }

    pub async fn raid_created<R: Serialize + ?Sized>(
        &self,
        raid_id: &str,
        server_id: &str,
        raid: &R,
    ) -> u64 {
        let event = ChangeEvent::new(
            "raid.created",
            raid_id,
            Some(server_id.to_string()),
            json!({ "raid": to_value(raid) }),
        );
        self.publisher.publish_event(RAID_CHANNEL, event).await
    }

    /// Carries the new raid plus the diff-relevant fields of the previous one.
    pub async fn raid_updated<R, P>(
        &self,
        raid_id: &str,
        server_id: &str,
        raid: &R,
        previous: &P,
    ) -> u64
    where
        R: Serialize + ?Sized,
        P: Serialize + ?Sized,
    {
        let event = ChangeEvent::new(
            "raid.updated",
            raid_id,
            Some(server_id.to_string()),
            json!({
                "raid": to_value(raid),
                "previous": diff_subset(&to_value(previous)),
            }),
        );
        self.publisher.publish_event(RAID_CHANNEL, event).await
    }

    pub async fn raid_deleted(&self, raid_id: &str, server_id: &str) -> u64 {
        let event = ChangeEvent::new(
            "raid.deleted",
            raid_id,
            Some(server_id.to_string()),
            json!({ "raidId": raid_id }),
        );
        self.publisher.publish_event(RAID_CHANNEL, event).await
    }
}

/// `registration.*` events on [`REGISTRATION_CHANNEL`], keyed by registration
/// id and carrying the raid they belong to.
#[derive(Clone)]
pub struct RegistrationEventPublisher {
    publisher: EventPublisher,
}

impl RegistrationEventPublisher {
    pub fn new(client: Arc<dyn RedisClientTrait + Send + Sync>, source: impl Into<String>) -> Self {
        Self {
            publisher: EventPublisher::new(client, source),
        }
    }

    pub async fn registration_created<R: Serialize + ?Sized>(
        &self,
        registration_id: &str,
        raid_id: &str,
        server_id: &str,
        registration: &R,
    ) -> u64 {
        self.send(
            "registration.created",
            registration_id,
            server_id,
            json!({ "raidId": raid_id, "registration": to_value(registration) }),
        )
        .await
    }

    pub async fn registration_updated<R: Serialize + ?Sized>(
        &self,
        registration_id: &str,
        raid_id: &str,
        server_id: &str,
        registration: &R,
    ) -> u64 {
        self.send(
            "registration.updated",
            registration_id,
            server_id,
            json!({ "raidId": raid_id, "registration": to_value(registration) }),
        )
        .await
    }

    pub async fn registration_deleted(
        &self,
        registration_id: &str,
        raid_id: &str,
        server_id: &str,
    ) -> u64 {
        self.send(
            "registration.deleted",
            registration_id,
            server_id,
            json!({ "raidId": raid_id }),
        )
        .await
    }

    async fn send(&self, event_type: &str, id: &str, server_id: &str, data: Value) -> u64 {
        let event = ChangeEvent::new(event_type, id, Some(server_id.to_string()), data);
        self.publisher
            .publish_event(REGISTRATION_CHANNEL, event)
            .await
    }
}
