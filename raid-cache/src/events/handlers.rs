use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info};

use crate::events::{EventEnvelope, EventHandler};
use crate::invalidation::{invalidate, CacheAttributes, EntityAttributes, EntityKind};
use crate::store::Cache;

/// Applies the invalidation catalog to a local cache for every change event
/// published by another process.
///
/// The entity comes from the event type prefix (`raid.updated` is a raid).
/// Attributes are read from the event itself first, then from `data` and from
/// the entity object nested under `data` (e.g. `data.raid`).
pub struct InvalidationHandler {
    cache: Arc<dyn Cache>,
}

impl InvalidationHandler {
    pub fn new(cache: Arc<dyn Cache>) -> Self {
        Self { cache }
    }
}

fn nested_field(kind: EntityKind) -> &'static str {
    match kind {
        EntityKind::ServerMember => "member",
        other => other.as_str(),
    }
}

fn fill(into: &mut EntityAttributes, from: EntityAttributes) {
    into.id = into.id.take().or(from.id);
    into.server_id = into.server_id.take().or(from.server_id);
    into.user_id = into.user_id.take().or(from.user_id);
    into.discord_id = into.discord_id.take().or(from.discord_id);
    into.raid_id = into.raid_id.take().or(from.raid_id);
}

pub fn event_attributes(kind: EntityKind, envelope: &EventEnvelope) -> EntityAttributes {
    let event = &envelope.event;
    let mut attributes = EntityAttributes {
        id: Some(event.entity_id.clone()),
        server_id: event.server_id.clone(),
        ..Default::default()
    };

    if let Value::Object(_) = &event.data {
        fill(&mut attributes, event.data.cache_attributes());
        if let Some(nested) = event.data.get(nested_field(kind)) {
            fill(&mut attributes, nested.cache_attributes());
        }
    }
    attributes
}

#[async_trait]
impl EventHandler for InvalidationHandler {
    fn name(&self) -> &str {
        "invalidation"
    }

    async fn handle(&self, envelope: &EventEnvelope) -> anyhow::Result<()> {
        let Some(kind) = EntityKind::from_event_type(&envelope.event.event_type) else {
            debug!(event_type = %envelope.event.event_type, "No invalidation strategy for event");
            return Ok(());
        };

        let attributes = event_attributes(kind, envelope);
        invalidate(self.cache.as_ref(), kind, &attributes).await;
        Ok(())
    }
}

/// Logs every received event.
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

#[async_trait]
impl EventHandler for LoggingHandler {
    fn name(&self) -> &str {
        "logging"
    }

    async fn handle(&self, envelope: &EventEnvelope) -> anyhow::Result<()> {
        info!(
            event_type = %envelope.event.event_type,
            entity_id = %envelope.event.entity_id,
            server_id = ?envelope.event.server_id,
            source = %envelope.metadata.source,
            "Received change event"
        );
        Ok(())
    }
}
