//! Cross-process change notifications.
//!
//! A writer publishes an [`EventEnvelope`] on a per-entity channel; every
//! process subscribed at that moment receives it once. Nothing is queued for
//! absent subscribers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub mod handlers;
pub mod publisher;
pub mod subscriber;

pub use handlers::{InvalidationHandler, LoggingHandler};
pub use publisher::{EventPublisher, RaidEventPublisher, RegistrationEventPublisher};
pub use subscriber::{EventHandler, EventSubscriber, HandlerId};

pub const RAID_CHANNEL: &str = "raid.events";
pub const REGISTRATION_CHANNEL: &str = "registration.events";
pub const EVENT_VERSION: &str = "1.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    pub entity_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Value,
}

impl ChangeEvent {
    pub fn new(
        event_type: impl Into<String>,
        entity_id: impl Into<String>,
        server_id: Option<String>,
        data: Value,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            entity_id: entity_id.into(),
            server_id,
            timestamp: Utc::now(),
            data,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub source: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event: ChangeEvent,
    pub metadata: EventMetadata,
}
