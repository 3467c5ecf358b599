use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use coopledger_core::CorrelationId;

/// Envelope for a message crossing the event-bus boundary.
///
/// This is the unit published to and consumed from the bus.
///
/// Notes:
/// - `id` is the downstream **idempotency/dedup key**: delivery is
///   at-least-once, so consumers must treat a repeated `id` as a no-op.
/// - `schema_version` rides on every message for forward/backward-compatible
///   payload evolution.
/// - `partition_key` is the ordering scope (an account id, a loan id): order
///   is only meaningful within one key, never globally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventEnvelope {
    id: Uuid,
    event_type: String,
    schema_version: u32,
    occurred_at: DateTime<Utc>,
    correlation_id: Option<CorrelationId>,
    partition_key: Option<String>,
    payload: JsonValue,
}

impl EventEnvelope {
    pub fn new(
        id: Uuid,
        event_type: impl Into<String>,
        schema_version: u32,
        occurred_at: DateTime<Utc>,
        correlation_id: Option<CorrelationId>,
        partition_key: Option<String>,
        payload: JsonValue,
    ) -> Self {
        Self {
            id,
            event_type: event_type.into(),
            schema_version,
            occurred_at,
            correlation_id,
            partition_key,
            payload,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn occurred_at(&self) -> DateTime<Utc> {
        self.occurred_at
    }

    pub fn correlation_id(&self) -> Option<CorrelationId> {
        self.correlation_id
    }

    pub fn partition_key(&self) -> Option<&str> {
        self.partition_key.as_deref()
    }

    pub fn payload(&self) -> &JsonValue {
        &self.payload
    }

    pub fn into_payload(self) -> JsonValue {
        self.payload
    }
}
