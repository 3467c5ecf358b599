//! Schema gate: versioned payload contracts at the bus boundary.
//!
//! Every outbound payload is checked before it is written to the outbox, and
//! every inbound envelope is checked before the workflow coordinator sees it.
//! Malformed messages are routed to a quarantine area for operator
//! inspection; the relay and coordinator loops are never blocked by them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;

use crate::envelope::EventEnvelope;

/// Registered contract for one event type.
///
/// `version` is the current (highest) accepted schema version; payloads are
/// JSON objects that must carry every field in `required_fields` at the top
/// level. Older versions remain accepted so in-flight messages survive a
/// contract bump.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSchema {
    pub event_type: String,
    pub version: u32,
    pub required_fields: Vec<String>,
}

impl EventSchema {
    pub fn new(
        event_type: impl Into<String>,
        version: u32,
        required_fields: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            version,
            required_fields: required_fields.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchemaViolation {
    #[error("no schema registered for event type '{0}'")]
    UnknownEventType(String),

    #[error("unsupported schema version for '{event_type}': got {got}, current {current}")]
    UnsupportedVersion {
        event_type: String,
        got: u32,
        current: u32,
    },

    #[error("payload for '{event_type}' is not a JSON object")]
    NotAnObject { event_type: String },

    #[error("payload for '{event_type}' is missing required field '{field}'")]
    MissingField { event_type: String, field: String },
}

/// Registry of event-type contracts.
#[derive(Debug, Default, Clone)]
pub struct SchemaRegistry {
    schemas: HashMap<String, EventSchema>,
}

impl SchemaRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, schema: EventSchema) -> &mut Self {
        self.schemas.insert(schema.event_type.clone(), schema);
        self
    }

    pub fn get(&self, event_type: &str) -> Option<&EventSchema> {
        self.schemas.get(event_type)
    }
}

/// A message rejected by the gate, parked for operator inspection.
#[derive(Debug, Clone)]
pub struct QuarantinedMessage {
    pub envelope: EventEnvelope,
    pub violation: SchemaViolation,
    pub quarantined_at: DateTime<Utc>,
}

/// Quarantine area for rejected messages. Never drops; always inspectable.
pub trait Quarantine: Send + Sync {
    fn park(&self, envelope: EventEnvelope, violation: SchemaViolation);

    fn list(&self) -> Vec<QuarantinedMessage>;
}

/// In-memory quarantine for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryQuarantine {
    entries: Mutex<Vec<QuarantinedMessage>>,
}

impl InMemoryQuarantine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }
}

impl Quarantine for InMemoryQuarantine {
    fn park(&self, envelope: EventEnvelope, violation: SchemaViolation) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(QuarantinedMessage {
                envelope,
                violation,
                quarantined_at: Utc::now(),
            });
        }
    }

    fn list(&self) -> Vec<QuarantinedMessage> {
        self.entries.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

/// Validates payloads against the registry on both sides of the boundary.
pub struct SchemaGate {
    registry: SchemaRegistry,
    quarantine: Arc<dyn Quarantine>,
}

impl SchemaGate {
    pub fn new(registry: SchemaRegistry, quarantine: Arc<dyn Quarantine>) -> Self {
        Self {
            registry,
            quarantine,
        }
    }

    pub fn registry(&self) -> &SchemaRegistry {
        &self.registry
    }

    /// Validate an outbound payload before it is written to the outbox.
    ///
    /// A violation here is surfaced to the producing component as an error:
    /// the triggering commit must not proceed with an unpublishable fact.
    pub fn check_outbound(
        &self,
        event_type: &str,
        schema_version: u32,
        payload: &JsonValue,
    ) -> Result<(), SchemaViolation> {
        self.validate(event_type, schema_version, payload)
    }

    /// Admit an inbound envelope, quarantining it on violation.
    ///
    /// Returns `None` for a quarantined message; the caller continues with
    /// the next message rather than failing the loop.
    pub fn admit_inbound(&self, envelope: EventEnvelope) -> Option<EventEnvelope> {
        match self.validate(
            envelope.event_type(),
            envelope.schema_version(),
            envelope.payload(),
        ) {
            Ok(()) => Some(envelope),
            Err(violation) => {
                warn!(
                    event_type = envelope.event_type(),
                    message_id = %envelope.id(),
                    violation = %violation,
                    "inbound message quarantined"
                );
                self.quarantine.park(envelope, violation);
                None
            }
        }
    }

    fn validate(
        &self,
        event_type: &str,
        schema_version: u32,
        payload: &JsonValue,
    ) -> Result<(), SchemaViolation> {
        let schema = self
            .registry
            .get(event_type)
            .ok_or_else(|| SchemaViolation::UnknownEventType(event_type.to_string()))?;

        if schema_version > schema.version || schema_version == 0 {
            return Err(SchemaViolation::UnsupportedVersion {
                event_type: event_type.to_string(),
                got: schema_version,
                current: schema.version,
            });
        }

        let object = payload
            .as_object()
            .ok_or_else(|| SchemaViolation::NotAnObject {
                event_type: event_type.to_string(),
            })?;

        for field in &schema.required_fields {
            if !object.contains_key(field) {
                return Err(SchemaViolation::MissingField {
                    event_type: event_type.to_string(),
                    field: field.clone(),
                });
            }
        }

        Ok(())
    }
}
