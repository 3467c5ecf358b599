//! The outbox record: a committed fact awaiting publication.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use uuid::Uuid;

use coopledger_core::{CorrelationId, TransactionId};
use coopledger_events::{EventEnvelope, Topic};

use crate::retry::RetryPolicy;

/// Publication state of an outbox record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxState {
    /// Committed, not yet confirmed on the bus.
    Unpublished,
    /// Confirmed on the bus; kept until the retention window elapses.
    Published,
    /// Retries exhausted; parked for operator inspection, never dropped.
    DeadLettered { error: String, attempts: u32 },
}

impl OutboxState {
    pub fn is_published(&self) -> bool {
        matches!(self, OutboxState::Published)
    }

    pub fn is_dead_lettered(&self) -> bool {
        matches!(self, OutboxState::DeadLettered { .. })
    }
}

/// Claim lease held by one relay worker.
///
/// Leases keep two live workers from publishing the same record; the
/// crash-between-publish-and-mark window is covered by downstream dedup on
/// the record id, not by the lease.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub worker: String,
    pub until: DateTime<Utc>,
}

/// A fact to publish, written in the same atomic commit as the mutation that
/// produced it.
///
/// `id` doubles as the downstream idempotency key. `partition_key` scopes
/// ordering (an account id): the relay preserves creation order within one
/// key and promises nothing across keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxRecord {
    pub id: Uuid,
    pub topic: Topic,
    pub event_type: String,
    pub schema_version: u32,
    pub payload: JsonValue,
    pub source_transaction_id: Option<TransactionId>,
    pub correlation_id: Option<CorrelationId>,
    pub partition_key: Option<String>,
    pub state: OutboxState,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub lease: Option<Lease>,
    pub created_at: DateTime<Utc>,
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxRecord {
    pub fn new(
        topic: Topic,
        event_type: impl Into<String>,
        schema_version: u32,
        payload: JsonValue,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            topic,
            event_type: event_type.into(),
            schema_version,
            payload,
            source_transaction_id: None,
            correlation_id: None,
            partition_key: None,
            state: OutboxState::Unpublished,
            attempts: 0,
            last_error: None,
            next_attempt_at: None,
            lease: None,
            created_at: Utc::now(),
            published_at: None,
        }
    }

    pub fn with_source_transaction(mut self, transaction_id: TransactionId) -> Self {
        self.source_transaction_id = Some(transaction_id);
        self
    }

    pub fn with_correlation(mut self, correlation_id: CorrelationId) -> Self {
        self.correlation_id = Some(correlation_id);
        self
    }

    pub fn with_partition_key(mut self, key: impl Into<String>) -> Self {
        self.partition_key = Some(key.into());
        self
    }

    /// Build the bus envelope for this record.
    ///
    /// The record id becomes the envelope id, which is the dedup key
    /// consumers must be idempotent on. The correlation field carries the
    /// workflow correlation when one exists, otherwise the originating
    /// transaction id.
    pub fn to_envelope(&self) -> EventEnvelope {
        let correlation = self.correlation_id.or_else(|| {
            self.source_transaction_id
                .map(|t| CorrelationId::from_uuid(*t.as_uuid()))
        });
        EventEnvelope::new(
            self.id,
            self.event_type.clone(),
            self.schema_version,
            self.created_at,
            correlation,
            self.partition_key.clone(),
            self.payload.clone(),
        )
    }

    /// Whether the record is claimable at `now` (unpublished, past any
    /// backoff window, with no live lease).
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        if self.state != OutboxState::Unpublished {
            return false;
        }
        if let Some(at) = self.next_attempt_at {
            if now < at {
                return false;
            }
        }
        match &self.lease {
            Some(lease) => lease.until <= now,
            None => true,
        }
    }

    /// Mark published. Idempotent: safe to re-run after a crash between
    /// publish and mark; the first `published_at` wins.
    pub fn mark_published(&mut self) {
        if self.state.is_published() {
            return;
        }
        self.state = OutboxState::Published;
        self.published_at = Some(Utc::now());
        self.lease = None;
        self.next_attempt_at = None;
    }

    /// Record a publish failure: schedules the next attempt per `policy`, or
    /// dead-letters once retries are exhausted.
    pub fn register_failure(&mut self, error: impl Into<String>, policy: &RetryPolicy) {
        let error = error.into();
        self.attempts += 1;
        self.last_error = Some(error.clone());
        self.lease = None;

        if policy.should_retry(self.attempts) {
            let delay = policy.delay_for_attempt(self.attempts);
            self.next_attempt_at =
                Some(Utc::now() + ChronoDuration::from_std(delay).unwrap_or_default());
        } else {
            self.state = OutboxState::DeadLettered {
                error,
                attempts: self.attempts,
            };
            self.next_attempt_at = None;
        }
    }
}
