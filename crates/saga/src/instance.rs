//! Persistent state of one workflow instance.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use coopledger_core::{CorrelationId, DomainError, DomainResult};

use crate::workflow::{Workflow, WorkflowState};

/// Facts gathered along the way (string key -> JSON value).
pub type SagaContext = BTreeMap<String, JsonValue>;

/// One workflow instance, keyed by correlation id.
///
/// `version` backs optimistic concurrency: the coordinator serializes
/// handling per correlation id by requiring the stored version on every
/// update. `terminal` instances accept no further transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SagaInstance {
    pub correlation_id: CorrelationId,
    pub workflow_type: String,
    /// Serialized typed state (authoritative for transitions).
    pub state: JsonValue,
    /// Stable state name (for status queries and logs).
    pub state_name: String,
    pub context: SagaContext,
    pub version: u64,
    pub terminal: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// When the timeout sweep may intervene; `None` for terminal states.
    pub deadline: Option<DateTime<Utc>>,
}

impl SagaInstance {
    /// Create a fresh instance in the workflow's initial state.
    pub fn start<W: Workflow>(
        correlation_id: CorrelationId,
        initial_context: SagaContext,
    ) -> DomainResult<Self> {
        let state = W::initial_state();
        let now = Utc::now();
        Ok(Self {
            correlation_id,
            workflow_type: W::workflow_type().to_string(),
            state: encode_state(&state)?,
            state_name: state.name().to_string(),
            context: initial_context,
            version: 1,
            terminal: state.is_terminal(),
            created_at: now,
            updated_at: now,
            deadline: deadline_from::<W>(&state, now),
        })
    }

    /// Deserialize the typed state.
    pub fn typed_state<W: Workflow>(&self) -> DomainResult<W::State> {
        serde_json::from_value(self.state.clone()).map_err(|e| {
            DomainError::validation(format!(
                "corrupt state for workflow {}: {e}",
                self.workflow_type
            ))
        })
    }

    /// Apply an accepted transition: new state, merged context, bumped
    /// version, refreshed deadline.
    pub fn advance<W: Workflow>(
        &mut self,
        next: &W::State,
        context: Vec<(String, JsonValue)>,
    ) -> DomainResult<()> {
        let now = Utc::now();
        self.state = encode_state(next)?;
        self.state_name = next.name().to_string();
        self.terminal = next.is_terminal();
        for (key, value) in context {
            self.context.insert(key, value);
        }
        self.version += 1;
        self.updated_at = now;
        self.deadline = deadline_from::<W>(next, now);
        Ok(())
    }

    /// Whether the timeout sweep should pick this instance up at `now`.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        !self.terminal && self.deadline.is_some_and(|d| d <= now)
    }
}

fn encode_state<S: Serialize>(state: &S) -> DomainResult<JsonValue> {
    serde_json::to_value(state)
        .map_err(|e| DomainError::validation(format!("state serialization failed: {e}")))
}

fn deadline_from<W: Workflow>(state: &W::State, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    if state.is_terminal() {
        return None;
    }
    W::deadline(state).map(|d| now + ChronoDuration::from_std(d).unwrap_or_default())
}
