//! Saga coordinator: loads instances, runs transition tables, persists
//! outcomes, and executes side effects.
//!
//! ## Execution flow per inbound event
//!
//! ```text
//! envelope
//!   -> schema gate (violations quarantined, loop continues)
//!   -> load-or-create the instance for the correlation id
//!   -> terminal or unknown (state, event) pair: idempotent no-op
//!   -> pure transition: (state, context, event) -> (next, context, effects)
//!   -> persist instance + Publish-effect outbox records in one unit,
//!      version-checked (VersionConflict -> caller retries)
//!   -> execute Command/Compensate effects via the injected executor
//! ```
//!
//! Effects run **after** the state is persisted: replaying the same event
//! then hits the already-advanced state and is ignored, which is what keeps
//! duplicate delivery from re-triggering commands. Commands and
//! compensations must themselves be idempotent.

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use coopledger_core::{CorrelationId, DomainError, ExpectedVersion};
use coopledger_events::{EventEnvelope, SchemaGate, SchemaViolation, Topic};
use coopledger_outbox::OutboxRecord;

use crate::instance::{SagaContext, SagaInstance};
use crate::store::{SagaStore, SagaStoreError};
use crate::workflow::{SideEffect, Transition, Workflow, WorkflowState};

/// Executes commands and compensations a workflow emits.
///
/// Implementations wrap the actual targets (the ledger engine, external
/// service clients). Commands must be idempotent: the coordinator may run
/// them again after a crash-and-redeliver.
pub trait CommandExecutor: Send + Sync {
    type Error: std::fmt::Debug;

    fn execute(
        &self,
        correlation_id: CorrelationId,
        target: &str,
        command_type: &str,
        payload: &JsonValue,
    ) -> Result<(), Self::Error>;
}

/// Coordinator operation error.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// Concurrent handling of the same correlation id lost the version
    /// race; reload and retry.
    #[error("version conflict: {0}")]
    VersionConflict(String),

    #[error(transparent)]
    Domain(#[from] DomainError),

    #[error("outbound schema violation: {0}")]
    Schema(#[from] SchemaViolation),

    #[error("saga store error: {0}")]
    Store(SagaStoreError),

    /// A command executor failed after the state was already persisted.
    #[error("command execution failed: {0}")]
    Command(String),
}

impl From<SagaStoreError> for CoordinatorError {
    fn from(value: SagaStoreError) -> Self {
        match value {
            SagaStoreError::VersionConflict { .. } => {
                CoordinatorError::VersionConflict(value.to_string())
            }
            other => CoordinatorError::Store(other),
        }
    }
}

/// Result of handling one inbound event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandleOutcome {
    /// The envelope failed schema validation and was quarantined.
    Quarantined,
    /// No transition for this `(state, event)` pair, or the instance is
    /// already terminal. Idempotent no-op.
    Ignored { state: String },
    /// The instance advanced.
    Advanced {
        state: String,
        terminal: bool,
        effects: usize,
    },
}

/// Point-in-time view of one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct SagaStatus {
    pub correlation_id: CorrelationId,
    pub workflow_type: String,
    pub state: String,
    pub terminal: bool,
    pub version: u64,
    pub deadline: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
    pub context: SagaContext,
}

impl From<&SagaInstance> for SagaStatus {
    fn from(instance: &SagaInstance) -> Self {
        Self {
            correlation_id: instance.correlation_id,
            workflow_type: instance.workflow_type.clone(),
            state: instance.state_name.clone(),
            terminal: instance.terminal,
            version: instance.version,
            deadline: instance.deadline,
            updated_at: instance.updated_at,
            context: instance.context.clone(),
        }
    }
}

/// Per-workflow coordinator.
pub struct SagaCoordinator<W, S, X> {
    store: S,
    gate: Arc<SchemaGate>,
    executor: X,
    _workflow: PhantomData<fn() -> W>,
}

impl<W, S, X> SagaCoordinator<W, S, X>
where
    W: Workflow,
    S: SagaStore,
    X: CommandExecutor,
{
    pub fn new(store: S, gate: Arc<SchemaGate>, executor: X) -> Self {
        Self {
            store,
            gate,
            executor,
            _workflow: PhantomData,
        }
    }

    /// Create an instance in the workflow's initial state.
    ///
    /// Idempotent: starting an already-started workflow returns its current
    /// status without touching it.
    pub fn start(
        &self,
        correlation_id: CorrelationId,
        initial_context: SagaContext,
    ) -> Result<SagaStatus, CoordinatorError> {
        if let Some(existing) = self.store.load(correlation_id)? {
            debug!(
                correlation_id = %correlation_id,
                state = %existing.state_name,
                "workflow already started"
            );
            return Ok(SagaStatus::from(&existing));
        }

        let instance = SagaInstance::start::<W>(correlation_id, initial_context)?;
        self.store
            .upsert(instance.clone(), ExpectedVersion::Exact(0), vec![])?;
        info!(
            correlation_id = %correlation_id,
            workflow = W::workflow_type(),
            "workflow started"
        );
        Ok(SagaStatus::from(&instance))
    }

    /// Feed one inbound event to the instance it correlates to.
    pub fn handle_event(
        &self,
        correlation_id: CorrelationId,
        envelope: EventEnvelope,
    ) -> Result<HandleOutcome, CoordinatorError> {
        let Some(envelope) = self.gate.admit_inbound(envelope) else {
            return Ok(HandleOutcome::Quarantined);
        };

        let instance = match self.store.load(correlation_id)? {
            Some(instance) => instance,
            None => {
                let instance = SagaInstance::start::<W>(correlation_id, SagaContext::new())?;
                self.store
                    .upsert(instance.clone(), ExpectedVersion::Exact(0), vec![])?;
                instance
            }
        };

        if instance.terminal {
            debug!(
                correlation_id = %correlation_id,
                state = %instance.state_name,
                event_type = envelope.event_type(),
                "event for terminal instance ignored"
            );
            return Ok(HandleOutcome::Ignored {
                state: instance.state_name,
            });
        }

        let state = instance.typed_state::<W>()?;
        match W::on_event(&state, &instance.context, &envelope) {
            Transition::Ignore => {
                debug!(
                    correlation_id = %correlation_id,
                    state = %instance.state_name,
                    event_type = envelope.event_type(),
                    "no transition for event, ignored"
                );
                Ok(HandleOutcome::Ignored {
                    state: instance.state_name,
                })
            }
            Transition::Advance {
                next,
                context,
                effects,
            } => self.apply_transition(instance, next, context, effects),
        }
    }

    pub fn status(&self, correlation_id: CorrelationId) -> Result<SagaStatus, CoordinatorError> {
        let instance = self
            .store
            .load(correlation_id)?
            .ok_or(DomainError::NotFound)?;
        Ok(SagaStatus::from(&instance))
    }

    /// Drive every instance past its deadline through its timeout
    /// transition. Returns how many advanced.
    ///
    /// The version check makes each timeout transition fire exactly once
    /// even when sweeps run concurrently: the loser's upsert conflicts and
    /// the instance is skipped.
    pub fn sweep_timeouts(&self, limit: usize) -> Result<usize, CoordinatorError> {
        let due = self.store.due(Utc::now(), limit)?;
        let mut advanced = 0;

        for instance in due {
            let correlation_id = instance.correlation_id;
            let state = instance.typed_state::<W>()?;

            match W::on_timeout(&state, &instance.context) {
                Transition::Ignore => {
                    warn!(
                        correlation_id = %correlation_id,
                        state = %instance.state_name,
                        "workflow ignored its own timeout; instance stays due"
                    );
                }
                Transition::Advance {
                    next,
                    context,
                    effects,
                } => {
                    info!(
                        correlation_id = %correlation_id,
                        from = %instance.state_name,
                        to = next.name(),
                        "deadline elapsed, compensating transition"
                    );
                    match self.apply_transition(instance, next, context, effects) {
                        Ok(_) => advanced += 1,
                        Err(CoordinatorError::VersionConflict(msg)) => {
                            // A concurrent event or sweep won; that is fine.
                            debug!(correlation_id = %correlation_id, %msg, "timeout lost the race");
                        }
                        Err(other) => return Err(other),
                    }
                }
            }
        }

        Ok(advanced)
    }

    /// Purge terminal instances older than the configured retention window.
    ///
    /// Scheduled by operators; like the outbox, nothing expires implicitly.
    pub fn purge_terminal(
        &self,
        retention: &coopledger_outbox::RetentionConfig,
    ) -> Result<usize, CoordinatorError> {
        let window = chrono::Duration::from_std(retention.terminal_sagas).unwrap_or_default();
        let purged = self.store.purge_terminal(window)?;
        if purged > 0 {
            info!(workflow = W::workflow_type(), purged, "terminal instances purged");
        }
        Ok(purged)
    }

    fn apply_transition(
        &self,
        mut instance: SagaInstance,
        next: W::State,
        context: Vec<(String, JsonValue)>,
        effects: Vec<SideEffect>,
    ) -> Result<HandleOutcome, CoordinatorError> {
        let correlation_id = instance.correlation_id;
        let expected = ExpectedVersion::Exact(instance.version);
        instance.advance::<W>(&next, context)?;

        // Publish effects become outbox records in the same atomic unit as
        // the instance update; commands run after the state is durable.
        let mut records = Vec::new();
        let mut commands = Vec::new();
        for effect in effects {
            match effect {
                SideEffect::Publish {
                    event_type,
                    payload,
                } => records.push(self.outbox_record(correlation_id, &event_type, payload)?),
                SideEffect::Command {
                    target,
                    command_type,
                    payload,
                } => commands.push((target, command_type, payload, false)),
                SideEffect::Compensate {
                    target,
                    command_type,
                    payload,
                } => commands.push((target, command_type, payload, true)),
            }
        }

        let effect_count = records.len() + commands.len();
        let state_name = instance.state_name.clone();
        let terminal = instance.terminal;
        self.store.upsert(instance, expected, records)?;

        for (target, command_type, payload, compensating) in commands {
            if compensating {
                info!(
                    correlation_id = %correlation_id,
                    target = %target,
                    command = %command_type,
                    "dispatching compensation"
                );
            }
            self.executor
                .execute(correlation_id, &target, &command_type, &payload)
                .map_err(|e| {
                    error!(
                        correlation_id = %correlation_id,
                        target = %target,
                        command = %command_type,
                        error = ?e,
                        "command execution failed"
                    );
                    CoordinatorError::Command(format!("{target}/{command_type}: {e:?}"))
                })?;
        }

        Ok(HandleOutcome::Advanced {
            state: state_name,
            terminal,
            effects: effect_count,
        })
    }

    fn outbox_record(
        &self,
        correlation_id: CorrelationId,
        event_type: &str,
        payload: JsonValue,
    ) -> Result<OutboxRecord, CoordinatorError> {
        let version = self
            .gate
            .registry()
            .get(event_type)
            .map(|s| s.version)
            .ok_or_else(|| SchemaViolation::UnknownEventType(event_type.to_string()))?;
        self.gate.check_outbound(event_type, version, &payload)?;

        Ok(OutboxRecord::new(
            Topic::new(event_type),
            event_type,
            version,
            payload,
        )
        .with_correlation(correlation_id)
        .with_partition_key(correlation_id.to_string()))
    }
}
