//! Workflow mechanics (framework only, no business rules).
//!
//! - Explicit state machines per workflow type
//! - Event-driven transitions expressed as a pure dispatch function
//! - Compensating actions expressed as commands
//! - Side effects returned to the caller, never executed here
//!
//! The transition function is deliberately pure: `(state, context, event) ->
//! Transition`. The coordinator owns persistence and effect execution, which
//! keeps every state machine testable without a live bus or store.

use std::time::Duration;

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value as JsonValue;

use coopledger_events::EventEnvelope;

use crate::instance::SagaContext;

/// Side effects a transition asks the coordinator to execute.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SideEffect {
    /// Emit an event through the outbox path (atomic with the state update).
    Publish {
        event_type: String,
        payload: JsonValue,
    },
    /// Dispatch a command to a target component (e.g. the ledger engine).
    Command {
        target: String,
        command_type: String,
        payload: JsonValue,
    },
    /// Dispatch a compensating command to undo prior side effects.
    /// Compensations must be idempotent: they can be delivered again.
    Compensate {
        target: String,
        command_type: String,
        payload: JsonValue,
    },
}

impl SideEffect {
    pub fn publish(event_type: impl Into<String>, payload: JsonValue) -> Self {
        Self::Publish {
            event_type: event_type.into(),
            payload,
        }
    }

    pub fn command(
        target: impl Into<String>,
        command_type: impl Into<String>,
        payload: JsonValue,
    ) -> Self {
        Self::Command {
            target: target.into(),
            command_type: command_type.into(),
            payload,
        }
    }

    pub fn compensate(
        target: impl Into<String>,
        command_type: impl Into<String>,
        payload: JsonValue,
    ) -> Self {
        Self::Compensate {
            target: target.into(),
            command_type: command_type.into(),
            payload,
        }
    }
}

/// Outcome of feeding one event (or a timeout) to a transition table.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition<S> {
    /// Unknown `(state, event)` pair: logged and ignored, not an error.
    /// This is what makes replays and out-of-order delivery harmless.
    Ignore,
    /// Advance to `next`, merging `context` facts and handing `effects`
    /// to the coordinator.
    Advance {
        next: S,
        context: Vec<(String, JsonValue)>,
        effects: Vec<SideEffect>,
    },
}

impl<S> Transition<S> {
    pub fn advance(next: S) -> Self {
        Self::Advance {
            next,
            context: Vec::new(),
            effects: Vec::new(),
        }
    }

    pub fn with_context(mut self, key: impl Into<String>, value: JsonValue) -> Self {
        if let Self::Advance { context, .. } = &mut self {
            context.push((key.into(), value));
        }
        self
    }

    pub fn with_effect(mut self, effect: SideEffect) -> Self {
        if let Self::Advance { effects, .. } = &mut self {
            effects.push(effect);
        }
        self
    }
}

/// Typed workflow state: a stable name plus terminality.
pub trait WorkflowState {
    /// Stable state name (persisted, logged, returned from status queries).
    fn name(&self) -> &'static str;

    /// Terminal states are final: no further transitions are accepted.
    fn is_terminal(&self) -> bool;
}

/// A workflow definition.
///
/// Implementors provide the typed state machine and the pure dispatch
/// functions; the coordinator does everything stateful.
pub trait Workflow: Send + Sync + 'static {
    /// Typed state (serde, for persistence in the saga store).
    type State: WorkflowState
        + Clone
        + Default
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static;

    /// Stable workflow type identifier (e.g. "loan.origination").
    fn workflow_type() -> &'static str;

    fn initial_state() -> Self::State {
        Self::State::default()
    }

    /// How long an instance may sit in `state` before the timeout sweep
    /// drives it to a compensating transition. `None` disables the deadline
    /// (terminal states never have one).
    fn deadline(state: &Self::State) -> Option<Duration>;

    /// React to an inbound event. Pure: no IO, no clock access.
    fn on_event(
        state: &Self::State,
        context: &SagaContext,
        event: &EventEnvelope,
    ) -> Transition<Self::State>;

    /// React to an elapsed deadline. Pure. The only transition source not
    /// triggered by an inbound event.
    fn on_timeout(state: &Self::State, context: &SagaContext) -> Transition<Self::State>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    enum Toy {
        #[default]
        Start,
        Done,
    }

    impl WorkflowState for Toy {
        fn name(&self) -> &'static str {
            match self {
                Toy::Start => "start",
                Toy::Done => "done",
            }
        }

        fn is_terminal(&self) -> bool {
            matches!(self, Toy::Done)
        }
    }

    #[test]
    fn builder_accumulates_context_and_effects() {
        let t = Transition::advance(Toy::Done)
            .with_context("score", serde_json::json!(700))
            .with_effect(SideEffect::publish("toy.done", serde_json::json!({})));

        match t {
            Transition::Advance {
                next,
                context,
                effects,
            } => {
                assert_eq!(next, Toy::Done);
                assert!(next.is_terminal());
                assert_eq!(context.len(), 1);
                assert_eq!(effects.len(), 1);
            }
            Transition::Ignore => panic!("expected advance"),
        }
    }
}
