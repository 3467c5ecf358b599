//! Saga coordination: multi-step workflows driven to completion or
//! compensation by asynchronous events.
//!
//! A workflow is a pure transition table keyed by `(state, event type)`;
//! the coordinator executes the table's side effects, persists instance
//! state with optimistic versioning, and a sweeper drives timed-out
//! instances through their compensating transitions.

pub mod coordinator;
pub mod instance;
pub mod loan;
pub mod store;
pub mod sweeper;
pub mod workflow;


pub use coordinator::{
    CommandExecutor, CoordinatorError, HandleOutcome, SagaCoordinator, SagaStatus,
};
pub use instance::{SagaContext, SagaInstance};
pub use loan::{LoanOriginationState, LoanOriginationWorkflow, loan_event_schemas};
pub use store::{InMemorySagaStore, SagaStore, SagaStoreError};
pub use sweeper::{SweeperConfig, SweeperHandle, TimeoutSweeper};
pub use workflow::{SideEffect, Transition, Workflow, WorkflowState};
