//! Event bus boundary: topics, envelopes, the injected bus abstraction, and
//! the schema gate guarding what crosses it.

pub mod bus;
pub mod envelope;
pub mod in_memory_bus;
pub mod schema;
pub mod topic;

pub use bus::{EventBus, Subscription};
pub use envelope::EventEnvelope;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use schema::{
    EventSchema, InMemoryQuarantine, Quarantine, QuarantinedMessage, SchemaGate, SchemaRegistry,
    SchemaViolation,
};
pub use topic::Topic;
