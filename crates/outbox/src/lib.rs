//! Transactional outbox: durable "facts to publish" written in the same
//! atomic unit as the mutation they describe, drained asynchronously to the
//! event bus by a relay worker.

pub mod record;
pub mod relay;
pub mod retention;
pub mod retry;
pub mod store;

pub use record::{Lease, OutboxRecord, OutboxState};
pub use relay::{OutboxRelay, RelayConfig, RelayHandle, RelayStats};
pub use retention::RetentionConfig;
pub use retry::{BackoffStrategy, RetryPolicy};
pub use store::{InMemoryOutboxStore, OutboxStore, OutboxStoreError};
