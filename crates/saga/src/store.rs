//! Saga instance persistence with optimistic versioning.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use thiserror::Error;

use coopledger_core::{CorrelationId, ExpectedVersion};
use coopledger_outbox::{OutboxRecord, OutboxStore, OutboxStoreError};

use crate::instance::SagaInstance;

/// Saga store operation error.
#[derive(Debug, Error)]
pub enum SagaStoreError {
    /// Another writer advanced the instance first; reload and retry.
    #[error("version conflict for {correlation_id}: expected {expected:?}, found {actual}")]
    VersionConflict {
        correlation_id: CorrelationId,
        expected: ExpectedVersion,
        actual: u64,
    },

    #[error("saga instance not found: {0}")]
    NotFound(CorrelationId),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("outbox write failed: {0}")]
    Outbox(#[from] OutboxStoreError),
}

/// Durable store for workflow instances.
///
/// `upsert` is version-checked (optimistic): concurrent handling of the same
/// correlation id serializes through the check, and the loser gets a
/// `VersionConflict` to retry. Outbox records passed to `upsert` share the
/// instance update's atomic unit, the same way the ledger commit carries its
/// own records.
pub trait SagaStore: Send + Sync {
    fn load(&self, correlation_id: CorrelationId)
    -> Result<Option<SagaInstance>, SagaStoreError>;

    /// Write the instance, expecting the stored version to match (a missing
    /// instance counts as version 0), inserting `outbox` in the same unit.
    fn upsert(
        &self,
        instance: SagaInstance,
        expected: ExpectedVersion,
        outbox: Vec<OutboxRecord>,
    ) -> Result<(), SagaStoreError>;

    /// Non-terminal instances whose deadline has elapsed, oldest deadline
    /// first.
    fn due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<SagaInstance>, SagaStoreError>;

    /// Delete terminal instances whose last update is older than
    /// `retention`. Returns the number purged.
    fn purge_terminal(&self, retention: ChronoDuration) -> Result<usize, SagaStoreError>;
}

impl<S> SagaStore for Arc<S>
where
    S: SagaStore + ?Sized,
{
    fn load(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<Option<SagaInstance>, SagaStoreError> {
        (**self).load(correlation_id)
    }

    fn upsert(
        &self,
        instance: SagaInstance,
        expected: ExpectedVersion,
        outbox: Vec<OutboxRecord>,
    ) -> Result<(), SagaStoreError> {
        (**self).upsert(instance, expected, outbox)
    }

    fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<SagaInstance>, SagaStoreError> {
        (**self).due(now, limit)
    }

    fn purge_terminal(&self, retention: ChronoDuration) -> Result<usize, SagaStoreError> {
        (**self).purge_terminal(retention)
    }
}

/// In-memory saga store for tests/dev, collocated with an outbox store.
#[derive(Debug)]
pub struct InMemorySagaStore<O> {
    instances: RwLock<HashMap<CorrelationId, SagaInstance>>,
    outbox: O,
}

impl<O: OutboxStore> InMemorySagaStore<O> {
    pub fn new(outbox: O) -> Self {
        Self {
            instances: RwLock::new(HashMap::new()),
            outbox,
        }
    }
}

impl<O: OutboxStore> SagaStore for InMemorySagaStore<O> {
    fn load(
        &self,
        correlation_id: CorrelationId,
    ) -> Result<Option<SagaInstance>, SagaStoreError> {
        let instances = self
            .instances
            .read()
            .map_err(|_| SagaStoreError::Storage("lock poisoned".to_string()))?;
        Ok(instances.get(&correlation_id).cloned())
    }

    fn upsert(
        &self,
        instance: SagaInstance,
        expected: ExpectedVersion,
        outbox: Vec<OutboxRecord>,
    ) -> Result<(), SagaStoreError> {
        let mut instances = self
            .instances
            .write()
            .map_err(|_| SagaStoreError::Storage("lock poisoned".to_string()))?;

        let actual = instances
            .get(&instance.correlation_id)
            .map(|i| i.version)
            .unwrap_or(0);
        if !expected.matches(actual) {
            return Err(SagaStoreError::VersionConflict {
                correlation_id: instance.correlation_id,
                expected,
                actual,
            });
        }

        instances.insert(instance.correlation_id, instance);
        for record in outbox {
            self.outbox.insert(record)?;
        }
        Ok(())
    }

    fn due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<SagaInstance>, SagaStoreError> {
        let instances = self
            .instances
            .read()
            .map_err(|_| SagaStoreError::Storage("lock poisoned".to_string()))?;
        let mut result: Vec<SagaInstance> = instances
            .values()
            .filter(|i| i.is_due(now))
            .cloned()
            .collect();
        result.sort_by_key(|i| i.deadline);
        result.truncate(limit);
        Ok(result)
    }

    fn purge_terminal(&self, retention: ChronoDuration) -> Result<usize, SagaStoreError> {
        let mut instances = self
            .instances
            .write()
            .map_err(|_| SagaStoreError::Storage("lock poisoned".to_string()))?;
        let cutoff = Utc::now() - retention;
        let before = instances.len();
        instances.retain(|_, i| !(i.terminal && i.updated_at < cutoff));
        Ok(before - instances.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coopledger_outbox::InMemoryOutboxStore;

    use crate::instance::SagaContext;
    use crate::loan::LoanOriginationWorkflow;

    fn store() -> InMemorySagaStore<Arc<InMemoryOutboxStore>> {
        InMemorySagaStore::new(InMemoryOutboxStore::arc())
    }

    fn instance() -> SagaInstance {
        SagaInstance::start::<LoanOriginationWorkflow>(CorrelationId::new(), SagaContext::new())
            .unwrap()
    }

    #[test]
    fn create_expects_version_zero() {
        let store = store();
        let inst = instance();

        store
            .upsert(inst.clone(), ExpectedVersion::Exact(0), vec![])
            .unwrap();

        // Creating again with the same expectation conflicts.
        let err = store
            .upsert(inst.clone(), ExpectedVersion::Exact(0), vec![])
            .unwrap_err();
        assert!(matches!(err, SagaStoreError::VersionConflict { actual: 1, .. }));

        let loaded = store.load(inst.correlation_id).unwrap().unwrap();
        assert_eq!(loaded.version, 1);
    }

    #[test]
    fn stale_update_is_rejected() {
        let store = store();
        let inst = instance();
        store
            .upsert(inst.clone(), ExpectedVersion::Exact(0), vec![])
            .unwrap();

        let mut fresh = inst.clone();
        fresh.version = 2;
        store
            .upsert(fresh, ExpectedVersion::Exact(1), vec![])
            .unwrap();

        // A writer still holding version 1 loses.
        let mut stale = inst;
        stale.version = 2;
        assert!(matches!(
            store.upsert(stale, ExpectedVersion::Exact(1), vec![]),
            Err(SagaStoreError::VersionConflict { actual: 2, .. })
        ));
    }

    #[test]
    fn due_returns_only_expired_non_terminal_instances() {
        let store = store();
        let now = Utc::now();

        let mut expired = instance();
        expired.deadline = Some(now - ChronoDuration::minutes(5));
        let fresh = instance(); // deadline in the future
        let mut terminal = instance();
        terminal.terminal = true;
        terminal.deadline = None;

        store
            .upsert(expired.clone(), ExpectedVersion::Exact(0), vec![])
            .unwrap();
        store
            .upsert(fresh.clone(), ExpectedVersion::Exact(0), vec![])
            .unwrap();
        store
            .upsert(terminal, ExpectedVersion::Exact(0), vec![])
            .unwrap();

        let due = store.due(now, 10).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].correlation_id, expired.correlation_id);
    }

    #[test]
    fn purge_removes_only_old_terminal_instances() {
        let store = store();
        let mut terminal = instance();
        terminal.terminal = true;
        let live = instance();

        store
            .upsert(terminal, ExpectedVersion::Exact(0), vec![])
            .unwrap();
        store
            .upsert(live.clone(), ExpectedVersion::Exact(0), vec![])
            .unwrap();

        // Negative retention puts the cutoff in the future.
        assert_eq!(store.purge_terminal(ChronoDuration::seconds(-1)).unwrap(), 1);
        assert!(store.load(live.correlation_id).unwrap().is_some());
    }
}
