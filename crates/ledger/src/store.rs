//! Ledger storage contract: one atomic commit for the mutation and its
//! outbox record.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;

use coopledger_core::{AccountId, LoanId, TransactionId};
use coopledger_outbox::{OutboxRecord, OutboxStore, OutboxStoreError};

use crate::account::Account;
use crate::schedule::RepaymentSchedule;
use crate::transaction::{LedgerTransaction, TransactionStatus};

/// Everything one ledger operation writes, committed together or not at all.
#[derive(Debug, Clone)]
pub struct LedgerCommit {
    /// Account snapshots to upsert (new or updated).
    pub accounts: Vec<Account>,
    /// Transaction rows to insert.
    pub transactions: Vec<LedgerTransaction>,
    /// Original transaction to flip `Completed -> Reversed`, when this
    /// commit posts a reversing entry.
    pub reverses: Option<TransactionId>,
    /// Repayment schedule to upsert (generated or updated).
    pub schedule: Option<RepaymentSchedule>,
    /// Facts to publish, written in this same atomic unit.
    pub outbox: Vec<OutboxRecord>,
}

impl LedgerCommit {
    pub fn new() -> Self {
        Self {
            accounts: Vec::new(),
            transactions: Vec::new(),
            reverses: None,
            schedule: None,
            outbox: Vec::new(),
        }
    }
}

impl Default for LedgerCommit {
    fn default() -> Self {
        Self::new()
    }
}

/// Ledger store operation error.
#[derive(Debug, Error)]
pub enum LedgerStoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("outbox write failed: {0}")]
    Outbox(#[from] OutboxStoreError),
}

/// Durable relational store backing the ledger.
///
/// `commit` is the single write path and must be atomic: the transaction
/// rows, the account updates, the schedule upsert, and the outbox records
/// land together or none do. A relational backend implements this with one
/// database transaction and row locks; the in-memory twin with one write
/// lock (the "equivalent single-writer transaction").
pub trait LedgerStore: Send + Sync {
    fn account(&self, id: AccountId) -> Result<Option<Account>, LedgerStoreError>;

    fn transaction(&self, id: TransactionId)
    -> Result<Option<LedgerTransaction>, LedgerStoreError>;

    /// Transactions for one account, in commit order.
    fn history(&self, account_id: AccountId) -> Result<Vec<LedgerTransaction>, LedgerStoreError>;

    fn schedule(&self, loan_id: LoanId) -> Result<Option<RepaymentSchedule>, LedgerStoreError>;

    /// Apply one atomic commit.
    fn commit(&self, commit: LedgerCommit) -> Result<(), LedgerStoreError>;
}

impl<S> LedgerStore for Arc<S>
where
    S: LedgerStore + ?Sized,
{
    fn account(&self, id: AccountId) -> Result<Option<Account>, LedgerStoreError> {
        (**self).account(id)
    }

    fn transaction(
        &self,
        id: TransactionId,
    ) -> Result<Option<LedgerTransaction>, LedgerStoreError> {
        (**self).transaction(id)
    }

    fn history(&self, account_id: AccountId) -> Result<Vec<LedgerTransaction>, LedgerStoreError> {
        (**self).history(account_id)
    }

    fn schedule(&self, loan_id: LoanId) -> Result<Option<RepaymentSchedule>, LedgerStoreError> {
        (**self).schedule(loan_id)
    }

    fn commit(&self, commit: LedgerCommit) -> Result<(), LedgerStoreError> {
        (**self).commit(commit)
    }
}

#[derive(Debug, Default)]
struct Inner {
    accounts: HashMap<AccountId, Account>,
    transactions: HashMap<TransactionId, LedgerTransaction>,
    order: Vec<TransactionId>,
    schedules: HashMap<LoanId, RepaymentSchedule>,
}

/// In-memory ledger store for tests/dev, collocated with an outbox store.
///
/// All of `commit` runs under one write lock, so the outbox insert shares
/// the ledger mutation's atomic unit the way a collocated relational store
/// would.
#[derive(Debug)]
pub struct InMemoryLedgerStore<O> {
    inner: RwLock<Inner>,
    outbox: O,
}

impl<O: OutboxStore> InMemoryLedgerStore<O> {
    pub fn new(outbox: O) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            outbox,
        }
    }
}

impl<O: OutboxStore> LedgerStore for InMemoryLedgerStore<O> {
    fn account(&self, id: AccountId) -> Result<Option<Account>, LedgerStoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| LedgerStoreError::Storage("lock poisoned".to_string()))?;
        Ok(inner.accounts.get(&id).cloned())
    }

    fn transaction(
        &self,
        id: TransactionId,
    ) -> Result<Option<LedgerTransaction>, LedgerStoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| LedgerStoreError::Storage("lock poisoned".to_string()))?;
        Ok(inner.transactions.get(&id).cloned())
    }

    fn history(&self, account_id: AccountId) -> Result<Vec<LedgerTransaction>, LedgerStoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| LedgerStoreError::Storage("lock poisoned".to_string()))?;
        Ok(inner
            .order
            .iter()
            .filter_map(|id| inner.transactions.get(id))
            .filter(|t| t.account_id == account_id)
            .cloned()
            .collect())
    }

    fn schedule(&self, loan_id: LoanId) -> Result<Option<RepaymentSchedule>, LedgerStoreError> {
        let inner = self
            .inner
            .read()
            .map_err(|_| LedgerStoreError::Storage("lock poisoned".to_string()))?;
        Ok(inner.schedules.get(&loan_id).cloned())
    }

    fn commit(&self, commit: LedgerCommit) -> Result<(), LedgerStoreError> {
        let mut inner = self
            .inner
            .write()
            .map_err(|_| LedgerStoreError::Storage("lock poisoned".to_string()))?;

        // Validate before any write so a failed commit leaves no trace.
        if let Some(original_id) = commit.reverses {
            let original = inner
                .transactions
                .get(&original_id)
                .ok_or_else(|| LedgerStoreError::NotFound(format!("transaction {original_id}")))?;
            if original.status == TransactionStatus::Reversed {
                return Err(LedgerStoreError::Conflict(format!(
                    "transaction {original_id} is already reversed"
                )));
            }
        }
        for tx in &commit.transactions {
            if inner.transactions.contains_key(&tx.id) {
                return Err(LedgerStoreError::Conflict(format!(
                    "transaction {} already exists",
                    tx.id
                )));
            }
        }

        for account in commit.accounts {
            inner.accounts.insert(account.id(), account);
        }
        for tx in commit.transactions {
            inner.order.push(tx.id);
            inner.transactions.insert(tx.id, tx);
        }
        if let Some(original_id) = commit.reverses {
            if let Some(original) = inner.transactions.get_mut(&original_id) {
                original.status = TransactionStatus::Reversed;
            }
        }
        if let Some(schedule) = commit.schedule {
            inner.schedules.insert(schedule.loan_id, schedule);
        }
        for record in commit.outbox {
            self.outbox.insert(record)?;
        }

        Ok(())
    }
}
