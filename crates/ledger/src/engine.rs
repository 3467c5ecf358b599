//! Ledger engine: the synchronous API for posting financial facts.
//!
//! Every mutation follows one pipeline:
//!
//! ```text
//! validate input
//!   -> serialize on the account (per-account lock)
//!   -> load current state
//!   -> apply the balance change (pure, invariant-checked)
//!   -> build the transaction row and its outbox payload
//!   -> schema-gate the payload
//!   -> commit everything in one atomic store write
//! ```
//!
//! The engine never retries internally: a rejected posting returns a typed
//! error and the caller decides whether to re-submit. Concurrent postings to
//! the same account queue on its lock (serialized, never lost); postings to
//! different accounts proceed independently. In production deployments the
//! store's row locks are the authoritative serialization point; the lock map
//! here is the in-process equivalent.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use coopledger_core::{
    AccountId, CorrelationId, Currency, DomainError, LoanId, MemberId, Money, TransactionId,
};
use coopledger_events::{EventSchema, SchemaGate, SchemaViolation, Topic};
use coopledger_outbox::OutboxRecord;

use crate::account::Account;
use crate::schedule::RepaymentSchedule;
use crate::store::{LedgerCommit, LedgerStore, LedgerStoreError};
use crate::transaction::{LedgerTransaction, TransactionKind, TransactionStatus};

pub const ACCOUNT_OPENED: &str = "member.account.opened";
pub const REVERSAL_POSTED: &str = "transaction.reversal.posted";
pub const HOLD_PLACED: &str = "transaction.hold.placed";
pub const HOLD_RELEASED: &str = "transaction.hold.released";
pub const LOAN_DISBURSED: &str = "loan.disbursed";
pub const REPAYMENT_RECEIVED: &str = "loan.repayment.received";

const SCHEMA_VERSION: u32 = 1;

/// Schemas for every event type the ledger engine emits.
pub fn ledger_event_schemas() -> Vec<EventSchema> {
    let posting_fields = [
        "transaction_id",
        "account_id",
        "kind",
        "amount",
        "currency",
        "running_balance",
    ];
    let mut schemas: Vec<EventSchema> = [
        TransactionKind::Deposit,
        TransactionKind::Withdrawal,
        TransactionKind::TransferIn,
        TransactionKind::TransferOut,
        TransactionKind::Fee,
        TransactionKind::Interest,
    ]
    .iter()
    .map(|kind| EventSchema::new(kind.event_type(), SCHEMA_VERSION, posting_fields))
    .collect();

    schemas.push(EventSchema::new(
        ACCOUNT_OPENED,
        SCHEMA_VERSION,
        ["account_id", "member_id", "currency"],
    ));
    schemas.push(EventSchema::new(
        REVERSAL_POSTED,
        SCHEMA_VERSION,
        ["transaction_id", "account_id", "reversal_of", "amount", "currency"],
    ));
    schemas.push(EventSchema::new(
        HOLD_PLACED,
        SCHEMA_VERSION,
        ["account_id", "amount", "currency"],
    ));
    schemas.push(EventSchema::new(
        HOLD_RELEASED,
        SCHEMA_VERSION,
        ["account_id", "amount", "currency"],
    ));
    schemas.push(EventSchema::new(
        LOAN_DISBURSED,
        SCHEMA_VERSION,
        ["loan_id", "account_id", "principal", "currency", "installments"],
    ));
    schemas.push(EventSchema::new(
        REPAYMENT_RECEIVED,
        SCHEMA_VERSION,
        ["loan_id", "installment", "amount", "currency"],
    ));
    schemas
}

/// Typed failure of a ledger operation.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Domain(#[from] DomainError),

    /// Outbound payload rejected by the schema gate; nothing was committed.
    #[error("schema violation: {0}")]
    Schema(#[from] SchemaViolation),

    #[error("store error: {0}")]
    Store(#[from] LedgerStoreError),
}

/// Result of a committed posting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostedTransaction {
    pub transaction_id: TransactionId,
    pub account_id: AccountId,
    pub current_balance: Decimal,
    pub available_balance: Decimal,
}

/// Receipt for a committed transfer: the paired entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferReceipt {
    pub transfer_group: Uuid,
    pub debit: PostedTransaction,
    pub credit: PostedTransaction,
}

/// Caller-supplied posting context.
#[derive(Debug, Clone, Default)]
pub struct TransactionMetadata {
    pub description: Option<String>,
    pub correlation_id: Option<CorrelationId>,
    /// Effective date; defaults to the posting time.
    pub value_date: Option<DateTime<Utc>>,
}

impl TransactionMetadata {
    pub fn described(description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            ..Default::default()
        }
    }

    pub fn correlated(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            ..Default::default()
        }
    }
}

/// The only writer of financial truth.
pub struct LedgerEngine<S> {
    store: S,
    gate: Arc<SchemaGate>,
    locks: Mutex<HashMap<AccountId, Arc<Mutex<()>>>>,
}

impl<S: LedgerStore> LedgerEngine<S> {
    pub fn new(store: S, gate: Arc<SchemaGate>) -> Self {
        Self {
            store,
            gate,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Open an account for a member and emit `member.account.opened`.
    pub fn open_account(
        &self,
        member_id: MemberId,
        currency: Currency,
    ) -> Result<Account, LedgerError> {
        let account = Account::open(member_id, currency);

        let payload = serde_json::json!({
            "account_id": account.id(),
            "member_id": member_id,
            "currency": currency,
        });
        let record = self.outbox_record(
            ACCOUNT_OPENED,
            payload,
            account.id().to_string(),
            None,
            None,
        )?;

        let mut commit = LedgerCommit::new();
        commit.accounts.push(account.clone());
        commit.outbox.push(record);
        self.store.commit(commit)?;

        info!(account_id = %account.id(), member_id = %member_id, "account opened");
        Ok(account)
    }

    /// Post a single-account transaction.
    ///
    /// `amount` must be positive; the account must be active; debits require
    /// `available_balance >= amount` or the call fails with
    /// `InsufficientFunds` (no partial debit). Transfers bind a pair of
    /// entries and go through [`LedgerEngine::transfer`] instead.
    pub fn post_transaction(
        &self,
        account_id: AccountId,
        kind: TransactionKind,
        amount: Money,
        metadata: TransactionMetadata,
    ) -> Result<PostedTransaction, LedgerError> {
        if matches!(kind, TransactionKind::TransferIn | TransactionKind::TransferOut) {
            return Err(DomainError::validation(
                "transfers commit as a pair; use transfer()",
            )
            .into());
        }
        self.ensure_positive(amount)?;

        let lock = self.account_lock(account_id)?;
        let _guard = lock
            .lock()
            .map_err(|_| LedgerStoreError::Storage("account lock poisoned".to_string()))?;

        let mut account = self.load_account(account_id)?;
        account.ensure_active()?;
        account.ensure_currency(amount)?;

        if kind.is_credit() {
            account.credit(amount.amount())?;
        } else {
            account.debit(amount.amount())?;
        }

        let tx = LedgerTransaction::completed(
            account_id,
            kind,
            amount,
            account.current_balance(),
            metadata.value_date.unwrap_or_else(Utc::now),
            metadata.description.clone(),
        );
        let record = self.posting_record(&tx, metadata.correlation_id)?;

        let mut commit = LedgerCommit::new();
        commit.accounts.push(account.clone());
        commit.transactions.push(tx.clone());
        commit.outbox.push(record);
        self.store.commit(commit)?;

        info!(
            transaction_id = %tx.id,
            account_id = %account_id,
            kind = ?kind,
            amount = %amount,
            "transaction posted"
        );
        Ok(Self::receipt(&tx, &account))
    }

    /// Move funds between two accounts as a balanced debit/credit pair.
    pub fn transfer(
        &self,
        from: AccountId,
        to: AccountId,
        amount: Money,
        metadata: TransactionMetadata,
    ) -> Result<TransferReceipt, LedgerError> {
        if from == to {
            return Err(
                DomainError::validation("cannot transfer an account to itself").into(),
            );
        }
        self.ensure_positive(amount)?;

        // Lock in id order so two opposite transfers cannot deadlock.
        let (first, second) = if from.as_uuid() <= to.as_uuid() {
            (from, to)
        } else {
            (to, from)
        };
        let first_lock = self.account_lock(first)?;
        let second_lock = self.account_lock(second)?;
        let _first_guard = first_lock
            .lock()
            .map_err(|_| LedgerStoreError::Storage("account lock poisoned".to_string()))?;
        let _second_guard = second_lock
            .lock()
            .map_err(|_| LedgerStoreError::Storage("account lock poisoned".to_string()))?;

        let mut source = self.load_account(from)?;
        let mut destination = self.load_account(to)?;
        source.ensure_active()?;
        destination.ensure_active()?;
        source.ensure_currency(amount)?;
        destination.ensure_currency(amount)?;

        source.debit(amount.amount())?;
        destination.credit(amount.amount())?;

        let group = Uuid::now_v7();
        let value_date = metadata.value_date.unwrap_or_else(Utc::now);
        let debit = LedgerTransaction::completed(
            from,
            TransactionKind::TransferOut,
            amount,
            source.current_balance(),
            value_date,
            metadata.description.clone(),
        )
        .with_transfer_group(group);
        let credit = LedgerTransaction::completed(
            to,
            TransactionKind::TransferIn,
            amount,
            destination.current_balance(),
            value_date,
            metadata.description.clone(),
        )
        .with_transfer_group(group);

        let debit_record = self.posting_record(&debit, metadata.correlation_id)?;
        let credit_record = self.posting_record(&credit, metadata.correlation_id)?;

        let mut commit = LedgerCommit::new();
        commit.accounts.push(source.clone());
        commit.accounts.push(destination.clone());
        commit.transactions.push(debit.clone());
        commit.transactions.push(credit.clone());
        commit.outbox.push(debit_record);
        commit.outbox.push(credit_record);
        self.store.commit(commit)?;

        info!(
            transfer_group = %group,
            from = %from,
            to = %to,
            amount = %amount,
            "transfer posted"
        );
        Ok(TransferReceipt {
            transfer_group: group,
            debit: Self::receipt(&debit, &source),
            credit: Self::receipt(&credit, &destination),
        })
    }

    /// Post a reversing entry for a completed transaction.
    ///
    /// The original row is never edited: a new entry with the inverted sign
    /// references it, and the original's status flips to `Reversed` inside
    /// the same commit. A second reversal fails with `AlreadyReversed`.
    pub fn reverse_transaction(
        &self,
        transaction_id: TransactionId,
    ) -> Result<PostedTransaction, LedgerError> {
        let original = self
            .store
            .transaction(transaction_id)?
            .ok_or(DomainError::NotFound)?;

        let lock = self.account_lock(original.account_id)?;
        let _guard = lock
            .lock()
            .map_err(|_| LedgerStoreError::Storage("account lock poisoned".to_string()))?;

        // Re-read under the lock: a concurrent reversal may have won.
        let original = self
            .store
            .transaction(transaction_id)?
            .ok_or(DomainError::NotFound)?;
        match original.status {
            TransactionStatus::Completed => {}
            TransactionStatus::Reversed => return Err(DomainError::AlreadyReversed.into()),
            _ => {
                return Err(DomainError::validation(
                    "only completed transactions can be reversed",
                )
                .into());
            }
        }

        let mut account = self.load_account(original.account_id)?;
        account.ensure_active()?;

        // A reversal credits the account iff the original debited it.
        if original.kind.is_credit() {
            account.debit(original.amount.amount())?;
        } else {
            account.credit(original.amount.amount())?;
        }

        let reversal = LedgerTransaction::completed(
            original.account_id,
            original.kind,
            original.amount,
            account.current_balance(),
            Utc::now(),
            Some(format!("reversal of {}", original.id)),
        )
        .with_reversal_of(original.id);

        let payload = serde_json::json!({
            "transaction_id": reversal.id,
            "account_id": reversal.account_id,
            "reversal_of": original.id,
            "amount": reversal.amount.amount(),
            "currency": reversal.amount.currency(),
            "running_balance": reversal.running_balance,
        });
        let record = self.outbox_record(
            REVERSAL_POSTED,
            payload,
            reversal.account_id.to_string(),
            None,
            Some(reversal.id),
        )?;

        let mut commit = LedgerCommit::new();
        commit.accounts.push(account.clone());
        commit.transactions.push(reversal.clone());
        commit.reverses = Some(original.id);
        commit.outbox.push(record);
        self.store.commit(commit)?;

        info!(
            transaction_id = %reversal.id,
            reversal_of = %original.id,
            "reversal posted"
        );
        Ok(Self::receipt(&reversal, &account))
    }

    /// Earmark funds on an account (reduces the available balance only).
    pub fn place_hold(&self, account_id: AccountId, amount: Money) -> Result<(), LedgerError> {
        self.hold_operation(account_id, amount, HOLD_PLACED, Account::place_hold)
    }

    /// Release an earmark placed by [`LedgerEngine::place_hold`].
    pub fn release_hold(&self, account_id: AccountId, amount: Money) -> Result<(), LedgerError> {
        self.hold_operation(account_id, amount, HOLD_RELEASED, Account::release_hold)
    }

    /// Disburse a loan: deposit the principal, generate the repayment
    /// schedule, and emit `loan.disbursed` in one atomic commit.
    pub fn disburse_loan(
        &self,
        loan_id: LoanId,
        account_id: AccountId,
        principal: Money,
        annual_rate: Decimal,
        term_months: u32,
        first_due: NaiveDate,
        metadata: TransactionMetadata,
    ) -> Result<PostedTransaction, LedgerError> {
        self.ensure_positive(principal)?;

        let lock = self.account_lock(account_id)?;
        let _guard = lock
            .lock()
            .map_err(|_| LedgerStoreError::Storage("account lock poisoned".to_string()))?;

        // Checked under the lock so a concurrent disbursement for the same
        // loan cannot regenerate the schedule.
        if self.store.schedule(loan_id)?.is_some() {
            return Err(DomainError::conflict(format!(
                "loan {loan_id} already has a repayment schedule"
            ))
            .into());
        }

        let mut account = self.load_account(account_id)?;
        account.ensure_active()?;
        account.ensure_currency(principal)?;

        let schedule = RepaymentSchedule::amortize(
            loan_id,
            principal.amount(),
            principal.currency(),
            annual_rate,
            term_months,
            first_due,
        )?;

        account.credit(principal.amount())?;
        let tx = LedgerTransaction::completed(
            account_id,
            TransactionKind::Deposit,
            principal,
            account.current_balance(),
            metadata.value_date.unwrap_or_else(Utc::now),
            Some(
                metadata
                    .description
                    .clone()
                    .unwrap_or_else(|| format!("loan {loan_id} disbursement")),
            ),
        );

        let deposit_record = self.posting_record(&tx, metadata.correlation_id)?;
        let loan_payload = serde_json::json!({
            "loan_id": loan_id,
            "account_id": account_id,
            "principal": principal.amount(),
            "currency": principal.currency(),
            "installments": schedule.installments.len(),
        });
        let loan_record = self.outbox_record(
            LOAN_DISBURSED,
            loan_payload,
            loan_id.to_string(),
            metadata.correlation_id,
            Some(tx.id),
        )?;

        let mut commit = LedgerCommit::new();
        commit.accounts.push(account.clone());
        commit.transactions.push(tx.clone());
        commit.schedule = Some(schedule);
        commit.outbox.push(deposit_record);
        commit.outbox.push(loan_record);
        self.store.commit(commit)?;

        info!(loan_id = %loan_id, account_id = %account_id, principal = %principal, "loan disbursed");
        Ok(Self::receipt(&tx, &account))
    }

    /// Post a repayment against one installment: debits the account and
    /// updates the schedule entry in the same commit.
    pub fn post_repayment(
        &self,
        loan_id: LoanId,
        installment: u32,
        account_id: AccountId,
        amount: Money,
        metadata: TransactionMetadata,
    ) -> Result<PostedTransaction, LedgerError> {
        self.ensure_positive(amount)?;

        let lock = self.account_lock(account_id)?;
        let _guard = lock
            .lock()
            .map_err(|_| LedgerStoreError::Storage("account lock poisoned".to_string()))?;

        let mut schedule = self.store.schedule(loan_id)?.ok_or(DomainError::NotFound)?;
        let mut account = self.load_account(account_id)?;
        account.ensure_active()?;
        account.ensure_currency(amount)?;

        schedule.post_payment(installment, amount.amount())?;
        account.debit(amount.amount())?;

        let tx = LedgerTransaction::completed(
            account_id,
            TransactionKind::Withdrawal,
            amount,
            account.current_balance(),
            metadata.value_date.unwrap_or_else(Utc::now),
            Some(format!("loan {loan_id} repayment, installment {installment}")),
        );
        let posting_record = self.posting_record(&tx, metadata.correlation_id)?;
        let repayment_payload = serde_json::json!({
            "loan_id": loan_id,
            "installment": installment,
            "amount": amount.amount(),
            "currency": amount.currency(),
        });
        let repayment_record = self.outbox_record(
            REPAYMENT_RECEIVED,
            repayment_payload,
            loan_id.to_string(),
            metadata.correlation_id,
            Some(tx.id),
        )?;

        let mut commit = LedgerCommit::new();
        commit.accounts.push(account.clone());
        commit.transactions.push(tx.clone());
        commit.schedule = Some(schedule);
        commit.outbox.push(posting_record);
        commit.outbox.push(repayment_record);
        self.store.commit(commit)?;

        Ok(Self::receipt(&tx, &account))
    }

    pub fn account(&self, id: AccountId) -> Result<Account, LedgerError> {
        Ok(self.store.account(id)?.ok_or(DomainError::NotFound)?)
    }

    pub fn history(&self, account_id: AccountId) -> Result<Vec<LedgerTransaction>, LedgerError> {
        Ok(self.store.history(account_id)?)
    }

    pub fn schedule(&self, loan_id: LoanId) -> Result<RepaymentSchedule, LedgerError> {
        Ok(self.store.schedule(loan_id)?.ok_or(DomainError::NotFound)?)
    }

    fn hold_operation(
        &self,
        account_id: AccountId,
        amount: Money,
        event_type: &'static str,
        apply: fn(&mut Account, Decimal) -> coopledger_core::DomainResult<()>,
    ) -> Result<(), LedgerError> {
        self.ensure_positive(amount)?;

        let lock = self.account_lock(account_id)?;
        let _guard = lock
            .lock()
            .map_err(|_| LedgerStoreError::Storage("account lock poisoned".to_string()))?;

        let mut account = self.load_account(account_id)?;
        account.ensure_active()?;
        account.ensure_currency(amount)?;
        apply(&mut account, amount.amount())?;

        let payload = serde_json::json!({
            "account_id": account_id,
            "amount": amount.amount(),
            "currency": amount.currency(),
        });
        let record =
            self.outbox_record(event_type, payload, account_id.to_string(), None, None)?;

        let mut commit = LedgerCommit::new();
        commit.accounts.push(account);
        commit.outbox.push(record);
        self.store.commit(commit)?;
        Ok(())
    }

    fn ensure_positive(&self, amount: Money) -> Result<(), LedgerError> {
        if !amount.is_positive() {
            return Err(DomainError::validation("amount must be positive").into());
        }
        Ok(())
    }

    fn load_account(&self, id: AccountId) -> Result<Account, LedgerError> {
        Ok(self.store.account(id)?.ok_or(DomainError::NotFound)?)
    }

    fn posting_record(
        &self,
        tx: &LedgerTransaction,
        correlation_id: Option<CorrelationId>,
    ) -> Result<OutboxRecord, LedgerError> {
        let payload = serde_json::json!({
            "transaction_id": tx.id,
            "account_id": tx.account_id,
            "kind": tx.kind,
            "amount": tx.amount.amount(),
            "currency": tx.amount.currency(),
            "running_balance": tx.running_balance,
            "occurred_at": tx.transaction_date,
        });
        self.outbox_record(
            tx.kind.event_type(),
            payload,
            tx.account_id.to_string(),
            correlation_id,
            Some(tx.id),
        )
    }

    fn outbox_record(
        &self,
        event_type: &'static str,
        payload: JsonValue,
        partition_key: String,
        correlation_id: Option<CorrelationId>,
        source_transaction: Option<TransactionId>,
    ) -> Result<OutboxRecord, LedgerError> {
        self.gate
            .check_outbound(event_type, SCHEMA_VERSION, &payload)?;

        let mut record = OutboxRecord::new(
            Topic::new(event_type),
            event_type,
            SCHEMA_VERSION,
            payload,
        )
        .with_partition_key(partition_key);
        if let Some(correlation_id) = correlation_id {
            record = record.with_correlation(correlation_id);
        }
        if let Some(transaction_id) = source_transaction {
            record = record.with_source_transaction(transaction_id);
        }
        Ok(record)
    }

    fn account_lock(&self, id: AccountId) -> Result<Arc<Mutex<()>>, LedgerError> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|_| LedgerStoreError::Storage("lock table poisoned".to_string()))?;
        Ok(locks.entry(id).or_default().clone())
    }

    fn receipt(tx: &LedgerTransaction, account: &Account) -> PostedTransaction {
        PostedTransaction {
            transaction_id: tx.id,
            account_id: tx.account_id,
            current_balance: account.current_balance(),
            available_balance: account.available_balance(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rust_decimal_macros::dec;

    use coopledger_events::{InMemoryQuarantine, SchemaRegistry};
    use coopledger_outbox::{InMemoryOutboxStore, OutboxStore};

    use crate::store::InMemoryLedgerStore;

    type TestEngine = LedgerEngine<Arc<InMemoryLedgerStore<Arc<InMemoryOutboxStore>>>>;

    fn gate() -> Arc<SchemaGate> {
        let mut registry = SchemaRegistry::new();
        for schema in ledger_event_schemas() {
            registry.register(schema);
        }
        Arc::new(SchemaGate::new(registry, InMemoryQuarantine::arc()))
    }

    fn engine() -> (TestEngine, Arc<InMemoryOutboxStore>) {
        let outbox = InMemoryOutboxStore::arc();
        let store = Arc::new(InMemoryLedgerStore::new(outbox.clone()));
        (LedgerEngine::new(store, gate()), outbox)
    }

    fn kes(amount: Decimal) -> Money {
        Money::new(amount, Currency::Kes)
    }

    fn funded_account(engine: &TestEngine, amount: Decimal) -> Account {
        let account = engine
            .open_account(MemberId::new(), Currency::Kes)
            .unwrap();
        if amount > dec!(0) {
            engine
                .post_transaction(
                    account.id(),
                    TransactionKind::Deposit,
                    kes(amount),
                    TransactionMetadata::default(),
                )
                .unwrap();
        }
        account
    }

    #[test]
    fn deposit_updates_balances_and_writes_outbox() {
        let (engine, outbox) = engine();
        let account = engine.open_account(MemberId::new(), Currency::Kes).unwrap();

        let posted = engine
            .post_transaction(
                account.id(),
                TransactionKind::Deposit,
                kes(dec!(250)),
                TransactionMetadata::described("initial savings"),
            )
            .unwrap();

        assert_eq!(posted.current_balance, dec!(250));
        assert_eq!(posted.available_balance, dec!(250));

        // account.opened + deposit.completed
        assert_eq!(outbox.unpublished_count().unwrap(), 2);
        let history = engine.history(account.id()).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].running_balance, dec!(250));
    }

    #[test]
    fn withdrawal_beyond_available_is_typed_and_writes_nothing() {
        let (engine, outbox) = engine();
        let account = funded_account(&engine, dec!(100));
        let before = outbox.unpublished_count().unwrap();

        let err = engine
            .post_transaction(
                account.id(),
                TransactionKind::Withdrawal,
                kes(dec!(150)),
                TransactionMetadata::default(),
            )
            .unwrap_err();

        assert!(matches!(
            err,
            LedgerError::Domain(DomainError::InsufficientFunds { .. })
        ));
        assert_eq!(engine.account(account.id()).unwrap().current_balance(), dec!(100));
        assert_eq!(outbox.unpublished_count().unwrap(), before);
        assert_eq!(engine.history(account.id()).unwrap().len(), 1);
    }

    #[test]
    fn posting_requires_active_account_and_positive_amount() {
        let (engine, _) = engine();
        let account = engine.open_account(MemberId::new(), Currency::Kes).unwrap();

        assert!(matches!(
            engine.post_transaction(
                account.id(),
                TransactionKind::Deposit,
                kes(dec!(0)),
                TransactionMetadata::default()
            ),
            Err(LedgerError::Domain(DomainError::Validation(_)))
        ));

        assert!(matches!(
            engine.post_transaction(
                AccountId::new(),
                TransactionKind::Deposit,
                kes(dec!(10)),
                TransactionMetadata::default()
            ),
            Err(LedgerError::Domain(DomainError::NotFound))
        ));
    }

    #[test]
    fn transfer_commits_balanced_pair_atomically() {
        let (engine, _) = engine();
        let from = funded_account(&engine, dec!(300));
        let to = funded_account(&engine, dec!(0));

        let receipt = engine
            .transfer(from.id(), to.id(), kes(dec!(120)), TransactionMetadata::default())
            .unwrap();

        assert_eq!(receipt.debit.current_balance, dec!(180));
        assert_eq!(receipt.credit.current_balance, dec!(120));

        let from_history = engine.history(from.id()).unwrap();
        let to_history = engine.history(to.id()).unwrap();
        let out = from_history.last().unwrap();
        let inn = to_history.last().unwrap();
        assert_eq!(out.transfer_group, inn.transfer_group);
        assert_eq!(out.signed_amount() + inn.signed_amount(), dec!(0));
    }

    #[test]
    fn failed_transfer_leaves_both_accounts_untouched() {
        let (engine, _) = engine();
        let from = funded_account(&engine, dec!(50));
        let to = funded_account(&engine, dec!(0));

        let err = engine
            .transfer(from.id(), to.id(), kes(dec!(80)), TransactionMetadata::default())
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::Domain(DomainError::InsufficientFunds { .. })
        ));

        assert_eq!(engine.account(from.id()).unwrap().current_balance(), dec!(50));
        assert_eq!(engine.account(to.id()).unwrap().current_balance(), dec!(0));
    }

    #[test]
    fn reversal_restores_balance_and_rejects_a_second_attempt() {
        let (engine, _) = engine();
        let account = funded_account(&engine, dec!(0));
        let posted = engine
            .post_transaction(
                account.id(),
                TransactionKind::Deposit,
                kes(dec!(90)),
                TransactionMetadata::default(),
            )
            .unwrap();

        let reversal = engine.reverse_transaction(posted.transaction_id).unwrap();
        assert_eq!(reversal.current_balance, dec!(0));

        let original = engine
            .store()
            .transaction(posted.transaction_id)
            .unwrap()
            .unwrap();
        assert_eq!(original.status, TransactionStatus::Reversed);
        // Original amount untouched; the correction is its own row.
        assert_eq!(original.amount, kes(dec!(90)));

        assert!(matches!(
            engine.reverse_transaction(posted.transaction_id),
            Err(LedgerError::Domain(DomainError::AlreadyReversed))
        ));
    }

    #[test]
    fn reversing_a_deposit_requires_the_funds_to_still_be_there() {
        let (engine, _) = engine();
        let account = funded_account(&engine, dec!(0));
        let posted = engine
            .post_transaction(
                account.id(),
                TransactionKind::Deposit,
                kes(dec!(100)),
                TransactionMetadata::default(),
            )
            .unwrap();
        engine
            .post_transaction(
                account.id(),
                TransactionKind::Withdrawal,
                kes(dec!(60)),
                TransactionMetadata::default(),
            )
            .unwrap();

        assert!(matches!(
            engine.reverse_transaction(posted.transaction_id),
            Err(LedgerError::Domain(DomainError::InsufficientFunds { .. }))
        ));
    }

    #[test]
    fn concurrent_deposits_serialize_without_lost_updates() {
        let (engine, _) = engine();
        let engine = Arc::new(engine);
        let account = engine.open_account(MemberId::new(), Currency::Kes).unwrap();

        let mut handles = Vec::new();
        for amount in [dec!(100), dec!(50)] {
            let engine = engine.clone();
            let account_id = account.id();
            handles.push(std::thread::spawn(move || {
                engine
                    .post_transaction(
                        account_id,
                        TransactionKind::Deposit,
                        kes(amount),
                        TransactionMetadata::default(),
                    )
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(engine.account(account.id()).unwrap().current_balance(), dec!(150));
    }

    #[test]
    fn disbursement_creates_schedule_and_loan_event() {
        let (engine, outbox) = engine();
        let account = funded_account(&engine, dec!(0));
        let loan_id = LoanId::new();

        let posted = engine
            .disburse_loan(
                loan_id,
                account.id(),
                kes(dec!(12000)),
                dec!(0.12),
                12,
                NaiveDate::from_ymd_opt(2026, 9, 1).unwrap(),
                TransactionMetadata::default(),
            )
            .unwrap();

        assert_eq!(posted.current_balance, dec!(12000));
        let schedule = engine.schedule(loan_id).unwrap();
        assert_eq!(schedule.installments.len(), 12);

        // A second disbursement for the same loan must not regenerate it.
        assert!(matches!(
            engine.disburse_loan(
                loan_id,
                account.id(),
                kes(dec!(12000)),
                dec!(0.12),
                12,
                NaiveDate::from_ymd_opt(2026, 9, 1).unwrap(),
                TransactionMetadata::default(),
            ),
            Err(LedgerError::Domain(DomainError::Conflict(_)))
        ));

        let batch = outbox
            .claim_batch("test", 100, chrono::Duration::seconds(30))
            .unwrap();
        assert!(batch.iter().any(|r| r.event_type == LOAN_DISBURSED));
    }

    #[test]
    fn repayment_debits_account_and_updates_installment() {
        let (engine, _) = engine();
        let account = funded_account(&engine, dec!(0));
        let loan_id = LoanId::new();
        engine
            .disburse_loan(
                loan_id,
                account.id(),
                kes(dec!(1200)),
                dec!(0),
                12,
                NaiveDate::from_ymd_opt(2026, 9, 1).unwrap(),
                TransactionMetadata::default(),
            )
            .unwrap();

        let posted = engine
            .post_repayment(loan_id, 1, account.id(), kes(dec!(100)), TransactionMetadata::default())
            .unwrap();
        assert_eq!(posted.current_balance, dec!(1100));

        let schedule = engine.schedule(loan_id).unwrap();
        let first = schedule.installment(1).unwrap();
        assert_eq!(first.paid_amount, dec!(100));
        assert_eq!(first.status, crate::schedule::InstallmentStatus::Paid);
    }

    #[test]
    fn hold_blocks_spending_and_release_restores_it() {
        let (engine, _) = engine();
        let account = funded_account(&engine, dec!(200));

        engine.place_hold(account.id(), kes(dec!(150))).unwrap();
        assert!(matches!(
            engine.post_transaction(
                account.id(),
                TransactionKind::Withdrawal,
                kes(dec!(100)),
                TransactionMetadata::default()
            ),
            Err(LedgerError::Domain(DomainError::InsufficientFunds { .. }))
        ));

        engine.release_hold(account.id(), kes(dec!(150))).unwrap();
        engine
            .post_transaction(
                account.id(),
                TransactionKind::Withdrawal,
                kes(dec!(100)),
                TransactionMetadata::default(),
            )
            .unwrap();
    }

    #[test]
    fn unregistered_event_type_fails_before_any_write() {
        let outbox = InMemoryOutboxStore::arc();
        let store = Arc::new(InMemoryLedgerStore::new(outbox.clone()));
        // Empty registry: every outbound payload is a violation.
        let empty_gate = Arc::new(SchemaGate::new(
            SchemaRegistry::new(),
            InMemoryQuarantine::arc(),
        ));
        let engine = LedgerEngine::new(store, empty_gate);

        let err = engine
            .open_account(MemberId::new(), Currency::Kes)
            .unwrap_err();
        assert!(matches!(err, LedgerError::Schema(_)));
        assert_eq!(outbox.unpublished_count().unwrap(), 0);
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: under any sequence of postings that respects the
        /// insufficient-funds check, the balance never goes negative and
        /// always equals the sum of accepted signed amounts.
        #[test]
        fn balance_never_negative_under_any_posting_sequence(
            ops in prop::collection::vec((any::<bool>(), 1i64..10_000i64), 1..40)
        ) {
            let (engine, _) = engine();
            let account = engine.open_account(MemberId::new(), Currency::Kes).unwrap();
            let mut expected = Decimal::ZERO;

            for (is_deposit, cents) in ops {
                let amount = Decimal::new(cents, 2);
                let kind = if is_deposit {
                    TransactionKind::Deposit
                } else {
                    TransactionKind::Withdrawal
                };

                match engine.post_transaction(
                    account.id(),
                    kind,
                    kes(amount),
                    TransactionMetadata::default(),
                ) {
                    Ok(receipt) => {
                        expected += if is_deposit { amount } else { -amount };
                        prop_assert_eq!(receipt.current_balance, expected);
                    }
                    Err(LedgerError::Domain(DomainError::InsufficientFunds { .. })) => {
                        prop_assert!(!is_deposit);
                        prop_assert!(amount > expected);
                    }
                    Err(other) => return Err(TestCaseError::fail(format!("{other:?}"))),
                }

                let balance = engine.account(account.id()).unwrap().current_balance();
                prop_assert!(balance >= Decimal::ZERO);
                prop_assert_eq!(balance, expected);
            }
        }

        /// Property: every committed transfer's paired entries sum to zero.
        #[test]
        fn transfers_always_balance(
            amounts in prop::collection::vec(1i64..5_000i64, 1..10)
        ) {
            let (engine, _) = engine();
            let from = funded_account(&engine, dec!(1_000_000));
            let to = funded_account(&engine, dec!(0));

            for cents in amounts {
                engine
                    .transfer(
                        from.id(),
                        to.id(),
                        kes(Decimal::new(cents, 2)),
                        TransactionMetadata::default(),
                    )
                    .unwrap();
            }

            let mut entries = engine.history(from.id()).unwrap();
            entries.extend(engine.history(to.id()).unwrap());

            let mut by_group: std::collections::HashMap<Uuid, Decimal> =
                std::collections::HashMap::new();
            for tx in entries.iter().filter(|t| t.transfer_group.is_some()) {
                *by_group.entry(tx.transfer_group.unwrap()).or_default() += tx.signed_amount();
            }

            for (_, sum) in by_group {
                prop_assert_eq!(sum, dec!(0));
            }
        }
    }
}
