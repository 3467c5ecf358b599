//! Ledger engine: the only writer of financial truth.
//!
//! Owns accounts, transactions, and repayment schedules; enforces the
//! double-entry and balance invariants; commits every mutation together with
//! the outbox record describing it.

pub mod account;
pub mod engine;
pub mod schedule;
pub mod store;
pub mod transaction;

pub use account::{Account, AccountStatus};
pub use engine::{
    LedgerEngine, LedgerError, PostedTransaction, TransactionMetadata, TransferReceipt,
    ledger_event_schemas,
};
pub use schedule::{Installment, InstallmentStatus, RepaymentSchedule};
pub use store::{InMemoryLedgerStore, LedgerCommit, LedgerStore, LedgerStoreError};
pub use transaction::{LedgerTransaction, TransactionKind, TransactionStatus};
