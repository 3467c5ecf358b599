//! Ledger transactions: immutable financial facts.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use coopledger_core::{AccountId, Money, TransactionId};
use coopledger_events::Topic;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionKind {
    Deposit,
    Withdrawal,
    TransferIn,
    TransferOut,
    Fee,
    Interest,
}

impl TransactionKind {
    /// Whether this kind credits the account (increases the balance).
    pub fn is_credit(&self) -> bool {
        matches!(
            self,
            TransactionKind::Deposit | TransactionKind::TransferIn | TransactionKind::Interest
        )
    }

    /// Stable event type published when a transaction of this kind commits.
    pub fn event_type(&self) -> &'static str {
        match self {
            TransactionKind::Deposit => "transaction.deposit.completed",
            TransactionKind::Withdrawal => "transaction.withdrawal.processed",
            TransactionKind::TransferIn => "transaction.transfer.credited",
            TransactionKind::TransferOut => "transaction.transfer.debited",
            TransactionKind::Fee => "transaction.fee.applied",
            TransactionKind::Interest => "transaction.interest.accrued",
        }
    }

    pub fn topic(&self) -> Topic {
        Topic::new(self.event_type())
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Reversed,
}

/// One committed ledger entry.
///
/// Immutable once `Completed`; the only permitted later change is the status
/// flip to `Reversed` when a reversing entry commits. Corrections are always
/// new entries referencing the original via `reversal_of`, never edits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerTransaction {
    pub id: TransactionId,
    pub account_id: AccountId,
    pub kind: TransactionKind,
    /// Always positive; direction comes from `kind` (and `reversal_of`).
    pub amount: Money,
    /// Account balance immediately after this entry committed.
    pub running_balance: Decimal,
    pub status: TransactionStatus,
    /// Set on reversing entries: the transaction being undone.
    pub reversal_of: Option<TransactionId>,
    /// Shared by the paired debit/credit entries of one transfer.
    pub transfer_group: Option<Uuid>,
    pub transaction_date: DateTime<Utc>,
    /// Effective date for interest and reporting purposes.
    pub value_date: DateTime<Utc>,
    pub description: Option<String>,
}

impl LedgerTransaction {
    pub fn completed(
        account_id: AccountId,
        kind: TransactionKind,
        amount: Money,
        running_balance: Decimal,
        value_date: DateTime<Utc>,
        description: Option<String>,
    ) -> Self {
        Self {
            id: TransactionId::new(),
            account_id,
            kind,
            amount,
            running_balance,
            status: TransactionStatus::Completed,
            reversal_of: None,
            transfer_group: None,
            transaction_date: Utc::now(),
            value_date,
            description,
        }
    }

    pub fn with_transfer_group(mut self, group: Uuid) -> Self {
        self.transfer_group = Some(group);
        self
    }

    pub fn with_reversal_of(mut self, original: TransactionId) -> Self {
        self.reversal_of = Some(original);
        self
    }

    /// Signed amount: credits positive, debits negative.
    ///
    /// A reversing entry keeps the original's kind and inverts the sign, so
    /// an original and its reversal always sum to zero.
    pub fn signed_amount(&self) -> Decimal {
        let base = if self.kind.is_credit() {
            self.amount.amount()
        } else {
            -self.amount.amount()
        };
        if self.reversal_of.is_some() { -base } else { base }
    }

    /// Whether this entry credits the account, reversal considered.
    pub fn credits_account(&self) -> bool {
        self.kind.is_credit() ^ self.reversal_of.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use coopledger_core::Currency;
    use rust_decimal_macros::dec;

    fn entry(kind: TransactionKind) -> LedgerTransaction {
        LedgerTransaction::completed(
            AccountId::new(),
            kind,
            Money::new(dec!(100), Currency::Kes),
            dec!(100),
            Utc::now(),
            None,
        )
    }

    #[test]
    fn sign_follows_kind() {
        assert_eq!(entry(TransactionKind::Deposit).signed_amount(), dec!(100));
        assert_eq!(
            entry(TransactionKind::Withdrawal).signed_amount(),
            dec!(-100)
        );
        assert_eq!(entry(TransactionKind::Fee).signed_amount(), dec!(-100));
        assert_eq!(entry(TransactionKind::Interest).signed_amount(), dec!(100));
    }

    #[test]
    fn reversal_inverts_sign_and_sums_to_zero() {
        let original = entry(TransactionKind::Deposit);
        let reversal = entry(TransactionKind::Deposit).with_reversal_of(original.id);

        assert_eq!(reversal.signed_amount(), dec!(-100));
        assert_eq!(original.signed_amount() + reversal.signed_amount(), dec!(0));
        assert!(!reversal.credits_account());
    }

    #[test]
    fn transfer_pair_sums_to_zero() {
        let group = Uuid::now_v7();
        let out = entry(TransactionKind::TransferOut).with_transfer_group(group);
        let inn = entry(TransactionKind::TransferIn).with_transfer_group(group);

        assert_eq!(out.signed_amount() + inn.signed_amount(), dec!(0));
    }
}
