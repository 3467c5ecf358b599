//! Member accounts and their balance invariants.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use coopledger_core::{AccountId, Currency, DomainError, DomainResult, MemberId, Money};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountStatus {
    Active,
    Frozen,
    Closed,
}

/// A member's ledger account.
///
/// Invariants, held after every committed mutation:
/// - `available_balance <= current_balance`
/// - `current_balance >= 0`
///
/// The gap between the two balances is the sum of active holds (earmarked
/// funds). Accounts are never hard-deleted; `close` is a status change and
/// requires a zero balance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    id: AccountId,
    member_id: MemberId,
    currency: Currency,
    current_balance: Decimal,
    available_balance: Decimal,
    status: AccountStatus,
    opened_at: DateTime<Utc>,
    closed_at: Option<DateTime<Utc>>,
}

impl Account {
    /// Open a new active account with zero balances.
    pub fn open(member_id: MemberId, currency: Currency) -> Self {
        Self {
            id: AccountId::new(),
            member_id,
            currency,
            current_balance: Decimal::ZERO,
            available_balance: Decimal::ZERO,
            status: AccountStatus::Active,
            opened_at: Utc::now(),
            closed_at: None,
        }
    }

    pub fn id(&self) -> AccountId {
        self.id
    }

    pub fn member_id(&self) -> MemberId {
        self.member_id
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub fn current_balance(&self) -> Decimal {
        self.current_balance
    }

    pub fn available_balance(&self) -> Decimal {
        self.available_balance
    }

    pub fn status(&self) -> AccountStatus {
        self.status
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn is_active(&self) -> bool {
        self.status == AccountStatus::Active
    }

    pub(crate) fn ensure_active(&self) -> DomainResult<()> {
        if !self.is_active() {
            return Err(DomainError::AccountNotActive);
        }
        Ok(())
    }

    pub(crate) fn ensure_currency(&self, amount: Money) -> DomainResult<()> {
        if amount.currency() != self.currency {
            return Err(DomainError::validation(format!(
                "account {} is denominated in {}, got {}",
                self.id,
                self.currency,
                amount.currency()
            )));
        }
        Ok(())
    }

    /// Increase both balances by a positive amount.
    pub(crate) fn credit(&mut self, amount: Decimal) -> DomainResult<()> {
        self.current_balance += amount;
        self.available_balance += amount;
        self.check_invariants()
    }

    /// Decrease both balances by a positive amount.
    ///
    /// Fails with `InsufficientFunds` when the available balance cannot
    /// cover the debit; no partial debit ever happens.
    pub(crate) fn debit(&mut self, amount: Decimal) -> DomainResult<()> {
        if amount > self.available_balance {
            return Err(DomainError::insufficient_funds(
                amount,
                self.available_balance,
            ));
        }
        self.current_balance -= amount;
        self.available_balance -= amount;
        self.check_invariants()
    }

    /// Earmark funds: reduces the available balance only.
    pub fn place_hold(&mut self, amount: Decimal) -> DomainResult<()> {
        if amount <= Decimal::ZERO {
            return Err(DomainError::validation("hold amount must be positive"));
        }
        if amount > self.available_balance {
            return Err(DomainError::insufficient_funds(
                amount,
                self.available_balance,
            ));
        }
        self.available_balance -= amount;
        self.check_invariants()
    }

    /// Release an earmark: restores the available balance.
    pub fn release_hold(&mut self, amount: Decimal) -> DomainResult<()> {
        if amount <= Decimal::ZERO {
            return Err(DomainError::validation("hold amount must be positive"));
        }
        if self.available_balance + amount > self.current_balance {
            return Err(DomainError::invariant(
                "hold release exceeds outstanding holds",
            ));
        }
        self.available_balance += amount;
        self.check_invariants()
    }

    pub fn freeze(&mut self) -> DomainResult<()> {
        match self.status {
            AccountStatus::Active => {
                self.status = AccountStatus::Frozen;
                Ok(())
            }
            AccountStatus::Frozen => Ok(()),
            AccountStatus::Closed => Err(DomainError::AccountNotActive),
        }
    }

    pub fn unfreeze(&mut self) -> DomainResult<()> {
        match self.status {
            AccountStatus::Frozen => {
                self.status = AccountStatus::Active;
                Ok(())
            }
            AccountStatus::Active => Ok(()),
            AccountStatus::Closed => Err(DomainError::AccountNotActive),
        }
    }

    /// Soft-close the account. Requires a zero balance and no holds.
    pub fn close(&mut self) -> DomainResult<()> {
        if self.status == AccountStatus::Closed {
            return Ok(());
        }
        if !self.current_balance.is_zero() {
            return Err(DomainError::invariant(
                "account balance must be zero before closing",
            ));
        }
        if self.available_balance != self.current_balance {
            return Err(DomainError::invariant(
                "account has outstanding holds",
            ));
        }
        self.status = AccountStatus::Closed;
        self.closed_at = Some(Utc::now());
        Ok(())
    }

    fn check_invariants(&self) -> DomainResult<()> {
        if self.current_balance < Decimal::ZERO {
            return Err(DomainError::invariant("current balance went negative"));
        }
        if self.available_balance > self.current_balance {
            return Err(DomainError::invariant(
                "available balance exceeds current balance",
            ));
        }
        Ok(())
    }
}
