//! Money value object: fixed-point amounts, compared by value.

use core::fmt;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// ISO 4217 currency code.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Currency {
    Kes,
    Usd,
    Eur,
    Gbp,
}

impl fmt::Display for Currency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            Currency::Kes => "KES",
            Currency::Usd => "USD",
            Currency::Eur => "EUR",
            Currency::Gbp => "GBP",
        };
        f.write_str(code)
    }
}

/// A monetary amount in a single currency.
///
/// Uses `rust_decimal` fixed-point arithmetic: no floating error, exact
/// comparisons. Immutable; arithmetic returns new values. Mixed-currency
/// arithmetic is a validation error, never a silent coercion.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Money {
    amount: Decimal,
    currency: Currency,
}

impl Money {
    pub fn new(amount: Decimal, currency: Currency) -> Self {
        Self { amount, currency }
    }

    pub fn zero(currency: Currency) -> Self {
        Self {
            amount: Decimal::ZERO,
            currency,
        }
    }

    pub fn amount(&self) -> Decimal {
        self.amount
    }

    pub fn currency(&self) -> Currency {
        self.currency
    }

    pub fn is_positive(&self) -> bool {
        self.amount > Decimal::ZERO
    }

    pub fn is_negative(&self) -> bool {
        self.amount < Decimal::ZERO
    }

    pub fn is_zero(&self) -> bool {
        self.amount.is_zero()
    }

    pub fn checked_add(&self, other: Money) -> DomainResult<Money> {
        self.ensure_same_currency(other)?;
        Ok(Money::new(self.amount + other.amount, self.currency))
    }

    pub fn checked_sub(&self, other: Money) -> DomainResult<Money> {
        self.ensure_same_currency(other)?;
        Ok(Money::new(self.amount - other.amount, self.currency))
    }

    /// Negate the amount (used for reversing entries).
    pub fn negated(&self) -> Money {
        Money::new(-self.amount, self.currency)
    }

    fn ensure_same_currency(&self, other: Money) -> DomainResult<()> {
        if self.currency != other.currency {
            return Err(DomainError::validation(format!(
                "currency mismatch: {} vs {}",
                self.currency, other.currency
            )));
        }
        Ok(())
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.currency)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn add_same_currency() {
        let a = Money::new(dec!(100.50), Currency::Kes);
        let b = Money::new(dec!(49.50), Currency::Kes);
        assert_eq!(a.checked_add(b).unwrap(), Money::new(dec!(150), Currency::Kes));
    }

    #[test]
    fn mixed_currency_is_rejected() {
        let a = Money::new(dec!(100), Currency::Kes);
        let b = Money::new(dec!(100), Currency::Usd);
        assert!(a.checked_add(b).is_err());
        assert!(a.checked_sub(b).is_err());
    }

    #[test]
    fn negation_round_trips() {
        let a = Money::new(dec!(75.25), Currency::Usd);
        assert_eq!(a.negated().negated(), a);
        assert!(a.negated().is_negative());
    }
}
