//! Loan repayment schedules and amortization.

use chrono::{Months, NaiveDate};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};

use coopledger_core::{Currency, DomainError, DomainResult, LoanId};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstallmentStatus {
    Pending,
    Paid,
    Overdue,
    Waived,
}

/// One installment of a repayment schedule.
///
/// Invariants: `total_due = principal + interest`;
/// `paid_amount <= total_due + penalty`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Installment {
    pub loan_id: LoanId,
    /// 1-indexed installment number.
    pub number: u32,
    pub due_date: NaiveDate,
    pub principal: Decimal,
    pub interest: Decimal,
    pub total_due: Decimal,
    pub paid_amount: Decimal,
    pub penalty: Decimal,
    pub status: InstallmentStatus,
}

impl Installment {
    pub fn outstanding(&self) -> Decimal {
        (self.total_due + self.penalty - self.paid_amount).max(Decimal::ZERO)
    }
}

/// A loan's full repayment schedule.
///
/// Generated exactly once at disbursement; mutated only by repayment
/// postings, never regenerated in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepaymentSchedule {
    pub loan_id: LoanId,
    pub currency: Currency,
    pub installments: Vec<Installment>,
}

impl RepaymentSchedule {
    /// Generate an equal-principal (declining balance) schedule.
    ///
    /// Each installment repays `principal / term` (the last one absorbs
    /// rounding) plus one month's interest on the balance still outstanding.
    /// `annual_rate` is a fraction (0.12 = 12% p.a.).
    pub fn amortize(
        loan_id: LoanId,
        principal: Decimal,
        currency: Currency,
        annual_rate: Decimal,
        term_months: u32,
        first_due: NaiveDate,
    ) -> DomainResult<Self> {
        if principal <= Decimal::ZERO {
            return Err(DomainError::validation("loan principal must be positive"));
        }
        if annual_rate < Decimal::ZERO {
            return Err(DomainError::validation("interest rate cannot be negative"));
        }
        if term_months == 0 {
            return Err(DomainError::validation("loan term must be at least one month"));
        }

        let monthly_rate = annual_rate / Decimal::from(12);
        let level_principal = (principal / Decimal::from(term_months))
            .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);

        let mut installments = Vec::with_capacity(term_months as usize);
        let mut outstanding = principal;
        let mut repaid = Decimal::ZERO;

        for number in 1..=term_months {
            let principal_part = if number == term_months {
                // Last installment absorbs rounding so the parts sum exactly.
                principal - repaid
            } else {
                level_principal
            };

            let interest_part = (outstanding * monthly_rate)
                .round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero);

            let due_date = first_due
                .checked_add_months(Months::new(number - 1))
                .ok_or_else(|| DomainError::validation("due date out of range"))?;

            installments.push(Installment {
                loan_id,
                number,
                due_date,
                principal: principal_part,
                interest: interest_part,
                total_due: principal_part + interest_part,
                paid_amount: Decimal::ZERO,
                penalty: Decimal::ZERO,
                status: InstallmentStatus::Pending,
            });

            outstanding -= principal_part;
            repaid += principal_part;
        }

        Ok(Self {
            loan_id,
            currency,
            installments,
        })
    }

    pub fn installment(&self, number: u32) -> Option<&Installment> {
        self.installments.iter().find(|i| i.number == number)
    }

    /// Principal not yet covered by posted repayments.
    pub fn outstanding_total(&self) -> Decimal {
        self.installments.iter().map(|i| i.outstanding()).sum()
    }

    /// Apply a repayment posting to one installment.
    ///
    /// Caps at `total_due + penalty`: overpaying an installment is rejected,
    /// not silently truncated.
    pub fn post_payment(&mut self, number: u32, amount: Decimal) -> DomainResult<&Installment> {
        if amount <= Decimal::ZERO {
            return Err(DomainError::validation("repayment amount must be positive"));
        }

        let installment = self
            .installments
            .iter_mut()
            .find(|i| i.number == number)
            .ok_or(DomainError::NotFound)?;

        if installment.status == InstallmentStatus::Waived {
            return Err(DomainError::validation("installment has been waived"));
        }
        if installment.paid_amount + amount > installment.total_due + installment.penalty {
            return Err(DomainError::validation(format!(
                "repayment exceeds amount due (outstanding {})",
                installment.outstanding()
            )));
        }

        installment.paid_amount += amount;
        if installment.paid_amount == installment.total_due + installment.penalty {
            installment.status = InstallmentStatus::Paid;
        }

        Ok(installment)
    }

    /// Flag unpaid installments past their due date.
    pub fn mark_overdue(&mut self, today: NaiveDate) {
        for installment in &mut self.installments {
            if installment.status == InstallmentStatus::Pending && installment.due_date < today {
                installment.status = InstallmentStatus::Overdue;
            }
        }
    }

    /// Waive an installment (e.g. a board-approved write-off).
    pub fn waive(&mut self, number: u32) -> DomainResult<()> {
        let installment = self
            .installments
            .iter_mut()
            .find(|i| i.number == number)
            .ok_or(DomainError::NotFound)?;
        if installment.status == InstallmentStatus::Paid {
            return Err(DomainError::validation("cannot waive a paid installment"));
        }
        installment.status = InstallmentStatus::Waived;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn schedule(principal: Decimal, rate: Decimal, term: u32) -> RepaymentSchedule {
        RepaymentSchedule::amortize(
            LoanId::new(),
            principal,
            Currency::Kes,
            rate,
            term,
            NaiveDate::from_ymd_opt(2026, 1, 15).unwrap(),
        )
        .unwrap()
    }

    #[test]
    fn installments_satisfy_total_due_law() {
        let s = schedule(dec!(10000), dec!(0.12), 12);
        assert_eq!(s.installments.len(), 12);
        for i in &s.installments {
            assert_eq!(i.total_due, i.principal + i.interest);
        }
    }

    #[test]
    fn principal_parts_sum_to_loan_principal() {
        // 10000 / 3 does not divide evenly; the last installment absorbs it.
        let s = schedule(dec!(10000), dec!(0.12), 3);
        let total: Decimal = s.installments.iter().map(|i| i.principal).sum();
        assert_eq!(total, dec!(10000));
    }

    #[test]
    fn interest_declines_with_outstanding_balance() {
        let s = schedule(dec!(12000), dec!(0.12), 12);
        // 1% monthly on a declining balance: 120, 110, 100, ...
        assert_eq!(s.installments[0].interest, dec!(120));
        assert_eq!(s.installments[1].interest, dec!(110));
        assert!(s.installments[11].interest < s.installments[0].interest);
    }

    #[test]
    fn due_dates_advance_monthly() {
        let s = schedule(dec!(3000), dec!(0), 3);
        assert_eq!(
            s.installments[0].due_date,
            NaiveDate::from_ymd_opt(2026, 1, 15).unwrap()
        );
        assert_eq!(
            s.installments[2].due_date,
            NaiveDate::from_ymd_opt(2026, 3, 15).unwrap()
        );
    }

    #[test]
    fn payment_marks_installment_paid_and_rejects_overpay() {
        let mut s = schedule(dec!(1200), dec!(0), 12);
        let due = s.installment(1).unwrap().total_due;

        assert!(s.post_payment(1, due + dec!(1)).is_err());

        s.post_payment(1, dec!(40)).unwrap();
        assert_eq!(s.installment(1).unwrap().status, InstallmentStatus::Pending);

        s.post_payment(1, due - dec!(40)).unwrap();
        assert_eq!(s.installment(1).unwrap().status, InstallmentStatus::Paid);
    }

    #[test]
    fn overdue_and_waive_transitions() {
        let mut s = schedule(dec!(1000), dec!(0.1), 2);
        s.mark_overdue(NaiveDate::from_ymd_opt(2026, 2, 1).unwrap());
        assert_eq!(s.installment(1).unwrap().status, InstallmentStatus::Overdue);
        assert_eq!(s.installment(2).unwrap().status, InstallmentStatus::Pending);

        s.waive(2).unwrap();
        assert_eq!(s.installment(2).unwrap().status, InstallmentStatus::Waived);
        assert!(s.post_payment(2, dec!(10)).is_err());
    }

    #[test]
    fn zero_term_or_nonpositive_principal_rejected() {
        assert!(RepaymentSchedule::amortize(
            LoanId::new(),
            dec!(0),
            Currency::Kes,
            dec!(0.1),
            12,
            NaiveDate::from_ymd_opt(2026, 1, 1).unwrap()
        )
        .is_err());
        assert!(RepaymentSchedule::amortize(
            LoanId::new(),
            dec!(100),
            Currency::Kes,
            dec!(0.1),
            0,
            NaiveDate::from_ymd_opt(2026, 1, 1).unwrap()
        )
        .is_err());
    }
}
