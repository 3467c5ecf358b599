//! Loan origination workflow.
//!
//! Orchestrates the flow:
//! 1. Application submitted → request a credit check
//! 2. Credit check passed → earmark collateral, command disbursement
//! 3. Principal deposit confirmed → loan disbursed (terminal)
//!
//! Compensating action: release the collateral earmark if disbursement
//! fails after approval. Cancellation is an ordinary inbound event, so it
//! runs through the same audited path as everything else.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use coopledger_events::{EventEnvelope, EventSchema};

use crate::instance::SagaContext;
use crate::workflow::{SideEffect, Transition, Workflow, WorkflowState};

pub const APPLICATION_SUBMITTED: &str = "loan.application.submitted";
pub const CREDIT_CHECK_REQUESTED: &str = "loan.credit_check.requested";
pub const CREDIT_CHECK_PASSED: &str = "loan.credit_check.passed";
pub const CREDIT_CHECK_FAILED: &str = "loan.credit_check.failed";
pub const LOAN_APPROVED: &str = "loan.approved";
pub const LOAN_REJECTED: &str = "loan.rejected";
pub const LOAN_CANCELLED: &str = "loan.cancelled";
pub const CANCELLATION_REQUESTED: &str = "loan.cancellation.requested";
pub const DISBURSEMENT_FAILED: &str = "loan.disbursement.failed";
pub const ORIGINATION_COMPLETED: &str = "loan.origination.completed";

/// The ledger's confirmation that the principal landed.
const DEPOSIT_COMPLETED: &str = "transaction.deposit.completed";

/// Schemas for every loan event this workflow consumes or emits.
pub fn loan_event_schemas() -> Vec<EventSchema> {
    vec![
        EventSchema::new(
            APPLICATION_SUBMITTED,
            1,
            [
                "loan_id",
                "account_id",
                "principal",
                "currency",
                "annual_rate",
                "term_months",
                "collateral_amount",
            ],
        ),
        EventSchema::new(CREDIT_CHECK_REQUESTED, 1, ["loan_id"]),
        EventSchema::new(CREDIT_CHECK_PASSED, 1, ["loan_id"]),
        EventSchema::new(CREDIT_CHECK_FAILED, 1, ["loan_id", "reason"]),
        EventSchema::new(LOAN_APPROVED, 1, ["loan_id"]),
        EventSchema::new(LOAN_REJECTED, 1, ["loan_id", "reason"]),
        EventSchema::new(LOAN_CANCELLED, 1, ["loan_id", "reason"]),
        EventSchema::new(CANCELLATION_REQUESTED, 1, ["loan_id"]),
        EventSchema::new(DISBURSEMENT_FAILED, 1, ["loan_id", "reason"]),
        EventSchema::new(ORIGINATION_COMPLETED, 1, ["loan_id"]),
    ]
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanOriginationState {
    #[default]
    Submitted,
    CreditCheckPending,
    Approved,
    Rejected,
    Disbursed,
    Failed,
}

impl WorkflowState for LoanOriginationState {
    fn name(&self) -> &'static str {
        match self {
            LoanOriginationState::Submitted => "submitted",
            LoanOriginationState::CreditCheckPending => "credit_check_pending",
            LoanOriginationState::Approved => "approved",
            LoanOriginationState::Rejected => "rejected",
            LoanOriginationState::Disbursed => "disbursed",
            LoanOriginationState::Failed => "failed",
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(
            self,
            LoanOriginationState::Rejected
                | LoanOriginationState::Disbursed
                | LoanOriginationState::Failed
        )
    }
}

pub struct LoanOriginationWorkflow;

impl LoanOriginationWorkflow {
    fn fail_with_cancellation(context: &SagaContext, reason: &str) -> Transition<LoanOriginationState> {
        Transition::advance(LoanOriginationState::Failed).with_effect(SideEffect::publish(
            LOAN_CANCELLED,
            serde_json::json!({
                "loan_id": context.get("loan_id").cloned().unwrap_or(JsonValue::Null),
                "reason": reason,
            }),
        ))
    }

    fn release_collateral(context: &SagaContext) -> Option<SideEffect> {
        let account_id = context.get("account_id")?;
        let collateral = context.get("collateral_amount")?;
        Some(SideEffect::compensate(
            "ledger",
            "release_hold",
            serde_json::json!({
                "account_id": account_id,
                "amount": collateral,
                "currency": context.get("currency").cloned().unwrap_or(JsonValue::Null),
            }),
        ))
    }
}

impl Workflow for LoanOriginationWorkflow {
    type State = LoanOriginationState;

    fn workflow_type() -> &'static str {
        "loan.origination"
    }

    fn deadline(state: &Self::State) -> Option<Duration> {
        match state {
            // An application nobody acts on is cancelled after a day.
            LoanOriginationState::Submitted => Some(Duration::from_secs(24 * 3_600)),
            // The risk service has three days to answer.
            LoanOriginationState::CreditCheckPending => Some(Duration::from_secs(72 * 3_600)),
            // Disbursement confirmation from the ledger should be quick.
            LoanOriginationState::Approved => Some(Duration::from_secs(24 * 3_600)),
            LoanOriginationState::Rejected
            | LoanOriginationState::Disbursed
            | LoanOriginationState::Failed => None,
        }
    }

    fn on_event(
        state: &Self::State,
        context: &SagaContext,
        event: &EventEnvelope,
    ) -> Transition<Self::State> {
        match (state, event.event_type()) {
            (LoanOriginationState::Submitted, APPLICATION_SUBMITTED) => {
                let payload = event.payload();
                let mut transition = Transition::advance(LoanOriginationState::CreditCheckPending)
                    .with_effect(SideEffect::publish(
                        CREDIT_CHECK_REQUESTED,
                        serde_json::json!({
                            "loan_id": payload.get("loan_id").cloned().unwrap_or(JsonValue::Null),
                        }),
                    ));
                // Carry the application facts forward; later transitions
                // build their commands from context alone.
                for key in [
                    "loan_id",
                    "account_id",
                    "principal",
                    "currency",
                    "annual_rate",
                    "term_months",
                    "collateral_amount",
                ] {
                    if let Some(value) = payload.get(key) {
                        transition = transition.with_context(key, value.clone());
                    }
                }
                transition
            }

            (LoanOriginationState::CreditCheckPending, CREDIT_CHECK_PASSED) => {
                let loan_id = context.get("loan_id").cloned().unwrap_or(JsonValue::Null);
                let mut transition = Transition::advance(LoanOriginationState::Approved)
                    .with_effect(SideEffect::command(
                        "ledger",
                        "place_hold",
                        serde_json::json!({
                            "account_id": context.get("account_id").cloned().unwrap_or(JsonValue::Null),
                            "amount": context.get("collateral_amount").cloned().unwrap_or(JsonValue::Null),
                            "currency": context.get("currency").cloned().unwrap_or(JsonValue::Null),
                        }),
                    ))
                    .with_effect(SideEffect::command(
                        "ledger",
                        "disburse_loan",
                        serde_json::json!({
                            "loan_id": loan_id,
                            "account_id": context.get("account_id").cloned().unwrap_or(JsonValue::Null),
                            "principal": context.get("principal").cloned().unwrap_or(JsonValue::Null),
                            "currency": context.get("currency").cloned().unwrap_or(JsonValue::Null),
                            "annual_rate": context.get("annual_rate").cloned().unwrap_or(JsonValue::Null),
                            "term_months": context.get("term_months").cloned().unwrap_or(JsonValue::Null),
                        }),
                    ))
                    .with_effect(SideEffect::publish(
                        LOAN_APPROVED,
                        serde_json::json!({ "loan_id": loan_id }),
                    ));
                if let Some(score) = event.payload().get("score") {
                    transition = transition.with_context("credit_score", score.clone());
                }
                transition
            }

            (LoanOriginationState::CreditCheckPending, CREDIT_CHECK_FAILED) => {
                let reason = event
                    .payload()
                    .get("reason")
                    .cloned()
                    .unwrap_or_else(|| JsonValue::String("credit check failed".to_string()));
                Transition::advance(LoanOriginationState::Rejected)
                    .with_context("rejection_reason", reason.clone())
                    .with_effect(SideEffect::publish(
                        LOAN_REJECTED,
                        serde_json::json!({
                            "loan_id": context.get("loan_id").cloned().unwrap_or(JsonValue::Null),
                            "reason": reason,
                        }),
                    ))
            }

            (LoanOriginationState::Approved, DEPOSIT_COMPLETED) => {
                Transition::advance(LoanOriginationState::Disbursed).with_effect(
                    SideEffect::publish(
                        ORIGINATION_COMPLETED,
                        serde_json::json!({
                            "loan_id": context.get("loan_id").cloned().unwrap_or(JsonValue::Null),
                        }),
                    ),
                )
            }

            (LoanOriginationState::Approved, DISBURSEMENT_FAILED) => {
                let mut transition = Self::fail_with_cancellation(
                    context,
                    event
                        .payload()
                        .get("reason")
                        .and_then(|r| r.as_str())
                        .unwrap_or("disbursement failed"),
                );
                if let Some(release) = Self::release_collateral(context) {
                    transition = transition.with_effect(release);
                }
                transition
            }

            (
                LoanOriginationState::Submitted | LoanOriginationState::CreditCheckPending,
                CANCELLATION_REQUESTED,
            ) => Self::fail_with_cancellation(context, "cancellation requested"),

            (LoanOriginationState::Approved, CANCELLATION_REQUESTED) => {
                let mut transition =
                    Self::fail_with_cancellation(context, "cancellation requested");
                if let Some(release) = Self::release_collateral(context) {
                    transition = transition.with_effect(release);
                }
                transition
            }

            // Everything else: replay, out-of-order delivery, or noise.
            _ => Transition::Ignore,
        }
    }

    fn on_timeout(state: &Self::State, context: &SagaContext) -> Transition<Self::State> {
        match state {
            LoanOriginationState::Submitted | LoanOriginationState::CreditCheckPending => {
                Self::fail_with_cancellation(context, "deadline elapsed")
            }
            LoanOriginationState::Approved => {
                let mut transition = Self::fail_with_cancellation(context, "deadline elapsed");
                if let Some(release) = Self::release_collateral(context) {
                    transition = transition.with_effect(release);
                }
                transition
            }
            // Terminal states have no deadline; nothing to do.
            _ => Transition::Ignore,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use coopledger_core::CorrelationId;
    use uuid::Uuid;

    fn envelope(event_type: &str, payload: JsonValue) -> EventEnvelope {
        EventEnvelope::new(
            Uuid::now_v7(),
            event_type,
            1,
            Utc::now(),
            Some(CorrelationId::new()),
            None,
            payload,
        )
    }

    fn application_context() -> SagaContext {
        let mut context = SagaContext::new();
        context.insert("loan_id".into(), serde_json::json!("L-1"));
        context.insert("account_id".into(), serde_json::json!("A-1"));
        context.insert("principal".into(), serde_json::json!("12000"));
        context.insert("currency".into(), serde_json::json!("KES"));
        context.insert("annual_rate".into(), serde_json::json!("0.12"));
        context.insert("term_months".into(), serde_json::json!(12));
        context.insert("collateral_amount".into(), serde_json::json!("3000"));
        context
    }

    #[test]
    fn submission_requests_credit_check_and_captures_context() {
        let event = envelope(
            APPLICATION_SUBMITTED,
            serde_json::json!({
                "loan_id": "L-1",
                "account_id": "A-1",
                "principal": "12000",
                "currency": "KES",
                "annual_rate": "0.12",
                "term_months": 12,
                "collateral_amount": "3000",
            }),
        );

        let transition = LoanOriginationWorkflow::on_event(
            &LoanOriginationState::Submitted,
            &SagaContext::new(),
            &event,
        );

        match transition {
            Transition::Advance {
                next,
                context,
                effects,
            } => {
                assert_eq!(next, LoanOriginationState::CreditCheckPending);
                assert_eq!(context.len(), 7);
                assert!(matches!(
                    &effects[0],
                    SideEffect::Publish { event_type, .. } if event_type == CREDIT_CHECK_REQUESTED
                ));
            }
            Transition::Ignore => panic!("expected advance"),
        }
    }

    #[test]
    fn passed_check_commands_hold_then_disbursement() {
        let event = envelope(
            CREDIT_CHECK_PASSED,
            serde_json::json!({ "loan_id": "L-1", "score": 712 }),
        );

        let transition = LoanOriginationWorkflow::on_event(
            &LoanOriginationState::CreditCheckPending,
            &application_context(),
            &event,
        );

        match transition {
            Transition::Advance { next, effects, .. } => {
                assert_eq!(next, LoanOriginationState::Approved);
                assert_eq!(effects.len(), 3);
                assert!(matches!(
                    &effects[0],
                    SideEffect::Command { command_type, .. } if command_type == "place_hold"
                ));
                assert!(matches!(
                    &effects[1],
                    SideEffect::Command { command_type, .. } if command_type == "disburse_loan"
                ));
                assert!(matches!(
                    &effects[2],
                    SideEffect::Publish { event_type, .. } if event_type == LOAN_APPROVED
                ));
            }
            Transition::Ignore => panic!("expected advance"),
        }
    }

    #[test]
    fn failed_check_rejects_terminally() {
        let event = envelope(
            CREDIT_CHECK_FAILED,
            serde_json::json!({ "loan_id": "L-1", "reason": "arrears" }),
        );

        let transition = LoanOriginationWorkflow::on_event(
            &LoanOriginationState::CreditCheckPending,
            &application_context(),
            &event,
        );

        match transition {
            Transition::Advance { next, .. } => {
                assert_eq!(next, LoanOriginationState::Rejected);
                assert!(next.is_terminal());
            }
            Transition::Ignore => panic!("expected advance"),
        }
    }

    #[test]
    fn deposit_confirmation_completes_the_workflow() {
        let event = envelope(DEPOSIT_COMPLETED, serde_json::json!({ "amount": "12000" }));

        let transition = LoanOriginationWorkflow::on_event(
            &LoanOriginationState::Approved,
            &application_context(),
            &event,
        );

        assert!(matches!(
            transition,
            Transition::Advance { next: LoanOriginationState::Disbursed, .. }
        ));
    }

    #[test]
    fn disbursement_failure_compensates_the_collateral_hold() {
        let event = envelope(
            DISBURSEMENT_FAILED,
            serde_json::json!({ "loan_id": "L-1", "reason": "account frozen" }),
        );

        let transition = LoanOriginationWorkflow::on_event(
            &LoanOriginationState::Approved,
            &application_context(),
            &event,
        );

        match transition {
            Transition::Advance { next, effects, .. } => {
                assert_eq!(next, LoanOriginationState::Failed);
                assert!(effects.iter().any(|e| matches!(
                    e,
                    SideEffect::Compensate { command_type, .. } if command_type == "release_hold"
                )));
                assert!(effects.iter().any(|e| matches!(
                    e,
                    SideEffect::Publish { event_type, .. } if event_type == LOAN_CANCELLED
                )));
            }
            Transition::Ignore => panic!("expected advance"),
        }
    }

    #[test]
    fn unknown_pairs_are_ignored() {
        // A replayed credit check result after approval must do nothing.
        let replay = envelope(CREDIT_CHECK_PASSED, serde_json::json!({ "loan_id": "L-1" }));
        assert_eq!(
            LoanOriginationWorkflow::on_event(
                &LoanOriginationState::Approved,
                &application_context(),
                &replay,
            ),
            Transition::Ignore
        );

        // Terminal states ignore everything.
        let late = envelope(DEPOSIT_COMPLETED, serde_json::json!({}));
        assert_eq!(
            LoanOriginationWorkflow::on_event(
                &LoanOriginationState::Disbursed,
                &application_context(),
                &late,
            ),
            Transition::Ignore
        );
    }

    #[test]
    fn timeout_drives_pending_states_to_failed() {
        let transition = LoanOriginationWorkflow::on_timeout(
            &LoanOriginationState::CreditCheckPending,
            &application_context(),
        );
        match transition {
            Transition::Advance { next, effects, .. } => {
                assert_eq!(next, LoanOriginationState::Failed);
                assert!(matches!(
                    &effects[0],
                    SideEffect::Publish { event_type, .. } if event_type == LOAN_CANCELLED
                ));
            }
            Transition::Ignore => panic!("expected advance"),
        }

        assert_eq!(
            LoanOriginationWorkflow::on_timeout(
                &LoanOriginationState::Disbursed,
                &application_context()
            ),
            Transition::Ignore
        );
    }

    #[test]
    fn non_terminal_states_carry_deadlines() {
        assert!(LoanOriginationWorkflow::deadline(&LoanOriginationState::Submitted).is_some());
        assert!(
            LoanOriginationWorkflow::deadline(&LoanOriginationState::CreditCheckPending).is_some()
        );
        assert!(LoanOriginationWorkflow::deadline(&LoanOriginationState::Disbursed).is_none());
    }
}
