//! Property-based tests for the transition tables and input normalization.

use proptest::prelude::*;
use proptest::sample::select;
use sea_orm::Iterable;
use serde_json::json;
use stateset_settlement::{
    entities::{CashbackStatus, OrderStatus, PaymentStatus},
    errors::ServiceError,
    services::{page_params, MAX_PAGE_SIZE},
    state_machine::{ensure_transition, Lifecycle},
    webhooks::{map_status, normalize},
};

fn order_status() -> impl Strategy<Value = OrderStatus> {
    select(OrderStatus::iter().collect::<Vec<_>>())
}

fn payment_status() -> impl Strategy<Value = PaymentStatus> {
    select(PaymentStatus::iter().collect::<Vec<_>>())
}

fn cashback_status() -> impl Strategy<Value = CashbackStatus> {
    select(CashbackStatus::iter().collect::<Vec<_>>())
}

/// The helper agrees with the table for every pair and never allows a self-transition.
fn check_pair<S: Lifecycle + std::fmt::Debug>(from: S, to: S) -> Result<(), TestCaseError> {
    let result = ensure_transition(from, to);
    prop_assert_eq!(result.is_ok(), from.can_transition_to(to));
    prop_assert!(!from.can_transition_to(from), "{:?} loops to itself", from);
    if from.is_terminal() {
        prop_assert!(result.is_err());
    }
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(256))]

    #[test]
    fn order_transitions_follow_table(from in order_status(), to in order_status()) {
        check_pair(from, to)?;
        if let Err(e) = ensure_transition(from, to) {
            prop_assert!(matches!(e, ServiceError::InvalidTransition(_)));
        }
    }

    #[test]
    fn payment_transitions_follow_table(from in payment_status(), to in payment_status()) {
        check_pair(from, to)?;
        if let Err(e) = ensure_transition(from, to) {
            prop_assert!(matches!(e, ServiceError::ValidationError(_)));
        }
    }

    #[test]
    fn cashback_transitions_follow_table(from in cashback_status(), to in cashback_status()) {
        check_pair(from, to)?;
        if let Err(e) = ensure_transition(from, to) {
            prop_assert!(matches!(e, ServiceError::ValidationError(_)));
        }
    }

    #[test]
    fn cancellation_is_only_possible_before_shipping(from in order_status()) {
        let allowed = ensure_transition(from, OrderStatus::Cancelled).is_ok();
        let early = matches!(
            from,
            OrderStatus::Pending | OrderStatus::Confirmed | OrderStatus::Processing
        );
        prop_assert_eq!(allowed, early);
    }

    #[test]
    fn page_params_stay_in_bounds(page in any::<u64>(), limit in any::<u64>()) {
        let (page, limit) = page_params(page, limit);
        prop_assert!(page >= 1);
        prop_assert!((1..=MAX_PAGE_SIZE).contains(&limit));
    }

    #[test]
    fn unknown_outcomes_stay_pending(raw in "[a-z]{1,12}") {
        prop_assume!(!["success", "completed", "failed", "error"].contains(&raw.as_str()));
        prop_assert_eq!(map_status(&raw), PaymentStatus::Pending);
    }

    #[test]
    fn momo_only_succeeds_on_zero(code in -100i64..10_000) {
        let hook = normalize("momo", &json!({"orderId": "M-1", "resultCode": code})).unwrap();
        let expected = if code == 0 { PaymentStatus::Paid } else { PaymentStatus::Failed };
        prop_assert_eq!(hook.payment_status(), expected);
    }
}

#[test]
fn terminal_states_are_exactly_the_documented_ones() {
    let terminal: Vec<_> = OrderStatus::iter().filter(|s| s.is_terminal()).collect();
    assert_eq!(
        terminal,
        vec![
            OrderStatus::Completed,
            OrderStatus::Cancelled,
            OrderStatus::Refunded
        ]
    );
    let terminal: Vec<_> = PaymentStatus::iter().filter(|s| s.is_terminal()).collect();
    assert_eq!(terminal, vec![PaymentStatus::Failed, PaymentStatus::Refunded]);
    let terminal: Vec<_> = CashbackStatus::iter().filter(|s| s.is_terminal()).collect();
    assert_eq!(
        terminal,
        vec![CashbackStatus::Completed, CashbackStatus::Cancelled]
    );
}
