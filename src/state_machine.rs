//! Static transition tables for the order, payment and cashback lifecycles.
//!
//! Every status write goes through [`ensure_transition`] before anything is persisted.

use crate::entities::{CashbackStatus, OrderStatus, PaymentStatus};
use crate::errors::ServiceError;
use std::fmt;

/// A status enum with a fixed table of legal successor states.
pub trait Lifecycle: Copy + Eq + fmt::Display + 'static {
    /// Noun used in rejection messages.
    const ENTITY: &'static str;

    /// States reachable from `self` in one step.
    fn targets(self) -> &'static [Self];

    fn can_transition_to(self, next: Self) -> bool {
        self.targets().contains(&next)
    }

    fn is_terminal(self) -> bool {
        self.targets().is_empty()
    }

    /// Error raised for a transition outside the table.
    fn rejection(message: String) -> ServiceError {
        ServiceError::InvalidTransition(message)
    }
}

impl Lifecycle for OrderStatus {
    const ENTITY: &'static str = "order";

    fn targets(self) -> &'static [Self] {
        use OrderStatus::*;
        match self {
            Pending => &[Confirmed, Cancelled],
            Confirmed => &[Processing, Cancelled],
            Processing => &[Shipping, Cancelled],
            Shipping => &[Delivered],
            Delivered => &[Completed, Refunded],
            Completed | Cancelled | Refunded => &[],
        }
    }
}

impl Lifecycle for PaymentStatus {
    const ENTITY: &'static str = "payment";

    fn targets(self) -> &'static [Self] {
        use PaymentStatus::*;
        match self {
            Pending => &[Paid, Failed],
            Paid => &[Refunded],
            Failed | Refunded => &[],
        }
    }

    fn rejection(message: String) -> ServiceError {
        ServiceError::ValidationError(message)
    }
}

impl Lifecycle for CashbackStatus {
    const ENTITY: &'static str = "cashback";

    fn targets(self) -> &'static [Self] {
        use CashbackStatus::*;
        match self {
            Pending => &[Processing, Cancelled],
            Processing => &[Completed, Failed, Cancelled],
            Failed => &[Pending],
            Completed | Cancelled => &[],
        }
    }

    fn rejection(message: String) -> ServiceError {
        ServiceError::ValidationError(message)
    }
}

/// Checks `from -> to` against the table of `S`.
pub fn ensure_transition<S: Lifecycle>(from: S, to: S) -> Result<(), ServiceError> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(S::rejection(format!(
            "Cannot transition {} from {} to {}",
            S::ENTITY,
            from,
            to
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use sea_orm::Iterable;

    #[test]
    fn order_happy_path_is_legal() {
        let path = [
            OrderStatus::Pending,
            OrderStatus::Confirmed,
            OrderStatus::Processing,
            OrderStatus::Shipping,
            OrderStatus::Delivered,
            OrderStatus::Completed,
        ];
        for pair in path.windows(2) {
            assert!(ensure_transition(pair[0], pair[1]).is_ok(), "{:?}", pair);
        }
    }

    #[test]
    fn order_rejection_is_invalid_transition() {
        let err = ensure_transition(OrderStatus::Pending, OrderStatus::Shipping).unwrap_err();
        assert_matches!(err, ServiceError::InvalidTransition(msg) if msg.contains("PENDING to SHIPPING"));
    }

    #[test]
    fn shipping_orders_can_no_longer_be_cancelled() {
        assert!(!OrderStatus::Shipping.can_transition_to(OrderStatus::Cancelled));
        assert!(!OrderStatus::Delivered.can_transition_to(OrderStatus::Cancelled));
    }

    #[test]
    fn payment_rejection_is_validation_error() {
        let err = ensure_transition(PaymentStatus::Failed, PaymentStatus::Paid).unwrap_err();
        assert_matches!(err, ServiceError::ValidationError(_));
    }

    #[test]
    fn failed_cashback_can_only_return_to_pending() {
        assert_eq!(CashbackStatus::Failed.targets(), &[CashbackStatus::Pending]);
        assert!(!CashbackStatus::Failed.is_terminal());
    }

    #[test]
    fn terminal_states_have_no_successors() {
        let terminal_orders: Vec<_> = OrderStatus::iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(
            terminal_orders,
            vec![
                OrderStatus::Completed,
                OrderStatus::Cancelled,
                OrderStatus::Refunded
            ]
        );

        let terminal_payments: Vec<_> = PaymentStatus::iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(
            terminal_payments,
            vec![PaymentStatus::Failed, PaymentStatus::Refunded]
        );

        let terminal_cashbacks: Vec<_> = CashbackStatus::iter().filter(|s| s.is_terminal()).collect();
        assert_eq!(
            terminal_cashbacks,
            vec![CashbackStatus::Completed, CashbackStatus::Cancelled]
        );
    }

    #[test]
    fn no_state_transitions_to_itself() {
        assert!(OrderStatus::iter().all(|s| !s.can_transition_to(s)));
        assert!(PaymentStatus::iter().all(|s| !s.can_transition_to(s)));
        assert!(CashbackStatus::iter().all(|s| !s.can_transition_to(s)));
    }
}
