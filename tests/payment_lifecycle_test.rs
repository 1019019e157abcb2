//! Payments: creation rules, status mirroring, webhooks, expiry and the cashback hand-off.

mod common;

use assert_matches::assert_matches;
use chrono::{Duration, Utc};
use common::{TestApp, WALLET};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter};
use serde_json::json;
use stateset_settlement::{
    entities::{cashback, Cashback, CashbackStatus, Order, OrderStatus, PaymentStatus},
    errors::ServiceError,
    services::{
        cashbacks::CreateCashbackInput,
        orders::UpdateOrderStatusInput,
        payments::{CreatePaymentInput, UpdatePaymentStatusInput, EXPIRED_REASON},
    },
};
use uuid::Uuid;

fn vnpay(reference: Option<&str>) -> CreatePaymentInput {
    CreatePaymentInput {
        method: "vnpay".to_string(),
        amount: None,
        currency: None,
        transaction_id: reference.map(str::to_string),
        expired_at: None,
        note: None,
    }
}

#[tokio::test]
async fn payment_takes_order_total_and_default_expiry() {
    let app = TestApp::new().await;
    let placed = app.place_order(Uuid::new_v4(), dec!(125000), 2, None).await;

    let before = Utc::now();
    let payment = app
        .payments
        .create_payment(placed.order.id, vnpay(None))
        .await
        .unwrap();

    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_eq!(payment.amount, dec!(250000));
    assert_eq!(payment.order_id, Some(placed.order.id));
    assert!(payment.expired_at >= before + Duration::minutes(14));
    assert!(payment.expired_at <= Utc::now() + Duration::minutes(16));
}

#[tokio::test]
async fn mismatched_amount_is_rejected() {
    let app = TestApp::new().await;
    let placed = app.place_order(Uuid::new_v4(), dec!(10000), 1, None).await;

    let mut input = vnpay(None);
    input.amount = Some(dec!(9999));
    let err = app
        .payments
        .create_payment(placed.order.id, input)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(msg) if msg.contains("does not match"));
}

#[tokio::test]
async fn one_live_payment_per_order() {
    let app = TestApp::new().await;
    let placed = app.place_order(Uuid::new_v4(), dec!(10000), 1, None).await;

    let first = app
        .payments
        .create_payment(placed.order.id, vnpay(None))
        .await
        .unwrap();
    let err = app
        .payments
        .create_payment(placed.order.id, vnpay(None))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));

    // A failed attempt frees the order for a new one.
    app.payments
        .cancel_payment(first.id, Some("switching method".to_string()))
        .await
        .unwrap();
    let retry = app
        .payments
        .create_payment(placed.order.id, vnpay(None))
        .await
        .unwrap();
    assert_ne!(retry.id, first.id);

    let latest = app
        .payments
        .get_payment_by_order(placed.order.id)
        .await
        .unwrap();
    assert_eq!(latest.id, retry.id);
}

#[tokio::test]
async fn missing_order_is_not_found() {
    let app = TestApp::new().await;
    let err = app
        .payments
        .create_payment(Uuid::new_v4(), vnpay(None))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));
}

#[tokio::test]
async fn cancelled_orders_cannot_be_paid() {
    let app = TestApp::new().await;
    let buyer = Uuid::new_v4();
    let placed = app.place_order(buyer, dec!(10000), 1, None).await;
    app.orders
        .cancel_order(placed.order.id, buyer, None)
        .await
        .unwrap();

    let err = app
        .payments
        .create_payment(placed.order.id, vnpay(None))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));
}

#[tokio::test]
async fn paid_status_is_mirrored_onto_order_and_cashback_follows() {
    let mut app = TestApp::new().await;
    let buyer = Uuid::new_v4();
    let placed = app.place_order(buyer, dec!(100000), 1, Some(WALLET)).await;
    let payment = app
        .payments
        .create_payment(placed.order.id, vnpay(Some("TXN-PAID-1")))
        .await
        .unwrap();

    let paid = app
        .payments
        .update_payment_status(payment.id, UpdatePaymentStatusInput::to(PaymentStatus::Paid))
        .await
        .unwrap();
    assert_eq!(paid.status, PaymentStatus::Paid);
    assert!(paid.paid_at.is_some());

    let order = app
        .orders
        .get_order_by_id(placed.order.id, buyer)
        .await
        .unwrap()
        .order;
    assert_eq!(order.payment_status, PaymentStatus::Paid);
    assert!(order.paid_at.is_some());
    assert_eq!(order.status, OrderStatus::Pending);

    let created = Cashback::find()
        .filter(cashback::Column::PaymentId.eq(payment.id))
        .one(&*app.db)
        .await
        .unwrap()
        .expect("cashback created on payment");
    assert_eq!(created.status, CashbackStatus::Pending);
    assert_eq!(created.user_id, buyer);
    assert_eq!(created.wallet_address, WALLET);
    assert_eq!(
        created.amount,
        dec!(100000) * app.settings.cashback_percentage / dec!(100)
    );

    let events = app.drain_events();
    let paid_at = events
        .iter()
        .position(|e| *e == "payment_status_changed")
        .unwrap();
    let cashback_at = events.iter().position(|e| *e == "cashback_created").unwrap();
    assert!(paid_at < cashback_at);
}

#[tokio::test]
async fn free_order_with_wallet_is_paid_without_cashback() {
    let app = TestApp::new().await;
    let placed = app.place_order(Uuid::new_v4(), dec!(0), 1, Some(WALLET)).await;
    assert_eq!(placed.order.total_amount, Decimal::ZERO);
    let payment = app
        .payments
        .create_payment(placed.order.id, vnpay(None))
        .await
        .unwrap();

    let paid = app
        .payments
        .update_payment_status(payment.id, UpdatePaymentStatusInput::to(PaymentStatus::Paid))
        .await
        .unwrap();

    assert_eq!(paid.status, PaymentStatus::Paid);
    assert_eq!(Cashback::find().count(&*app.db).await.unwrap(), 0);

    // An explicit request on a zero amount is still refused.
    let err = app
        .cashbacks
        .create_cashback(
            payment.id,
            CreateCashbackInput {
                percentage: Some(dec!(5)),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(msg) if msg.contains("must be positive"));
}

#[tokio::test]
async fn manual_cashback_after_payment_uses_requested_percentage() {
    let app = TestApp::new().await;
    let placed = app.place_order(Uuid::new_v4(), dec!(100000), 1, None).await;
    let payment = app
        .payments
        .create_payment(placed.order.id, vnpay(None))
        .await
        .unwrap();
    app.payments
        .update_payment_status(payment.id, UpdatePaymentStatusInput::to(PaymentStatus::Paid))
        .await
        .unwrap();

    // No wallet on the order, so nothing was created automatically.
    assert_eq!(Cashback::find().count(&*app.db).await.unwrap(), 0);

    let created = app
        .cashbacks
        .create_cashback(
            payment.id,
            CreateCashbackInput {
                percentage: Some(dec!(5)),
                wallet_address: Some(WALLET.to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(created.amount, dec!(5000));

    let err = app
        .cashbacks
        .create_cashback(
            payment.id,
            CreateCashbackInput {
                wallet_address: Some(WALLET.to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(msg) if msg.contains("already exists"));
}

#[tokio::test]
async fn cashback_requires_paid_payment() {
    let app = TestApp::new().await;
    let placed = app.place_order(Uuid::new_v4(), dec!(100000), 1, Some(WALLET)).await;
    let payment = app
        .payments
        .create_payment(placed.order.id, vnpay(None))
        .await
        .unwrap();

    let err = app
        .cashbacks
        .create_cashback(payment.id, CreateCashbackInput::default())
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));
}

#[tokio::test]
async fn terminal_payments_reject_further_transitions() {
    let app = TestApp::new().await;
    let placed = app.place_order(Uuid::new_v4(), dec!(10000), 1, None).await;
    let payment = app
        .payments
        .create_payment(placed.order.id, vnpay(None))
        .await
        .unwrap();
    app.payments
        .update_payment_status(payment.id, UpdatePaymentStatusInput::failed("declined"))
        .await
        .unwrap();

    let err = app
        .payments
        .update_payment_status(payment.id, UpdatePaymentStatusInput::to(PaymentStatus::Paid))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(msg) if msg.contains("Cannot transition payment"));

    let stored = app.payments.get_payment(payment.id).await.unwrap();
    assert_eq!(stored.status, PaymentStatus::Failed);
    assert_eq!(stored.failure_reason.as_deref(), Some("declined"));
    assert!(stored.failed_at.is_some());
}

#[tokio::test]
async fn webhook_applies_once_and_replays_are_noops() {
    let app = TestApp::new().await;
    let placed = app.place_order(Uuid::new_v4(), dec!(50000), 1, Some(WALLET)).await;
    let payment = app
        .payments
        .create_payment(placed.order.id, vnpay(Some("VNP-778899")))
        .await
        .unwrap();
    let payload = json!({
        "vnp_TxnRef": "VNP-778899",
        "vnp_ResponseCode": "00",
        "vnp_Message": "Approved"
    });

    let first = app
        .payments
        .handle_payment_webhook("vnpay", &payload)
        .await
        .unwrap();
    assert!(first.applied);
    assert_eq!(first.payment.status, PaymentStatus::Paid);
    assert_eq!(first.payment.gateway_response, Some(payload.clone()));

    let replay = app
        .payments
        .handle_payment_webhook("vnpay", &payload)
        .await
        .unwrap();
    assert!(!replay.applied);
    assert_eq!(replay.payment.version, first.payment.version);
    assert_eq!(replay.payment.paid_at, first.payment.paid_at);

    let order = Order::find_by_id(placed.order.id)
        .one(&*app.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(order.payment_status, PaymentStatus::Paid);
    assert_eq!(order.paid_at, first.payment.paid_at);

    let cashbacks = Cashback::find()
        .filter(cashback::Column::PaymentId.eq(payment.id))
        .count(&*app.db)
        .await
        .unwrap();
    assert_eq!(cashbacks, 1);
}

#[tokio::test]
async fn declined_webhook_fails_payment_with_gateway_message() {
    let app = TestApp::new().await;
    let placed = app.place_order(Uuid::new_v4(), dec!(50000), 1, None).await;
    app.payments
        .create_payment(placed.order.id, vnpay(Some("MOMO-1")))
        .await
        .unwrap();

    let outcome = app
        .payments
        .handle_payment_webhook(
            "momo",
            &json!({"orderId": "MOMO-1", "resultCode": 1006, "message": "User denied"}),
        )
        .await
        .unwrap();

    assert!(outcome.applied);
    assert_eq!(outcome.payment.status, PaymentStatus::Failed);
    assert_eq!(outcome.payment.failure_reason.as_deref(), Some("User denied"));
}

#[tokio::test]
async fn webhook_for_unknown_reference_is_not_found() {
    let app = TestApp::new().await;
    let err = app
        .payments
        .handle_payment_webhook("zalopay", &json!({"apptransid": "nope", "status": 1}))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::NotFound(_));
}

#[tokio::test]
async fn expiry_sweep_fails_only_overdue_payments() {
    let app = TestApp::new().await;
    let stale_order = app.place_order(Uuid::new_v4(), dec!(100000), 1, None).await;
    let fresh_order = app.place_order(Uuid::new_v4(), dec!(100000), 1, None).await;

    let mut overdue = vnpay(None);
    overdue.expired_at = Some(Utc::now() - Duration::seconds(1));
    let stale = app
        .payments
        .create_payment(stale_order.order.id, overdue)
        .await
        .unwrap();
    let fresh = app
        .payments
        .create_payment(fresh_order.order.id, vnpay(None))
        .await
        .unwrap();

    let expired = app.payments.process_expired_payments().await.unwrap();
    assert_eq!(expired, 1);

    let stale = app.payments.get_payment(stale.id).await.unwrap();
    assert_eq!(stale.status, PaymentStatus::Failed);
    assert_eq!(stale.failure_reason.as_deref(), Some(EXPIRED_REASON));
    assert!(stale.failed_at.is_some());
    assert_eq!(
        app.payments.get_payment(fresh.id).await.unwrap().status,
        PaymentStatus::Pending
    );

    // A second sweep finds nothing left to expire.
    assert_eq!(app.payments.process_expired_payments().await.unwrap(), 0);
}

#[tokio::test]
async fn cancel_only_applies_to_pending_payments() {
    let app = TestApp::new().await;
    let placed = app.place_order(Uuid::new_v4(), dec!(10000), 1, None).await;
    let payment = app
        .payments
        .create_payment(placed.order.id, vnpay(None))
        .await
        .unwrap();
    app.payments
        .update_payment_status(payment.id, UpdatePaymentStatusInput::to(PaymentStatus::Paid))
        .await
        .unwrap();

    let err = app
        .payments
        .cancel_payment(payment.id, None)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::ValidationError(_));
}

#[tokio::test]
async fn statistics_and_listing() {
    let app = TestApp::new().await;
    for amount in [dec!(10000), dec!(20000), dec!(30000)] {
        let placed = app.place_order(Uuid::new_v4(), amount, 1, None).await;
        let payment = app
            .payments
            .create_payment(placed.order.id, vnpay(None))
            .await
            .unwrap();
        if amount > dec!(10000) {
            app.payments
                .update_payment_status(payment.id, UpdatePaymentStatusInput::to(PaymentStatus::Paid))
                .await
                .unwrap();
        }
    }

    let stats = app.payments.get_payment_statistics().await.unwrap();
    assert_eq!(stats.total_count, 3);
    assert_eq!(stats.paid_amount, dec!(50000));
    let pending = stats
        .by_status
        .iter()
        .find(|t| t.status == PaymentStatus::Pending)
        .unwrap();
    assert_eq!(pending.count, 1);

    let page = app.payments.list_payments(1, 2).await.unwrap();
    assert_eq!(page.total, 3);
    assert_eq!(page.items.len(), 2);
    assert_eq!(page.limit, 2);
}

#[tokio::test]
async fn refund_after_delivery_keeps_payment_and_order_in_step() {
    let app = TestApp::new().await;
    let buyer = Uuid::new_v4();
    let placed = app.place_order(buyer, dec!(10000), 1, None).await;
    let payment = app
        .payments
        .create_payment(placed.order.id, vnpay(None))
        .await
        .unwrap();
    app.payments
        .update_payment_status(payment.id, UpdatePaymentStatusInput::to(PaymentStatus::Paid))
        .await
        .unwrap();
    for status in [
        OrderStatus::Confirmed,
        OrderStatus::Processing,
        OrderStatus::Shipping,
        OrderStatus::Delivered,
        OrderStatus::Refunded,
    ] {
        app.orders
            .update_order_status(placed.order.id, UpdateOrderStatusInput { status, note: None }, None)
            .await
            .unwrap();
    }
    let refunded = app
        .payments
        .update_payment_status(payment.id, UpdatePaymentStatusInput::to(PaymentStatus::Refunded))
        .await
        .unwrap();
    assert_eq!(refunded.status, PaymentStatus::Refunded);

    let order = app
        .orders
        .get_order_by_id(placed.order.id, buyer)
        .await
        .unwrap()
        .order;
    assert_eq!(order.status, OrderStatus::Refunded);
    assert_eq!(order.payment_status, PaymentStatus::Refunded);
}
