use crate::{
    cache::{keys, CacheInvalidator},
    config::SettlementConfig,
    db::{DbPool, UnitOfWork},
    entities::{
        cashback,
        order::{Entity as OrderEntity, OrderStatus},
        payment::{self, Entity as PaymentEntity, PaymentStatus},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{
        cashbacks::{CashbackService, CreateCashbackInput},
        orders::mirror_payment_status,
        page_params, totals_by_status, Page, StatusTotals,
    },
    state_machine::ensure_transition,
    webhooks,
};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, Iterable, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// Failure reason recorded by the expiry sweep.
pub const EXPIRED_REASON: &str = "Payment has expired";

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreatePaymentInput {
    #[validate(length(min = 1, max = 32, message = "Payment method is required"))]
    pub method: String,
    /// Must equal the order total when given.
    pub amount: Option<Decimal>,
    #[validate(length(min = 3, max = 8))]
    pub currency: Option<String>,
    #[validate(length(min = 1, max = 255))]
    pub transaction_id: Option<String>,
    pub expired_at: Option<DateTime<Utc>>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdatePaymentStatusInput {
    pub status: PaymentStatus,
    pub transaction_id: Option<String>,
    pub gateway_response: Option<Value>,
    pub failure_reason: Option<String>,
    pub note: Option<String>,
}

impl UpdatePaymentStatusInput {
    pub fn to(status: PaymentStatus) -> Self {
        Self {
            status,
            transaction_id: None,
            gateway_response: None,
            failure_reason: None,
            note: None,
        }
    }

    pub fn failed(reason: impl Into<String>) -> Self {
        Self {
            failure_reason: Some(reason.into()),
            ..Self::to(PaymentStatus::Failed)
        }
    }
}

/// Result of a gateway callback. `applied` is false for no-ops and replays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookOutcome {
    pub payment: payment::Model,
    pub applied: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentStatistics {
    pub total_count: u64,
    pub paid_amount: Decimal,
    pub by_status: Vec<StatusTotals<PaymentStatus>>,
}

/// Payment state machine, gateway webhooks and the cashback hand-off.
#[derive(Clone)]
pub struct PaymentService {
    db_pool: Arc<DbPool>,
    cache: CacheInvalidator,
    event_sender: Option<Arc<EventSender>>,
    cashbacks: CashbackService,
    settings: SettlementConfig,
}

async fn save_payment<C: ConnectionTrait>(
    conn: &C,
    am: payment::ActiveModel,
    id: Uuid,
    version: i32,
) -> Result<payment::Model, ServiceError> {
    PaymentEntity::update(am)
        .filter(payment::Column::Version.eq(version))
        .exec(conn)
        .await
        .map_err(|e| ServiceError::from_guarded_update(e, id))
}

impl PaymentService {
    pub fn new(
        db_pool: Arc<DbPool>,
        cache: CacheInvalidator,
        event_sender: Option<Arc<EventSender>>,
        cashbacks: CashbackService,
        settings: SettlementConfig,
    ) -> Self {
        Self {
            db_pool,
            cache,
            event_sender,
            cashbacks,
            settings,
        }
    }

    async fn publish(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            sender.publish(event).await;
        }
    }

    async fn invalidate(&self, payment: &payment::Model) {
        self.cache
            .invalidate_payment(payment.id, payment.order_id)
            .await;
    }

    async fn invalidate_order(&self, order_id: Uuid) {
        if let Ok(Some(order)) = OrderEntity::find_by_id(order_id).one(&*self.db_pool).await {
            self.cache
                .invalidate_order(order.id, order.user_id, order.shop_id)
                .await;
        }
    }

    /// Opens a pending payment for an order.
    #[instrument(skip(self, input), fields(order_id = %order_id, method = %input.method))]
    pub async fn create_payment(
        &self,
        order_id: Uuid,
        input: CreatePaymentInput,
    ) -> Result<payment::Model, ServiceError> {
        input.validate()?;

        let uow = UnitOfWork::begin(&self.db_pool, None).await?;
        let conn = uow.conn();

        let order = OrderEntity::find_by_id(order_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        if matches!(order.status, OrderStatus::Cancelled | OrderStatus::Refunded) {
            return Err(ServiceError::ValidationError(format!(
                "Cannot pay for an order in status {}",
                order.status
            )));
        }

        let live = PaymentEntity::find()
            .filter(payment::Column::OrderId.eq(order_id))
            .filter(payment::Column::Status.ne(PaymentStatus::Failed))
            .count(conn)
            .await?;
        if live > 0 {
            return Err(ServiceError::ValidationError(
                "Order already has an active payment".to_string(),
            ));
        }

        if let Some(amount) = input.amount {
            if amount != order.total_amount {
                return Err(ServiceError::ValidationError(format!(
                    "Payment amount {} does not match order total {}",
                    amount, order.total_amount
                )));
            }
        }

        let now = Utc::now();
        let created = payment::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(Some(order_id)),
            amount: Set(order.total_amount),
            currency: Set(input.currency.unwrap_or_else(|| order.currency.clone())),
            method: Set(input.method),
            status: Set(PaymentStatus::Pending),
            transaction_id: Set(input.transaction_id),
            gateway_response: Set(None),
            expired_at: Set(input
                .expired_at
                .unwrap_or(now + Duration::minutes(self.settings.payment_expiry_minutes))),
            paid_at: Set(None),
            failed_at: Set(None),
            failure_reason: Set(None),
            note: Set(input.note),
            created_at: Set(now),
            updated_at: Set(now),
            version: Set(1),
        }
        .insert(conn)
        .await?;

        mirror_payment_status(conn, order_id, PaymentStatus::Pending, now).await?;
        uow.commit().await?;

        metrics::counter!("stateset_payments.created", 1);
        info!(payment_id = %created.id, amount = %created.amount, expired_at = %created.expired_at, "Payment created");

        self.invalidate(&created).await;
        self.invalidate_order(order_id).await;
        self.publish(Event::PaymentCreated {
            payment_id: created.id,
            order_id,
        })
        .await;
        Ok(created)
    }

    /// Moves a payment along its lifecycle and mirrors the new status onto the order.
    /// A payment reaching `PAID` creates the order's cashback in the same transaction.
    #[instrument(skip(self, input), fields(payment_id = %payment_id, status = %input.status))]
    pub async fn update_payment_status(
        &self,
        payment_id: Uuid,
        input: UpdatePaymentStatusInput,
    ) -> Result<payment::Model, ServiceError> {
        let uow = UnitOfWork::begin(&self.db_pool, None).await?;
        let conn = uow.conn();

        let current = PaymentEntity::find_by_id(payment_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Payment {} not found", payment_id)))?;
        let next = input.status;
        ensure_transition(current.status, next)?;

        let now = Utc::now();
        let mut am: payment::ActiveModel = current.clone().into();
        am.status = Set(next);
        am.updated_at = Set(now);
        am.version = Set(current.version + 1);
        if let Some(transaction_id) = input.transaction_id {
            am.transaction_id = Set(Some(transaction_id));
        }
        if let Some(response) = input.gateway_response {
            am.gateway_response = Set(Some(response));
        }
        if let Some(note) = input.note {
            am.note = Set(Some(note));
        }
        match next {
            PaymentStatus::Paid => am.paid_at = Set(Some(now)),
            PaymentStatus::Failed => {
                am.failed_at = Set(Some(now));
                am.failure_reason = Set(input.failure_reason);
            }
            PaymentStatus::Pending | PaymentStatus::Refunded => {}
        }
        let updated = save_payment(conn, am, payment_id, current.version).await?;

        let mut cashback: Option<cashback::Model> = None;
        if let Some(order_id) = updated.order_id {
            let order = mirror_payment_status(conn, order_id, next, now).await?;
            if next == PaymentStatus::Paid && order.cashback_wallet_address.is_some() {
                let percentage = self.settings.cashback_percentage;
                if updated.amount * percentage / Decimal::ONE_HUNDRED <= Decimal::ZERO {
                    info!(
                        payment_id = %payment_id,
                        amount = %updated.amount,
                        %percentage,
                        "Payment earns no cashback, skipping"
                    );
                } else {
                    cashback = Some(
                        self.cashbacks
                            .create_cashback_with(
                                Some(conn),
                                payment_id,
                                CreateCashbackInput {
                                    percentage: Some(percentage),
                                    ..Default::default()
                                },
                            )
                            .await?,
                    );
                }
            }
        }

        uow.commit().await?;

        metrics::counter!("stateset_payments.transitions", 1, "to" => next.to_string());
        info!(payment_id = %payment_id, from = %current.status, to = %next, "Payment status updated");

        self.invalidate(&updated).await;
        if let Some(order_id) = updated.order_id {
            self.invalidate_order(order_id).await;
        }
        self.publish(Event::PaymentStatusChanged {
            payment_id,
            order_id: updated.order_id,
            old_status: current.status,
            new_status: next,
        })
        .await;
        if let Some(created) = &cashback {
            self.cashbacks.announce_created(created).await;
        }
        Ok(updated)
    }

    /// Applies a gateway callback. Pending outcomes and replays of the current status are no-ops.
    #[instrument(skip(self, payload), fields(gateway = %gateway))]
    pub async fn handle_payment_webhook(
        &self,
        gateway: &str,
        payload: &Value,
    ) -> Result<WebhookOutcome, ServiceError> {
        let hook = webhooks::normalize(gateway, payload)?;

        let current = PaymentEntity::find()
            .filter(payment::Column::TransactionId.eq(hook.transaction_id.as_str()))
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "No payment for transaction {}",
                    hook.transaction_id
                ))
            })?;

        let next = hook.payment_status();
        if next == PaymentStatus::Pending || next == current.status {
            info!(payment_id = %current.id, status = %current.status, reported = %next, "Webhook requires no change");
            return Ok(WebhookOutcome {
                payment: current,
                applied: false,
            });
        }

        let failure_reason = match next {
            PaymentStatus::Failed => Some(
                hook.message
                    .clone()
                    .unwrap_or_else(|| format!("Rejected by {}", hook.gateway)),
            ),
            _ => None,
        };
        let payment = self
            .update_payment_status(
                current.id,
                UpdatePaymentStatusInput {
                    status: next,
                    transaction_id: None,
                    gateway_response: Some(hook.raw),
                    failure_reason,
                    note: None,
                },
            )
            .await?;
        Ok(WebhookOutcome {
            payment,
            applied: true,
        })
    }

    /// Abandons a pending payment.
    #[instrument(skip(self, reason), fields(payment_id = %payment_id))]
    pub async fn cancel_payment(
        &self,
        payment_id: Uuid,
        reason: Option<String>,
    ) -> Result<payment::Model, ServiceError> {
        let current = self.find(payment_id).await?;
        if current.status != PaymentStatus::Pending {
            return Err(ServiceError::ValidationError(format!(
                "Only pending payments can be cancelled, payment is {}",
                current.status
            )));
        }
        self.update_payment_status(
            payment_id,
            UpdatePaymentStatusInput::failed(
                reason.unwrap_or_else(|| "Cancelled by user".to_string()),
            ),
        )
        .await
    }

    /// Fails every pending payment past its expiry. Returns the number expired.
    #[instrument(skip(self))]
    pub async fn process_expired_payments(&self) -> Result<u64, ServiceError> {
        let now = Utc::now();
        let expired = PaymentEntity::find()
            .filter(payment::Column::Status.eq(PaymentStatus::Pending))
            .filter(payment::Column::ExpiredAt.lt(now))
            .order_by_asc(payment::Column::ExpiredAt)
            .all(&*self.db_pool)
            .await?;

        let mut count = 0;
        for stale in expired {
            match self
                .update_payment_status(stale.id, UpdatePaymentStatusInput::failed(EXPIRED_REASON))
                .await
            {
                Ok(_) => count += 1,
                Err(e) => warn!(payment_id = %stale.id, error = %e, "Failed to expire payment"),
            }
        }

        metrics::counter!("stateset_payments.expired", count);
        info!(expired = count, "Expired payments processed");
        Ok(count)
    }

    async fn find(&self, payment_id: Uuid) -> Result<payment::Model, ServiceError> {
        PaymentEntity::find_by_id(payment_id)
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Payment {} not found", payment_id)))
    }

    #[instrument(skip(self), fields(payment_id = %payment_id))]
    pub async fn get_payment(&self, payment_id: Uuid) -> Result<payment::Model, ServiceError> {
        let db = &*self.db_pool;
        self.cache
            .read_through(&keys::payment(payment_id), || async {
                PaymentEntity::find_by_id(payment_id)
                    .one(db)
                    .await
                    .map_err(ServiceError::from)
            })
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Payment {} not found", payment_id)))
    }

    /// Latest payment of an order.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn get_payment_by_order(
        &self,
        order_id: Uuid,
    ) -> Result<payment::Model, ServiceError> {
        let db = &*self.db_pool;
        self.cache
            .read_through(&keys::payment_by_order(order_id), || async {
                PaymentEntity::find()
                    .filter(payment::Column::OrderId.eq(order_id))
                    .order_by_desc(payment::Column::CreatedAt)
                    .one(db)
                    .await
                    .map_err(ServiceError::from)
            })
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("No payment found for order {}", order_id))
            })
    }

    #[instrument(skip(self))]
    pub async fn list_payments(
        &self,
        page: u64,
        limit: u64,
    ) -> Result<Page<payment::Model>, ServiceError> {
        let (page, limit) = page_params(page, limit);
        let db = &*self.db_pool;
        let found = self
            .cache
            .read_through(&keys::payments_list(page, limit), || async {
                let paginator = PaymentEntity::find()
                    .order_by_desc(payment::Column::CreatedAt)
                    .paginate(db, limit);
                let total = paginator.num_items().await?;
                let items = paginator.fetch_page(page - 1).await?;
                Ok::<_, ServiceError>(Some(Page {
                    items,
                    total,
                    page,
                    limit,
                }))
            })
            .await?;
        Ok(found.unwrap_or(Page {
            items: Vec::new(),
            total: 0,
            page,
            limit,
        }))
    }

    #[instrument(skip(self))]
    pub async fn get_payment_statistics(&self) -> Result<PaymentStatistics, ServiceError> {
        let db = &*self.db_pool;
        let stats = self
            .cache
            .read_through(keys::PAYMENTS_STATS, || async {
                let rows: Vec<(PaymentStatus, Decimal)> = PaymentEntity::find()
                    .select_only()
                    .column(payment::Column::Status)
                    .column(payment::Column::Amount)
                    .into_tuple()
                    .all(db)
                    .await?;
                let by_status = totals_by_status(PaymentStatus::iter(), &rows);
                let paid_amount = by_status
                    .iter()
                    .filter(|t| t.status == PaymentStatus::Paid)
                    .map(|t| t.amount)
                    .sum();
                Ok::<_, ServiceError>(Some(PaymentStatistics {
                    total_count: rows.len() as u64,
                    paid_amount,
                    by_status,
                }))
            })
            .await?;
        stats.ok_or_else(|| ServiceError::InternalError("statistics unavailable".to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failed_input_carries_reason() {
        let input = UpdatePaymentStatusInput::failed(EXPIRED_REASON);
        assert_eq!(input.status, PaymentStatus::Failed);
        assert_eq!(input.failure_reason.as_deref(), Some("Payment has expired"));
        assert!(input.gateway_response.is_none());
    }
}
