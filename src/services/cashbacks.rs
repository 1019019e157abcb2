use crate::{
    blockchain::{bounded, BlockchainGateway, TransactionVerification, TransferReceipt},
    cache::{keys, CacheInvalidator},
    config::SettlementConfig,
    db::{DbPool, UnitOfWork},
    entities::{
        cashback::{self, CashbackStatus, Entity as CashbackEntity},
        order::Entity as OrderEntity,
        payment::{Entity as PaymentEntity, PaymentStatus},
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{page_params, totals_by_status, Page, StatusTotals},
    state_machine::ensure_transition,
};
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseTransaction, EntityTrait, Iterable,
    PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// Reason recorded on cashbacks swept by [`CashbackService::cancel_expired_cashbacks`].
pub const EXPIRED_REASON: &str = "Cashback expired before it could be processed";

#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct CreateCashbackInput {
    /// Fixed payout. Derived from `percentage` of the payment when absent.
    pub amount: Option<Decimal>,
    pub percentage: Option<Decimal>,
    #[validate(length(min = 1, max = 16))]
    pub currency: Option<String>,
    /// Defaults to the wallet recorded on the order.
    #[validate(length(min = 1, max = 128))]
    pub wallet_address: Option<String>,
    #[validate(length(min = 1, max = 32))]
    pub blockchain_network: Option<String>,
    pub eligible_at: Option<DateTime<Utc>>,
    pub expires_at: Option<DateTime<Utc>>,
    pub metadata: Option<Value>,
}

/// Per-record outcome of a batch sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CashbackProcessResult {
    pub cashback_id: Uuid,
    pub success: bool,
    pub status: Option<CashbackStatus>,
    pub tx_hash: Option<String>,
    pub error: Option<String>,
}

impl CashbackProcessResult {
    fn from_outcome(cashback_id: Uuid, outcome: Result<cashback::Model, ServiceError>) -> Self {
        match outcome {
            Ok(model) => Self {
                cashback_id,
                success: model.status == CashbackStatus::Completed,
                status: Some(model.status),
                tx_hash: model.tx_hash,
                error: model.failure_reason,
            },
            Err(e) => Self {
                cashback_id,
                success: false,
                status: None,
                tx_hash: None,
                error: Some(e.to_string()),
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CashbackStatistics {
    pub total_count: u64,
    pub total_amount: Decimal,
    pub completed_amount: Decimal,
    pub outstanding_amount: Decimal,
    pub by_status: Vec<StatusTotals<CashbackStatus>>,
}

/// Cashback state machine and blockchain settlement.
#[derive(Clone)]
pub struct CashbackService {
    db_pool: Arc<DbPool>,
    cache: CacheInvalidator,
    event_sender: Option<Arc<EventSender>>,
    gateway: Arc<dyn BlockchainGateway>,
    settings: SettlementConfig,
}

async fn save_cashback<C: ConnectionTrait>(
    conn: &C,
    am: cashback::ActiveModel,
    id: Uuid,
    version: i32,
) -> Result<cashback::Model, ServiceError> {
    CashbackEntity::update(am)
        .filter(cashback::Column::Version.eq(version))
        .exec(conn)
        .await
        .map_err(|e| ServiceError::from_guarded_update(e, id))
}

/// Applies a status change to `current`, checked against the cashback table.
fn transition(
    current: &cashback::Model,
    next: CashbackStatus,
    now: DateTime<Utc>,
) -> Result<cashback::ActiveModel, ServiceError> {
    ensure_transition(current.status, next)?;
    let mut am: cashback::ActiveModel = current.clone().into();
    am.status = Set(next);
    am.updated_at = Set(now);
    am.version = Set(current.version + 1);
    Ok(am)
}

impl CashbackService {
    pub fn new(
        db_pool: Arc<DbPool>,
        cache: CacheInvalidator,
        event_sender: Option<Arc<EventSender>>,
        gateway: Arc<dyn BlockchainGateway>,
        settings: SettlementConfig,
    ) -> Self {
        Self {
            db_pool,
            cache,
            event_sender,
            gateway,
            settings,
        }
    }

    async fn publish(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            sender.publish(event).await;
        }
    }

    async fn after_status_change(&self, before: CashbackStatus, after: &cashback::Model) {
        self.cache.invalidate_cashback(after.id, after.user_id).await;
        self.publish(Event::CashbackStatusChanged {
            cashback_id: after.id,
            old_status: before,
            new_status: after.status,
        })
        .await;
    }

    /// Cache invalidation and event for a cashback whose creating transaction has committed.
    pub(crate) async fn announce_created(&self, created: &cashback::Model) {
        metrics::counter!("stateset_cashbacks.created", 1);
        self.cache
            .invalidate_cashback(created.id, created.user_id)
            .await;
        self.publish(Event::CashbackCreated {
            cashback_id: created.id,
            payment_id: created.payment_id,
            amount: created.amount,
        })
        .await;
    }

    /// Creates a pending cashback for a paid payment.
    #[instrument(skip(self, input), fields(payment_id = %payment_id))]
    pub async fn create_cashback(
        &self,
        payment_id: Uuid,
        input: CreateCashbackInput,
    ) -> Result<cashback::Model, ServiceError> {
        let created = self.create_cashback_with(None, payment_id, input).await?;
        self.announce_created(&created).await;
        Ok(created)
    }

    /// Inserts the cashback inside `outer` when given, otherwise in its own transaction.
    /// Cache and event side effects are left to the caller.
    pub(crate) async fn create_cashback_with(
        &self,
        outer: Option<&DatabaseTransaction>,
        payment_id: Uuid,
        input: CreateCashbackInput,
    ) -> Result<cashback::Model, ServiceError> {
        input.validate()?;

        let uow = UnitOfWork::begin(&self.db_pool, outer).await?;
        let conn = uow.conn();

        let payment = PaymentEntity::find_by_id(payment_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Payment {} not found", payment_id)))?;
        if payment.status != PaymentStatus::Paid {
            return Err(ServiceError::ValidationError(format!(
                "Cashback requires a paid payment, payment is {}",
                payment.status
            )));
        }

        let existing = CashbackEntity::find()
            .filter(cashback::Column::PaymentId.eq(payment_id))
            .count(conn)
            .await?;
        if existing > 0 {
            return Err(ServiceError::ValidationError(
                "Cashback already exists for this payment".to_string(),
            ));
        }

        let order_id = payment.order_id.ok_or_else(|| {
            ServiceError::ValidationError("Payment is not linked to an order".to_string())
        })?;
        let order = OrderEntity::find_by_id(order_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let percentage = input
            .percentage
            .unwrap_or(self.settings.cashback_percentage);
        if percentage < Decimal::ZERO || percentage > Decimal::ONE_HUNDRED {
            return Err(ServiceError::ValidationError(
                "Cashback percentage must be between 0 and 100".to_string(),
            ));
        }
        let amount = input
            .amount
            .unwrap_or_else(|| payment.amount * percentage / Decimal::ONE_HUNDRED);
        if amount <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Cashback amount must be positive".to_string(),
            ));
        }

        let wallet_address = input
            .wallet_address
            .or(order.cashback_wallet_address)
            .ok_or_else(|| {
                ServiceError::ValidationError("A cashback wallet address is required".to_string())
            })?;
        let network = input
            .blockchain_network
            .or(order.cashback_network)
            .unwrap_or_else(|| self.settings.default_network.clone());

        let now = Utc::now();
        let eligible_at = input
            .eligible_at
            .unwrap_or(now + Duration::days(self.settings.cashback_eligible_after_days));
        let expires_at = input
            .expires_at
            .unwrap_or(now + Duration::days(self.settings.cashback_expires_after_days));
        if eligible_at > expires_at {
            return Err(ServiceError::ValidationError(
                "Cashback cannot expire before it becomes eligible".to_string(),
            ));
        }

        let created = cashback::ActiveModel {
            id: Set(Uuid::new_v4()),
            payment_id: Set(payment_id),
            user_id: Set(order.user_id),
            order_id: Set(order_id),
            amount: Set(amount),
            percentage: Set(percentage),
            currency: Set(input
                .currency
                .unwrap_or_else(|| self.settings.cashback_currency.clone())),
            wallet_address: Set(wallet_address),
            blockchain_network: Set(network),
            status: Set(CashbackStatus::Pending),
            tx_hash: Set(None),
            block_number: Set(None),
            gas_used: Set(None),
            gas_fee: Set(None),
            eligible_at: Set(eligible_at),
            expires_at: Set(expires_at),
            failure_reason: Set(None),
            retry_count: Set(0),
            last_retry_at: Set(None),
            processed_at: Set(None),
            metadata: Set(input.metadata),
            created_at: Set(now),
            updated_at: Set(now),
            version: Set(1),
        }
        .insert(conn)
        .await?;

        uow.commit().await?;

        info!(
            cashback_id = %created.id,
            payment_id = %payment_id,
            amount = %created.amount,
            eligible_at = %created.eligible_at,
            "Cashback created"
        );
        Ok(created)
    }

    /// Submits one pending, eligible cashback to the gateway and records the result.
    ///
    /// The claim (`PENDING -> PROCESSING`) is committed before the gateway is called, and the
    /// gateway outcome is written in a separate step, so a failed or timed out transfer leaves
    /// the record `FAILED` rather than `PROCESSING`. A gateway failure is not an error of this
    /// call: the returned record carries the `FAILED` status and reason.
    #[instrument(skip(self), fields(cashback_id = %cashback_id))]
    pub async fn process_cashback(&self, cashback_id: Uuid) -> Result<cashback::Model, ServiceError> {
        let current = self.find(cashback_id).await?;
        let now = Utc::now();

        if current.status != CashbackStatus::Pending {
            return Err(ServiceError::ValidationError(format!(
                "Cashback is not pending (status: {})",
                current.status
            )));
        }
        if now < current.eligible_at {
            return Err(ServiceError::ValidationError(format!(
                "Cashback is not eligible until {}",
                current.eligible_at
            )));
        }
        if now > current.expires_at {
            return Err(ServiceError::ValidationError(
                "Cashback has expired".to_string(),
            ));
        }

        let claimed = save_cashback(
            &*self.db_pool,
            transition(&current, CashbackStatus::Processing, now)?,
            cashback_id,
            current.version,
        )
        .await?;
        self.after_status_change(CashbackStatus::Pending, &claimed)
            .await;

        let started = Instant::now();
        let outcome = bounded(
            self.settings.gateway_timeout(),
            self.gateway.send_cashback(
                &claimed.wallet_address,
                claimed.amount,
                &claimed.blockchain_network,
            ),
        )
        .await;
        metrics::histogram!("stateset_cashbacks.gateway_duration", started.elapsed());

        let now = Utc::now();
        let mut am = transition(
            &claimed,
            if outcome.is_ok() {
                CashbackStatus::Completed
            } else {
                CashbackStatus::Failed
            },
            now,
        )?;
        match &outcome {
            Ok(receipt) => {
                am.tx_hash = Set(Some(receipt.tx_hash.clone()));
                am.block_number = Set(receipt.block_number);
                am.gas_used = Set(receipt.gas_used.clone());
                am.gas_fee = Set(receipt.gas_fee);
                am.processed_at = Set(Some(now));
                am.failure_reason = Set(None);
            }
            Err(e) => {
                am.failure_reason = Set(Some(e.to_string()));
                am.retry_count = Set(claimed.retry_count + 1);
            }
        }

        let settled = match save_cashback(&*self.db_pool, am, cashback_id, claimed.version).await
        {
            Ok(settled) => settled,
            Err(e) => {
                error!(
                    cashback_id = %cashback_id,
                    error = %e,
                    gateway_ok = outcome.is_ok(),
                    "Failed to record gateway outcome"
                );
                if let Ok(receipt) = &outcome {
                    self.keep_unrecorded_transfer(cashback_id, receipt).await;
                }
                return Err(e);
            }
        };

        match &outcome {
            Ok(receipt) => {
                metrics::counter!("stateset_cashbacks.completed", 1);
                info!(cashback_id = %cashback_id, tx_hash = %receipt.tx_hash, "Cashback settled");
            }
            Err(e) => {
                metrics::counter!("stateset_cashbacks.failed", 1);
                warn!(cashback_id = %cashback_id, error = %e, retry_count = settled.retry_count, "Cashback transfer failed");
            }
        }

        self.after_status_change(CashbackStatus::Processing, &settled)
            .await;
        Ok(settled)
    }

    /// Stores the hash of a transfer whose settlement could not be written, so the record
    /// stays reconcilable and the expiry sweep leaves it alone.
    async fn keep_unrecorded_transfer(&self, cashback_id: Uuid, receipt: &TransferReceipt) {
        let kept = CashbackEntity::update_many()
            .set(cashback::ActiveModel {
                tx_hash: Set(Some(receipt.tx_hash.clone())),
                block_number: Set(receipt.block_number),
                updated_at: Set(Utc::now()),
                ..Default::default()
            })
            .filter(cashback::Column::Id.eq(cashback_id))
            .filter(cashback::Column::TxHash.is_null())
            .exec(&*self.db_pool)
            .await;
        match kept {
            Ok(_) => warn!(
                cashback_id = %cashback_id,
                tx_hash = %receipt.tx_hash,
                "Transfer sent but settlement not recorded, tx hash kept for reconciliation"
            ),
            Err(e) => error!(
                cashback_id = %cashback_id,
                tx_hash = %receipt.tx_hash,
                error = %e,
                "Transfer sent but neither settlement nor tx hash could be recorded"
            ),
        }
        metrics::counter!("stateset_cashbacks.unrecorded_transfers", 1);
    }

    /// Processes up to `limit` eligible pending cashbacks, oldest first.
    #[instrument(skip(self))]
    pub async fn process_pending_cashbacks(
        &self,
        limit: u64,
    ) -> Result<Vec<CashbackProcessResult>, ServiceError> {
        let now = Utc::now();
        let batch = CashbackEntity::find()
            .filter(cashback::Column::Status.eq(CashbackStatus::Pending))
            .filter(cashback::Column::EligibleAt.lte(now))
            .filter(cashback::Column::ExpiresAt.gte(now))
            .order_by_asc(cashback::Column::CreatedAt)
            .limit(limit)
            .all(&*self.db_pool)
            .await?;

        let mut results = Vec::with_capacity(batch.len());
        for candidate in batch {
            let outcome = self.process_cashback(candidate.id).await;
            if let Err(e) = &outcome {
                warn!(cashback_id = %candidate.id, error = %e, "Skipping cashback in batch");
            }
            results.push(CashbackProcessResult::from_outcome(candidate.id, outcome));
        }

        info!(
            processed = results.len(),
            succeeded = results.iter().filter(|r| r.success).count(),
            "Pending cashback batch finished"
        );
        Ok(results)
    }

    /// Returns up to `limit` failed cashbacks with retries left to `PENDING` and processes them
    /// again, least recently touched first.
    #[instrument(skip(self))]
    pub async fn retry_failed_cashbacks(
        &self,
        max_retries: i32,
        limit: u64,
    ) -> Result<Vec<CashbackProcessResult>, ServiceError> {
        let retryable = CashbackEntity::find()
            .filter(cashback::Column::Status.eq(CashbackStatus::Failed))
            .filter(cashback::Column::RetryCount.lt(max_retries))
            .order_by_asc(cashback::Column::UpdatedAt)
            .limit(limit)
            .all(&*self.db_pool)
            .await?;

        let mut results = Vec::with_capacity(retryable.len());
        for failed in retryable {
            let outcome = match self.reset_for_retry(&failed).await {
                Ok(_) => self.process_cashback(failed.id).await,
                Err(e) => Err(e),
            };
            if let Err(e) = &outcome {
                warn!(cashback_id = %failed.id, error = %e, "Cashback retry did not run");
            }
            results.push(CashbackProcessResult::from_outcome(failed.id, outcome));
        }
        Ok(results)
    }

    async fn reset_for_retry(&self, failed: &cashback::Model) -> Result<cashback::Model, ServiceError> {
        let now = Utc::now();
        let mut am = transition(failed, CashbackStatus::Pending, now)?;
        am.last_retry_at = Set(Some(now));
        am.failure_reason = Set(None);
        let reset = save_cashback(&*self.db_pool, am, failed.id, failed.version).await?;
        info!(cashback_id = %failed.id, retry_count = failed.retry_count, "Cashback queued for retry");
        self.after_status_change(CashbackStatus::Failed, &reset).await;
        Ok(reset)
    }

    /// Cancels pending or in-flight cashbacks whose window has closed. Returns the number cancelled.
    #[instrument(skip(self))]
    pub async fn cancel_expired_cashbacks(&self) -> Result<u64, ServiceError> {
        let now = Utc::now();
        let expired = CashbackEntity::find()
            .filter(
                cashback::Column::Status
                    .is_in([CashbackStatus::Pending, CashbackStatus::Processing]),
            )
            .filter(cashback::Column::ExpiresAt.lt(now))
            // a hash means funds already left
            .filter(cashback::Column::TxHash.is_null())
            .all(&*self.db_pool)
            .await?;

        let mut cancelled = 0;
        for stale in expired {
            let result = match transition(&stale, CashbackStatus::Cancelled, now) {
                Ok(mut am) => {
                    am.failure_reason = Set(Some(EXPIRED_REASON.to_string()));
                    save_cashback(&*self.db_pool, am, stale.id, stale.version).await
                }
                Err(e) => Err(e),
            };
            match result {
                Ok(updated) => {
                    cancelled += 1;
                    self.after_status_change(stale.status, &updated).await;
                }
                Err(e) => {
                    warn!(cashback_id = %stale.id, error = %e, "Failed to cancel expired cashback")
                }
            }
        }

        metrics::counter!("stateset_cashbacks.expired", cancelled);
        info!(cancelled, "Expired cashbacks cancelled");
        Ok(cancelled)
    }

    /// Asks the gateway about the cashback's transfer.
    #[instrument(skip(self), fields(cashback_id = %cashback_id))]
    pub async fn verify_cashback_transaction(
        &self,
        cashback_id: Uuid,
    ) -> Result<TransactionVerification, ServiceError> {
        let cashback = self.find(cashback_id).await?;
        let tx_hash = cashback.tx_hash.as_deref().ok_or_else(|| {
            ServiceError::ValidationError("Cashback has no transaction hash".to_string())
        })?;

        let verification = bounded(
            self.settings.gateway_timeout(),
            self.gateway
                .verify_transaction(tx_hash, &cashback.blockchain_network),
        )
        .await?;
        Ok(verification)
    }

    async fn find(&self, cashback_id: Uuid) -> Result<cashback::Model, ServiceError> {
        CashbackEntity::find_by_id(cashback_id)
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cashback {} not found", cashback_id)))
    }

    #[instrument(skip(self), fields(cashback_id = %cashback_id))]
    pub async fn get_cashback(&self, cashback_id: Uuid) -> Result<cashback::Model, ServiceError> {
        let db = &*self.db_pool;
        self.cache
            .read_through(&keys::cashback(cashback_id), || async {
                CashbackEntity::find_by_id(cashback_id)
                    .one(db)
                    .await
                    .map_err(ServiceError::from)
            })
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cashback {} not found", cashback_id)))
    }

    /// Cashbacks owed to `user_id`, newest first.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn get_user_cashbacks(
        &self,
        user_id: Uuid,
        page: u64,
        limit: u64,
    ) -> Result<Page<cashback::Model>, ServiceError> {
        let (page, limit) = page_params(page, limit);
        let db = &*self.db_pool;
        let found = self
            .cache
            .read_through(&keys::cashbacks_by_user(user_id, page, limit), || async {
                let paginator = CashbackEntity::find()
                    .filter(cashback::Column::UserId.eq(user_id))
                    .order_by_desc(cashback::Column::CreatedAt)
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

    /// Totals per status, across all users or for one user.
    #[instrument(skip(self))]
    pub async fn get_cashback_statistics(
        &self,
        user_id: Option<Uuid>,
    ) -> Result<CashbackStatistics, ServiceError> {
        let key = match user_id {
            Some(user_id) => keys::cashbacks_stats_for_user(user_id),
            None => keys::CASHBACKS_STATS.to_string(),
        };
        let db = &*self.db_pool;
        let stats = self
            .cache
            .read_through(&key, || async {
                let mut query = CashbackEntity::find()
                    .select_only()
                    .column(cashback::Column::Status)
                    .column(cashback::Column::Amount);
                if let Some(user_id) = user_id {
                    query = query.filter(cashback::Column::UserId.eq(user_id));
                }
                let rows: Vec<(CashbackStatus, Decimal)> = query.into_tuple().all(db).await?;

                let by_status = totals_by_status(CashbackStatus::iter(), &rows);
                let sum_of = |wanted: &[CashbackStatus]| -> Decimal {
                    by_status
                        .iter()
                        .filter(|t| wanted.contains(&t.status))
                        .map(|t| t.amount)
                        .sum()
                };
                Ok::<_, ServiceError>(Some(CashbackStatistics {
                    total_count: rows.len() as u64,
                    total_amount: rows.iter().map(|(_, amount)| *amount).sum(),
                    completed_amount: sum_of(&[CashbackStatus::Completed]),
                    outstanding_amount: sum_of(&[
                        CashbackStatus::Pending,
                        CashbackStatus::Processing,
                        CashbackStatus::Failed,
                    ]),
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
    use crate::blockchain::{BlockchainError, MockBlockchainGateway, TransferReceipt};
    use crate::cache::InMemoryCache;
    use crate::test_support::{memory_db, seed_paid_payment};
    use assert_matches::assert_matches;
    use rust_decimal_macros::dec;

    fn service(db: Arc<DbPool>, gateway: MockBlockchainGateway) -> CashbackService {
        CashbackService::new(
            db,
            CacheInvalidator::new(Arc::new(InMemoryCache::new()), None),
            None,
            Arc::new(gateway),
            SettlementConfig::default(),
        )
    }

    fn eligible_now() -> CreateCashbackInput {
        CreateCashbackInput {
            eligible_at: Some(Utc::now() - Duration::days(1)),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn amount_defaults_to_percentage_of_payment() {
        let db = Arc::new(memory_db().await);
        let payment = seed_paid_payment(&db, dec!(200000)).await;
        let svc = service(db.clone(), MockBlockchainGateway::new());

        let created = svc
            .create_cashback(
                payment.id,
                CreateCashbackInput {
                    percentage: Some(dec!(2.5)),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(created.amount, dec!(5000));
        assert_eq!(created.status, CashbackStatus::Pending);
        assert!(created.eligible_at <= created.expires_at);
    }

    #[tokio::test]
    async fn second_cashback_for_payment_is_rejected() {
        let db = Arc::new(memory_db().await);
        let payment = seed_paid_payment(&db, dec!(1000)).await;
        let svc = service(db, MockBlockchainGateway::new());

        svc.create_cashback(payment.id, Default::default())
            .await
            .unwrap();
        let err = svc
            .create_cashback(payment.id, Default::default())
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::ValidationError(msg) if msg.contains("already exists"));
    }

    #[tokio::test]
    async fn successful_transfer_completes_cashback() {
        let db = Arc::new(memory_db().await);
        let payment = seed_paid_payment(&db, dec!(1000)).await;

        let mut gateway = MockBlockchainGateway::new();
        gateway
            .expect_send_cashback()
            .times(1)
            .returning(|_, _, _| {
                Ok(TransferReceipt {
                    tx_hash: "0xabc".to_string(),
                    block_number: Some(42),
                    gas_used: Some("21000".to_string()),
                    gas_fee: Some(dec!(0.000021)),
                })
            });
        let svc = service(db, gateway);

        let created = svc.create_cashback(payment.id, eligible_now()).await.unwrap();
        let settled = svc.process_cashback(created.id).await.unwrap();

        assert_eq!(settled.status, CashbackStatus::Completed);
        assert_eq!(settled.tx_hash.as_deref(), Some("0xabc"));
        assert_eq!(settled.block_number, Some(42));
        assert!(settled.processed_at.is_some());
        assert_eq!(settled.version, created.version + 2);
    }

    #[tokio::test]
    async fn gateway_failure_marks_failed_and_counts_retry() {
        let db = Arc::new(memory_db().await);
        let payment = seed_paid_payment(&db, dec!(1000)).await;

        let mut gateway = MockBlockchainGateway::new();
        gateway
            .expect_send_cashback()
            .returning(|_, _, _| Err(BlockchainError::Unavailable("rpc down".to_string())));
        let svc = service(db, gateway);

        let created = svc.create_cashback(payment.id, eligible_now()).await.unwrap();
        let failed = svc.process_cashback(created.id).await.unwrap();

        assert_eq!(failed.status, CashbackStatus::Failed);
        assert_eq!(failed.retry_count, 1);
        assert!(failed.failure_reason.unwrap().contains("rpc down"));
        assert!(failed.tx_hash.is_none());
    }

    #[tokio::test]
    async fn ineligible_cashback_is_not_submitted() {
        let db = Arc::new(memory_db().await);
        let payment = seed_paid_payment(&db, dec!(1000)).await;
        // No expectations: any gateway call fails the test.
        let svc = service(db, MockBlockchainGateway::new());

        let created = svc
            .create_cashback(payment.id, Default::default())
            .await
            .unwrap();
        let err = svc.process_cashback(created.id).await.unwrap_err();
        assert_matches!(err, ServiceError::ValidationError(msg) if msg.contains("not eligible"));
    }

    #[tokio::test]
    async fn verify_requires_transaction_hash() {
        let db = Arc::new(memory_db().await);
        let payment = seed_paid_payment(&db, dec!(1000)).await;
        let svc = service(db, MockBlockchainGateway::new());

        let created = svc
            .create_cashback(payment.id, Default::default())
            .await
            .unwrap();
        let err = svc
            .verify_cashback_transaction(created.id)
            .await
            .unwrap_err();
        assert_matches!(err, ServiceError::ValidationError(_));
    }
}
