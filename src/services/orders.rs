use crate::{
    cache::{keys, CacheInvalidator},
    config::SettlementConfig,
    db::{DbPool, UnitOfWork},
    entities::{
        cart, cart_item,
        order::{self, Entity as OrderEntity, OrderStatus},
        order_item::{self, Entity as OrderItemEntity},
        order_status_history::{self, Entity as OrderStatusHistoryEntity},
        product, product_variant, shop, PaymentStatus,
    },
    errors::ServiceError,
    events::{Event, EventSender},
    services::{page_params, Page},
    state_machine::ensure_transition,
};
use chrono::{DateTime, Utc};
use rand::{distributions::Alphanumeric, Rng};
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseTransaction,
    EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

/// Checkout details supplied with a cart conversion.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateOrderInput {
    #[validate(length(min = 1, max = 255, message = "Recipient name is required"))]
    pub recipient_name: String,
    #[validate(length(min = 6, max = 32, message = "Recipient phone must be 6-32 characters"))]
    pub recipient_phone: String,
    #[validate(length(min = 1, message = "Shipping address is required"))]
    pub shipping_address: String,
    pub note: Option<String>,
    #[serde(default)]
    pub shipping_fee: Decimal,
    #[serde(default)]
    pub discount: Decimal,
    #[validate(length(min = 3, max = 8, message = "Currency must be 3-8 characters"))]
    pub currency: Option<String>,
    /// Wallet that receives cashback once the order is paid.
    #[validate(length(min = 1, max = 128))]
    pub cashback_wallet_address: Option<String>,
    pub cashback_network: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateOrderStatusInput {
    pub status: OrderStatus,
    pub note: Option<String>,
}

/// An order with its line items and audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderDetails {
    pub order: order::Model,
    pub items: Vec<order_item::Model>,
    pub history: Vec<order_status_history::Model>,
}

/// Cart conversion and the order state machine.
#[derive(Clone)]
pub struct OrderService {
    db_pool: Arc<DbPool>,
    cache: CacheInvalidator,
    event_sender: Option<Arc<EventSender>>,
    settings: SettlementConfig,
}

/// Generates a human-facing order number such as `ORD-20240131-7KQ2ZD`.
pub fn generate_order_number(now: DateTime<Utc>) -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|c| char::from(c).to_ascii_uppercase())
        .collect();
    format!("ORD-{}-{}", now.format("%Y%m%d"), suffix)
}

/// Timestamp column stamped when an order enters `status`.
fn stamp_transition(am: &mut order::ActiveModel, status: OrderStatus, now: DateTime<Utc>) {
    match status {
        OrderStatus::Confirmed => am.confirmed_at = Set(Some(now)),
        OrderStatus::Shipping => am.shipped_at = Set(Some(now)),
        OrderStatus::Delivered => am.delivered_at = Set(Some(now)),
        OrderStatus::Completed => am.completed_at = Set(Some(now)),
        OrderStatus::Cancelled => am.cancelled_at = Set(Some(now)),
        OrderStatus::Refunded => am.refunded_at = Set(Some(now)),
        OrderStatus::Pending | OrderStatus::Processing => {}
    }
}

/// Writes `am` only if the stored row still carries `version`.
pub(crate) async fn save_order<C: ConnectionTrait>(
    conn: &C,
    am: order::ActiveModel,
    id: Uuid,
    version: i32,
) -> Result<order::Model, ServiceError> {
    OrderEntity::update(am)
        .filter(order::Column::Version.eq(version))
        .exec(conn)
        .await
        .map_err(|e| ServiceError::from_guarded_update(e, id))
}

/// Mirrors a payment status onto its order inside the caller's transaction.
pub(crate) async fn mirror_payment_status(
    conn: &DatabaseTransaction,
    order_id: Uuid,
    status: PaymentStatus,
    now: DateTime<Utc>,
) -> Result<order::Model, ServiceError> {
    let current = OrderEntity::find_by_id(order_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

    let mut am: order::ActiveModel = current.clone().into();
    am.payment_status = Set(status);
    if status == PaymentStatus::Paid {
        am.paid_at = Set(Some(now));
    }
    am.updated_at = Set(now);
    am.version = Set(current.version + 1);
    save_order(conn, am, order_id, current.version).await
}

struct CartLine {
    variant: product_variant::Model,
    product: product::Model,
    quantity: i32,
}

impl OrderService {
    pub fn new(
        db_pool: Arc<DbPool>,
        cache: CacheInvalidator,
        event_sender: Option<Arc<EventSender>>,
        settings: SettlementConfig,
    ) -> Self {
        Self {
            db_pool,
            cache,
            event_sender,
            settings,
        }
    }

    async fn publish(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            sender.publish(event).await;
        }
    }

    /// Converts the user's cart into a pending order, reserving stock and emptying the cart.
    #[instrument(skip(self, input), fields(user_id = %user_id))]
    pub async fn create_order_from_cart(
        &self,
        user_id: Uuid,
        input: CreateOrderInput,
    ) -> Result<OrderDetails, ServiceError> {
        input.validate()?;
        if input.shipping_fee < Decimal::ZERO || input.discount < Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Shipping fee and discount cannot be negative".to_string(),
            ));
        }

        let uow = UnitOfWork::begin(&self.db_pool, None).await?;
        let conn = uow.conn();

        let cart = cart::Entity::find()
            .filter(cart::Column::UserId.eq(user_id))
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::ValidationError("Cart is empty".to_string()))?;

        let cart_items = cart_item::Entity::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .order_by_asc(cart_item::Column::CreatedAt)
            .all(conn)
            .await?;
        if cart_items.is_empty() {
            return Err(ServiceError::ValidationError("Cart is empty".to_string()));
        }

        let lines = self.resolve_cart_lines(conn, &cart_items).await?;

        let shop_ids: BTreeSet<Uuid> = lines.iter().map(|l| l.product.shop_id).collect();
        if shop_ids.len() > 1 {
            return Err(ServiceError::ValidationError(
                "cross-shop cart: all items must belong to the same shop".to_string(),
            ));
        }
        let shop_id = lines[0].product.shop_id;
        shop::Entity::find_by_id(shop_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Shop {} not found", shop_id)))?;

        // Duplicate cart lines for one variant share its stock.
        let mut requested: HashMap<Uuid, i32> = HashMap::new();
        for line in &lines {
            *requested.entry(line.variant.id).or_default() += line.quantity;
        }
        for line in &lines {
            let wanted = requested[&line.variant.id];
            if line.variant.stock < wanted {
                return Err(ServiceError::ValidationError(format!(
                    "Insufficient stock for {} ({}): requested {}, available {}",
                    line.product.name, line.variant.name, wanted, line.variant.stock
                )));
            }
        }

        let subtotal: Decimal = lines
            .iter()
            .map(|l| l.variant.price * Decimal::from(l.quantity))
            .sum();
        let total_amount = subtotal + input.shipping_fee - input.discount;
        if total_amount < Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Discount exceeds order value".to_string(),
            ));
        }

        let now = Utc::now();
        let order_id = Uuid::new_v4();
        let order = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(generate_order_number(now)),
            user_id: Set(user_id),
            shop_id: Set(shop_id),
            status: Set(OrderStatus::Pending),
            payment_status: Set(PaymentStatus::Pending),
            subtotal: Set(subtotal),
            shipping_fee: Set(input.shipping_fee),
            discount: Set(input.discount),
            total_amount: Set(total_amount),
            currency: Set(input
                .currency
                .clone()
                .unwrap_or_else(|| self.settings.default_currency.clone())),
            recipient_name: Set(input.recipient_name),
            recipient_phone: Set(input.recipient_phone),
            shipping_address: Set(input.shipping_address),
            note: Set(input.note),
            cashback_wallet_address: Set(input.cashback_wallet_address),
            cashback_network: Set(input.cashback_network),
            cancel_reason: Set(None),
            confirmed_at: Set(None),
            shipped_at: Set(None),
            delivered_at: Set(None),
            completed_at: Set(None),
            cancelled_at: Set(None),
            refunded_at: Set(None),
            paid_at: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
            version: Set(1),
        }
        .insert(conn)
        .await
        .map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to insert order");
            ServiceError::DatabaseError(e)
        })?;

        let mut items = Vec::with_capacity(lines.len());
        for line in &lines {
            let item = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(line.product.id),
                variant_id: Set(line.variant.id),
                product_name: Set(line.product.name.clone()),
                variant_name: Set(line.variant.name.clone()),
                image_url: Set(line
                    .variant
                    .image_url
                    .clone()
                    .or_else(|| line.product.image_url.clone())),
                quantity: Set(line.quantity),
                unit_price: Set(line.variant.price),
                total_price: Set(line.variant.price * Decimal::from(line.quantity)),
                created_at: Set(now),
            }
            .insert(conn)
            .await?;
            items.push(item);

            reserve_stock(conn, line.variant.id, line.quantity, now).await?;
        }

        cart_item::Entity::delete_many()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .exec(conn)
            .await?;

        let created = append_history(
            conn,
            order_id,
            OrderStatus::Pending,
            Some("Order created"),
            Some(user_id),
            now,
        )
        .await?;

        uow.commit().await?;

        metrics::counter!("stateset_orders.created", 1);
        info!(order_id = %order_id, order_number = %order.order_number, total = %order.total_amount, "Order created from cart");

        self.cache
            .invalidate_order(order_id, order.user_id, order.shop_id)
            .await;
        self.publish(Event::OrderCreated {
            order_id,
            user_id,
            total_amount: order.total_amount,
        })
        .await;

        Ok(OrderDetails {
            order,
            items,
            history: vec![created],
        })
    }

    async fn resolve_cart_lines(
        &self,
        conn: &DatabaseTransaction,
        cart_items: &[cart_item::Model],
    ) -> Result<Vec<CartLine>, ServiceError> {
        let mut lines = Vec::with_capacity(cart_items.len());
        for item in cart_items {
            if item.quantity <= 0 {
                return Err(ServiceError::ValidationError(format!(
                    "Invalid quantity {} for cart item {}",
                    item.quantity, item.id
                )));
            }
            let variant = product_variant::Entity::find_by_id(item.variant_id)
                .one(conn)
                .await?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("Product variant {} not found", item.variant_id))
                })?;
            let product = product::Entity::find_by_id(variant.product_id)
                .one(conn)
                .await?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("Product {} not found", variant.product_id))
                })?;
            lines.push(CartLine {
                variant,
                product,
                quantity: item.quantity,
            });
        }
        Ok(lines)
    }

    /// Moves an order along its lifecycle. Cancellation returns reserved stock.
    #[instrument(skip(self, input), fields(order_id = %order_id, status = %input.status))]
    pub async fn update_order_status(
        &self,
        order_id: Uuid,
        input: UpdateOrderStatusInput,
        actor: Option<Uuid>,
    ) -> Result<order::Model, ServiceError> {
        self.transition(order_id, input.status, input.note, actor, None)
            .await
    }

    async fn transition(
        &self,
        order_id: Uuid,
        next: OrderStatus,
        note: Option<String>,
        actor: Option<Uuid>,
        cancel_reason: Option<String>,
    ) -> Result<order::Model, ServiceError> {
        let uow = UnitOfWork::begin(&self.db_pool, None).await?;
        let conn = uow.conn();

        let current = OrderEntity::find_by_id(order_id)
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        ensure_transition(current.status, next)?;

        let now = Utc::now();
        let mut am: order::ActiveModel = current.clone().into();
        am.status = Set(next);
        am.updated_at = Set(now);
        am.version = Set(current.version + 1);
        stamp_transition(&mut am, next, now);
        if next == OrderStatus::Cancelled {
            am.cancel_reason = Set(cancel_reason.or_else(|| note.clone()));
        }
        let updated = save_order(conn, am, order_id, current.version).await?;

        if next == OrderStatus::Cancelled {
            let items = OrderItemEntity::find()
                .filter(order_item::Column::OrderId.eq(order_id))
                .all(conn)
                .await?;
            for item in &items {
                release_stock(conn, item.variant_id, item.quantity, now).await?;
            }
        }

        append_history(conn, order_id, next, note.as_deref(), actor, now).await?;
        uow.commit().await?;

        metrics::counter!("stateset_orders.transitions", 1, "to" => next.to_string());
        info!(order_id = %order_id, from = %current.status, to = %next, "Order status updated");

        self.cache
            .invalidate_order(order_id, updated.user_id, updated.shop_id)
            .await;
        self.publish(Event::OrderStatusChanged {
            order_id,
            old_status: current.status,
            new_status: next,
        })
        .await;

        Ok(updated)
    }

    /// Buyer-initiated cancellation.
    #[instrument(skip(self, reason), fields(order_id = %order_id, user_id = %user_id))]
    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        user_id: Uuid,
        reason: Option<String>,
    ) -> Result<order::Model, ServiceError> {
        let current = OrderEntity::find_by_id(order_id)
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if current.user_id != user_id {
            warn!(order_id = %order_id, "Cancellation attempted by non-owner");
            return Err(ServiceError::Forbidden(
                "Only the buyer can cancel this order".to_string(),
            ));
        }
        match current.status {
            OrderStatus::Cancelled => {
                return Err(ServiceError::ValidationError(
                    "Order is already cancelled".to_string(),
                ))
            }
            OrderStatus::Completed => {
                return Err(ServiceError::ValidationError(
                    "Completed orders cannot be cancelled".to_string(),
                ))
            }
            _ => {}
        }

        let note = reason
            .clone()
            .map(|r| format!("Cancelled by buyer: {}", r))
            .or_else(|| Some("Cancelled by buyer".to_string()));
        self.transition(order_id, OrderStatus::Cancelled, note, Some(user_id), reason)
            .await
    }

    /// Fetches an order with items and history. Visible to the buyer and the shop owner.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn get_order_by_id(
        &self,
        order_id: Uuid,
        requester: Uuid,
    ) -> Result<OrderDetails, ServiceError> {
        let db = &*self.db_pool;
        let details = self
            .cache
            .read_through(&keys::order(order_id), || async {
                let Some(order) = OrderEntity::find_by_id(order_id).one(db).await? else {
                    return Ok::<_, ServiceError>(None);
                };
                let items = OrderItemEntity::find()
                    .filter(order_item::Column::OrderId.eq(order_id))
                    .order_by_asc(order_item::Column::CreatedAt)
                    .all(db)
                    .await?;
                let history = OrderStatusHistoryEntity::find()
                    .filter(order_status_history::Column::OrderId.eq(order_id))
                    .order_by_asc(order_status_history::Column::CreatedAt)
                    .all(db)
                    .await?;
                Ok(Some(OrderDetails {
                    order,
                    items,
                    history,
                }))
            })
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if details.order.user_id != requester
            && !self.owns_shop(details.order.shop_id, requester).await?
        {
            return Err(ServiceError::Forbidden(
                "Not allowed to view this order".to_string(),
            ));
        }
        Ok(details)
    }

    /// Orders placed by `user_id`, newest first.
    #[instrument(skip(self), fields(user_id = %user_id))]
    pub async fn get_user_orders(
        &self,
        user_id: Uuid,
        requester: Uuid,
        page: u64,
        limit: u64,
    ) -> Result<Page<order::Model>, ServiceError> {
        if user_id != requester {
            return Err(ServiceError::Forbidden(
                "Not allowed to view another user's orders".to_string(),
            ));
        }
        let (page, limit) = page_params(page, limit);
        let key = keys::orders_by_user(user_id, page, limit);
        let found = self
            .cache
            .read_through(&key, || async {
                self.fetch_page(order::Column::UserId.eq(user_id), page, limit)
                    .await
                    .map(Some)
            })
            .await?;
        Ok(found.unwrap_or(Page {
            items: Vec::new(),
            total: 0,
            page,
            limit,
        }))
    }

    /// Orders placed against `shop_id`, newest first. Shop owner only.
    #[instrument(skip(self), fields(shop_id = %shop_id))]
    pub async fn get_shop_orders(
        &self,
        shop_id: Uuid,
        requester: Uuid,
        page: u64,
        limit: u64,
    ) -> Result<Page<order::Model>, ServiceError> {
        let shop = shop::Entity::find_by_id(shop_id)
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Shop {} not found", shop_id)))?;
        if shop.owner_id != requester {
            return Err(ServiceError::Forbidden(
                "Not allowed to view this shop's orders".to_string(),
            ));
        }
        let (page, limit) = page_params(page, limit);
        let key = keys::orders_by_shop(shop_id, page, limit);
        let found = self
            .cache
            .read_through(&key, || async {
                self.fetch_page(order::Column::ShopId.eq(shop_id), page, limit)
                    .await
                    .map(Some)
            })
            .await?;
        Ok(found.unwrap_or(Page {
            items: Vec::new(),
            total: 0,
            page,
            limit,
        }))
    }

    async fn fetch_page(
        &self,
        condition: sea_orm::sea_query::SimpleExpr,
        page: u64,
        limit: u64,
    ) -> Result<Page<order::Model>, ServiceError> {
        let paginator = OrderEntity::find()
            .filter(condition)
            .order_by_desc(order::Column::CreatedAt)
            .paginate(&*self.db_pool, limit);
        let total = paginator.num_items().await?;
        let items = paginator.fetch_page(page - 1).await?;
        Ok(Page {
            items,
            total,
            page,
            limit,
        })
    }

    async fn owns_shop(&self, shop_id: Uuid, requester: Uuid) -> Result<bool, ServiceError> {
        let shop = shop::Entity::find_by_id(shop_id)
            .one(&*self.db_pool)
            .await?;
        Ok(shop.map(|s| s.owner_id == requester).unwrap_or(false))
    }
}

/// Decrements stock only while enough remains, in a single statement.
async fn reserve_stock<C: ConnectionTrait>(
    conn: &C,
    variant_id: Uuid,
    quantity: i32,
    now: DateTime<Utc>,
) -> Result<(), ServiceError> {
    let result = product_variant::Entity::update_many()
        .col_expr(
            product_variant::Column::Stock,
            Expr::col(product_variant::Column::Stock).sub(quantity),
        )
        .col_expr(product_variant::Column::UpdatedAt, Expr::value(now))
        .filter(product_variant::Column::Id.eq(variant_id))
        .filter(product_variant::Column::Stock.gte(quantity))
        .exec(conn)
        .await?;
    if result.rows_affected == 0 {
        return Err(ServiceError::ValidationError(format!(
            "Insufficient stock for variant {}",
            variant_id
        )));
    }
    Ok(())
}

async fn release_stock<C: ConnectionTrait>(
    conn: &C,
    variant_id: Uuid,
    quantity: i32,
    now: DateTime<Utc>,
) -> Result<(), ServiceError> {
    let result = product_variant::Entity::update_many()
        .col_expr(
            product_variant::Column::Stock,
            Expr::col(product_variant::Column::Stock).add(quantity),
        )
        .col_expr(product_variant::Column::UpdatedAt, Expr::value(now))
        .filter(product_variant::Column::Id.eq(variant_id))
        .exec(conn)
        .await?;
    if result.rows_affected == 0 {
        warn!(variant_id = %variant_id, "Variant vanished before stock could be restored");
    }
    Ok(())
}

async fn append_history<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    status: OrderStatus,
    note: Option<&str>,
    changed_by: Option<Uuid>,
    now: DateTime<Utc>,
) -> Result<order_status_history::Model, ServiceError> {
    let row = order_status_history::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order_id),
        status: Set(status),
        note: Set(note.map(str::to_string)),
        changed_by: Set(changed_by),
        created_at: Set(now),
    }
    .insert(conn)
    .await?;
    Ok(row)
}
