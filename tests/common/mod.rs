#![allow(dead_code)]

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    sea_query::Expr, ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
    Set,
};
use stateset_settlement::{
    blockchain::{
        BlockchainError, BlockchainGateway, SimulatedBlockchainGateway, TransactionVerification,
        TransferReceipt,
    },
    cache::{CacheInvalidator, InMemoryCache},
    config::{SchedulerConfig, SettlementConfig},
    db,
    entities::{cart, cart_item, cashback, product, product_variant, shop, CashbackStatus},
    events::{Event, EventSender},
    scheduler::ReconciliationScheduler,
    services::{
        orders::{CreateOrderInput, OrderDetails},
        CashbackService, OrderService, PaymentService,
    },
};
use tokio::sync::mpsc;
use uuid::Uuid;

pub const WALLET: &str = "0xabcdefabcdefabcdefabcdefabcdefabcdefabcd";

/// Services wired over a fresh in-memory SQLite database.
pub struct TestApp {
    pub db: Arc<DatabaseConnection>,
    pub cache: Arc<InMemoryCache>,
    pub orders: Arc<OrderService>,
    pub payments: Arc<PaymentService>,
    pub cashbacks: Arc<CashbackService>,
    pub settings: SettlementConfig,
    events: mpsc::Receiver<Event>,
}

impl TestApp {
    pub async fn new() -> Self {
        Self::with_gateway(Arc::new(SimulatedBlockchainGateway::new())).await
    }

    pub async fn with_gateway(gateway: Arc<dyn BlockchainGateway>) -> Self {
        Self::build(gateway, SettlementConfig::default()).await
    }

    pub async fn build(gateway: Arc<dyn BlockchainGateway>, settings: SettlementConfig) -> Self {
        // A single connection keeps every handle on the same in-memory database.
        let config = db::DbConfig {
            url: "sqlite::memory:".to_string(),
            max_connections: 1,
            min_connections: 1,
            ..Default::default()
        };
        let pool = db::establish_connection_with_config(&config)
            .await
            .expect("failed to open sqlite memory database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");
        let db = Arc::new(pool);

        let cache = Arc::new(InMemoryCache::new());
        let invalidator = CacheInvalidator::new(cache.clone(), Some(Duration::from_secs(300)));
        let (sender, events) = EventSender::channel(1024);
        let sender = Some(Arc::new(sender));

        let orders = OrderService::new(
            db.clone(),
            invalidator.clone(),
            sender.clone(),
            settings.clone(),
        );
        let cashbacks = CashbackService::new(
            db.clone(),
            invalidator.clone(),
            sender.clone(),
            gateway,
            settings.clone(),
        );
        let payments = PaymentService::new(
            db.clone(),
            invalidator,
            sender,
            cashbacks.clone(),
            settings.clone(),
        );

        Self {
            db,
            cache,
            orders: Arc::new(orders),
            payments: Arc::new(payments),
            cashbacks: Arc::new(cashbacks),
            settings,
            events,
        }
    }

    /// Scheduler over this app's services with short intervals and no lease.
    pub fn scheduler(&self, interval_secs: u64) -> ReconciliationScheduler {
        let config = SchedulerConfig {
            process_pending_interval_secs: interval_secs,
            retry_failed_interval_secs: interval_secs,
            cancel_expired_interval_secs: interval_secs,
            expire_payments_interval_secs: interval_secs,
            lease_enabled: false,
            ..Default::default()
        };
        ReconciliationScheduler::new(
            self.payments.clone(),
            self.cashbacks.clone(),
            config,
            self.settings.cashback_max_retries,
        )
    }

    /// Names of the events published so far, in order.
    pub fn drain_events(&mut self) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            names.push(event.name());
        }
        names
    }

    pub async fn seed_shop(&self) -> shop::Model {
        shop::ActiveModel {
            id: Set(Uuid::new_v4()),
            owner_id: Set(Uuid::new_v4()),
            name: Set("Test Shop".to_string()),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.db)
        .await
        .expect("insert shop")
    }

    pub async fn seed_variant(
        &self,
        shop_id: Uuid,
        name: &str,
        price: Decimal,
        stock: i32,
    ) -> product_variant::Model {
        let now = Utc::now();
        let product = product::ActiveModel {
            id: Set(Uuid::new_v4()),
            shop_id: Set(shop_id),
            name: Set(format!("{} product", name)),
            image_url: Set(Some(format!("https://cdn.test/{}.png", name))),
            created_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .expect("insert product");

        product_variant::ActiveModel {
            id: Set(Uuid::new_v4()),
            product_id: Set(product.id),
            name: Set(name.to_string()),
            price: Set(price),
            stock: Set(stock),
            image_url: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .expect("insert variant")
    }

    /// Adds a line to the user's cart, creating the cart on first use.
    pub async fn add_to_cart(&self, user_id: Uuid, variant_id: Uuid, quantity: i32) {
        use sea_orm::{ColumnTrait, QueryFilter};

        let now = Utc::now();
        let existing = cart::Entity::find()
            .filter(cart::Column::UserId.eq(user_id))
            .one(&*self.db)
            .await
            .expect("load cart");
        let cart = match existing {
            Some(cart) => cart,
            None => cart::ActiveModel {
                id: Set(Uuid::new_v4()),
                user_id: Set(user_id),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(&*self.db)
            .await
            .expect("insert cart"),
        };

        cart_item::ActiveModel {
            id: Set(Uuid::new_v4()),
            cart_id: Set(cart.id),
            variant_id: Set(variant_id),
            quantity: Set(quantity),
            created_at: Set(now),
        }
        .insert(&*self.db)
        .await
        .expect("insert cart item");
    }

    pub async fn stock_of(&self, variant_id: Uuid) -> i32 {
        product_variant::Entity::find_by_id(variant_id)
            .one(&*self.db)
            .await
            .expect("load variant")
            .expect("variant exists")
            .stock
    }

    /// One-line order of `quantity` units at `price`, optionally with a cashback wallet.
    pub async fn place_order(
        &self,
        user_id: Uuid,
        price: Decimal,
        quantity: i32,
        wallet: Option<&str>,
    ) -> OrderDetails {
        let shop = self.seed_shop().await;
        let variant = self.seed_variant(shop.id, "default", price, 100).await;
        self.add_to_cart(user_id, variant.id, quantity).await;
        self.orders
            .create_order_from_cart(user_id, checkout(wallet))
            .await
            .expect("order from cart")
    }
}

pub fn checkout(wallet: Option<&str>) -> CreateOrderInput {
    CreateOrderInput {
        recipient_name: "Nguyen Van A".to_string(),
        recipient_phone: "0901234567".to_string(),
        shipping_address: "12 Le Loi, District 1".to_string(),
        note: None,
        shipping_fee: Decimal::ZERO,
        discount: Decimal::ZERO,
        currency: None,
        cashback_wallet_address: wallet.map(str::to_string),
        cashback_network: wallet.map(|_| "polygon".to_string()),
    }
}

/// Gateway whose calls never complete.
pub struct HangingGateway;

#[async_trait]
impl BlockchainGateway for HangingGateway {
    async fn send_cashback(
        &self,
        _wallet_address: &str,
        _amount: Decimal,
        _network: &str,
    ) -> Result<TransferReceipt, BlockchainError> {
        std::future::pending().await
    }

    async fn verify_transaction(
        &self,
        _tx_hash: &str,
        _network: &str,
    ) -> Result<TransactionVerification, BlockchainError> {
        std::future::pending().await
    }
}

/// Settles on the simulated chain, but first bumps the version of every in-flight cashback
/// so that recording the outcome loses its guarded write.
pub struct RacingGateway {
    pub chain: SimulatedBlockchainGateway,
    pub db: OnceLock<Arc<DatabaseConnection>>,
}

impl RacingGateway {
    pub fn new() -> Self {
        Self {
            chain: SimulatedBlockchainGateway::new(),
            db: OnceLock::new(),
        }
    }
}

#[async_trait]
impl BlockchainGateway for RacingGateway {
    async fn send_cashback(
        &self,
        wallet_address: &str,
        amount: Decimal,
        network: &str,
    ) -> Result<TransferReceipt, BlockchainError> {
        if let Some(db) = self.db.get() {
            cashback::Entity::update_many()
                .col_expr(
                    cashback::Column::Version,
                    Expr::col(cashback::Column::Version).add(1),
                )
                .filter(cashback::Column::Status.eq(CashbackStatus::Processing))
                .exec(&**db)
                .await
                .expect("bump in-flight cashback versions");
        }
        self.chain.send_cashback(wallet_address, amount, network).await
    }

    async fn verify_transaction(
        &self,
        tx_hash: &str,
        network: &str,
    ) -> Result<TransactionVerification, BlockchainError> {
        self.chain.verify_transaction(tx_hash, network).await
    }
}
