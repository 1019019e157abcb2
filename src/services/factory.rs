use std::sync::Arc;

use crate::{
    blockchain::BlockchainGateway,
    cache::CacheInvalidator,
    config::SettlementConfig,
    db::DbPool,
    events::EventSender,
    services::{cashbacks::CashbackService, orders::OrderService, payments::PaymentService},
};

/// Factory for creating service instances with shared dependencies
pub struct ServiceFactory {
    db_pool: Arc<DbPool>,
    cache: CacheInvalidator,
    event_sender: Option<Arc<EventSender>>,
    gateway: Arc<dyn BlockchainGateway>,
    settings: SettlementConfig,
}

impl ServiceFactory {
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

    pub fn order_service(&self) -> OrderService {
        OrderService::new(
            self.db_pool.clone(),
            self.cache.clone(),
            self.event_sender.clone(),
            self.settings.clone(),
        )
    }

    pub fn cashback_service(&self) -> CashbackService {
        CashbackService::new(
            self.db_pool.clone(),
            self.cache.clone(),
            self.event_sender.clone(),
            self.gateway.clone(),
            self.settings.clone(),
        )
    }

    /// Payment service wired to its own cashback service for the `PAID` hand-off.
    pub fn payment_service(&self) -> PaymentService {
        PaymentService::new(
            self.db_pool.clone(),
            self.cache.clone(),
            self.event_sender.clone(),
            self.cashback_service(),
            self.settings.clone(),
        )
    }

    pub fn create_all(&self) -> ServiceContainer {
        ServiceContainer {
            orders: Arc::new(self.order_service()),
            payments: Arc::new(self.payment_service()),
            cashbacks: Arc::new(self.cashback_service()),
        }
    }

    pub fn db_pool(&self) -> &Arc<DbPool> {
        &self.db_pool
    }

    pub fn gateway(&self) -> &Arc<dyn BlockchainGateway> {
        &self.gateway
    }
}

/// Service container holding all service instances
#[derive(Clone)]
pub struct ServiceContainer {
    pub orders: Arc<OrderService>,
    pub payments: Arc<PaymentService>,
    pub cashbacks: Arc<CashbackService>,
}
