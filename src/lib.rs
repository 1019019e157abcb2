//! StateSet Settlement Library
//!
//! Order, payment and cashback settlement: cart checkout with stock reservation, payment
//! lifecycle with gateway webhooks, on-chain cashback payouts and periodic reconciliation sweeps.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod blockchain;
pub mod cache;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod migrator;
pub mod scheduler;
pub mod services;
pub mod state_machine;
pub mod webhooks;

use std::sync::Arc;

use sea_orm::DatabaseConnection;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    blockchain::{BlockchainGateway, SimulatedBlockchainGateway},
    cache::{CacheBackend, CacheFactory, CacheInvalidator, InMemoryCache},
    config::AppConfig,
    events::{Event, EventSender},
    scheduler::{DbJobLease, ReconciliationScheduler},
    services::{factory::ServiceContainer, ServiceFactory},
};

/// Shared handles for the binaries.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: AppConfig,
    pub event_sender: Arc<EventSender>,
    pub gateway: Arc<dyn BlockchainGateway>,
    pub services: ServiceContainer,
}

impl AppState {
    /// Connects, optionally migrates, and wires every service. The receiver carries domain events.
    pub async fn bootstrap(cfg: &AppConfig) -> anyhow::Result<(Self, mpsc::Receiver<Event>)> {
        let db_pool = db::establish_connection_from_app_config(cfg).await?;
        if cfg.auto_migrate {
            db::run_migrations(&db_pool).await?;
        }
        let db = Arc::new(db_pool);

        let backend = CacheFactory::create_cache(&cfg.cache).unwrap_or_else(|e| {
            warn!(error = %e, "Cache backend unavailable, using in-memory cache");
            Arc::new(InMemoryCache::new()) as Arc<dyn CacheBackend>
        });
        let cache = CacheInvalidator::new(backend, cfg.cache_ttl());

        let (sender, rx) = EventSender::channel(cfg.event_channel_capacity);
        let event_sender = Arc::new(sender);

        // No on-chain client ships with the crate; payouts go through the simulated gateway.
        let gateway: Arc<dyn BlockchainGateway> = Arc::new(SimulatedBlockchainGateway::new());

        let factory = ServiceFactory::new(
            db.clone(),
            cache,
            Some(event_sender.clone()),
            gateway.clone(),
            cfg.settlement.clone(),
        );

        info!(environment = %cfg.environment, "Settlement services initialised");
        Ok((
            Self {
                db,
                config: cfg.clone(),
                event_sender,
                gateway,
                services: factory.create_all(),
            },
            rx,
        ))
    }

    /// Scheduler over this state's services, lease-guarded when configured.
    pub fn scheduler(&self) -> ReconciliationScheduler {
        let scheduler = ReconciliationScheduler::new(
            self.services.payments.clone(),
            self.services.cashbacks.clone(),
            self.config.scheduler.clone(),
            self.config.settlement.cashback_max_retries,
        );
        if self.config.scheduler.lease_enabled {
            let holder = format!("settlement-{}", Uuid::new_v4());
            scheduler.with_lease(DbJobLease::new(self.db.clone(), holder))
        } else {
            scheduler
        }
    }
}
