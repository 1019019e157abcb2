//! Key layout and invalidation for cached settlement reads.
//!
//! The cache is advisory. Nothing here returns an error to the caller: a failed read is a miss
//! and a failed write or delete is logged and dropped.

use super::CacheBackend;
use metrics::counter;
use serde::{de::DeserializeOwned, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// List pages that are invalidated explicitly. Deeper pages age out through the TTL.
pub const INVALIDATED_PAGES: std::ops::RangeInclusive<u64> = 1..=5;
/// Page sizes clients are expected to request.
pub const LIST_LIMITS: [u64; 4] = [10, 20, 50, 100];

pub mod keys {
    use uuid::Uuid;

    pub fn payment(id: Uuid) -> String {
        format!("payment:{}", id)
    }

    pub fn payment_by_order(order_id: Uuid) -> String {
        format!("payment:order:{}", order_id)
    }

    pub fn payments_list(page: u64, limit: u64) -> String {
        format!("payments:list:{}:{}", page, limit)
    }

    pub const PAYMENTS_STATS: &str = "payments:stats";

    pub fn cashback(id: Uuid) -> String {
        format!("cashback:{}", id)
    }

    pub fn cashbacks_by_user(user_id: Uuid, page: u64, limit: u64) -> String {
        format!("cashbacks:user:{}:{}:{}", user_id, page, limit)
    }

    pub const CASHBACKS_STATS: &str = "cashbacks:stats";

    pub fn cashbacks_stats_for_user(user_id: Uuid) -> String {
        format!("cashbacks:stats:{}", user_id)
    }

    pub fn order(id: Uuid) -> String {
        format!("order:{}", id)
    }

    pub fn orders_by_user(user_id: Uuid, page: u64, limit: u64) -> String {
        format!("orders:user:{}:{}:{}", user_id, page, limit)
    }

    pub fn orders_by_shop(shop_id: Uuid, page: u64, limit: u64) -> String {
        format!("orders:shop:{}:{}:{}", shop_id, page, limit)
    }
}

fn bounded_pages(key_for: impl Fn(u64, u64) -> String) -> Vec<String> {
    INVALIDATED_PAGES
        .flat_map(|page| LIST_LIMITS.iter().map(move |limit| (page, *limit)))
        .map(|(page, limit)| key_for(page, limit))
        .collect()
}

/// Issues cache reads and invalidations on behalf of the services.
#[derive(Clone)]
pub struct CacheInvalidator {
    backend: Arc<dyn CacheBackend>,
    ttl: Option<Duration>,
}

impl CacheInvalidator {
    pub fn new(backend: Arc<dyn CacheBackend>, ttl: Option<Duration>) -> Self {
        Self { backend, ttl }
    }

    pub fn backend(&self) -> &Arc<dyn CacheBackend> {
        &self.backend
    }

    /// Returns the cached value under `key`, or `None` on a miss or any cache failure.
    pub async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        match self.backend.get(key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(value) => {
                    counter!("stateset_cache.hits", 1);
                    debug!(key, "Cache hit");
                    Some(value)
                }
                Err(e) => {
                    warn!(key, error = %e, "Discarding undecodable cache entry");
                    None
                }
            },
            Ok(None) => {
                counter!("stateset_cache.misses", 1);
                None
            }
            Err(e) => {
                warn!(key, error = %e, "Cache read failed");
                None
            }
        }
    }

    pub async fn put_json<T: Serialize>(&self, key: &str, value: &T) {
        let raw = match serde_json::to_string(value) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(key, error = %e, "Failed to encode cache entry");
                return;
            }
        };
        if let Err(e) = self.backend.set(key, &raw, self.ttl).await {
            warn!(key, error = %e, "Cache write failed");
        }
    }

    /// Serves `key` from the cache, falling back to `load` and populating the cache on a miss.
    /// `None` results are not cached.
    pub async fn read_through<T, E, F, Fut>(&self, key: &str, load: F) -> Result<Option<T>, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Option<T>, E>>,
    {
        if let Some(hit) = self.get_json(key).await {
            return Ok(Some(hit));
        }
        let loaded = load().await?;
        if let Some(value) = &loaded {
            self.put_json(key, value).await;
        }
        Ok(loaded)
    }

    async fn delete_keys(&self, stale: Vec<String>) {
        counter!("stateset_cache.invalidations", stale.len() as u64);
        if let Err(e) = self.backend.delete_many(&stale).await {
            warn!(error = %e, count = stale.len(), "Cache invalidation failed");
        }
    }

    /// Payment by id and by order, the bounded list pages and the statistics.
    pub async fn invalidate_payment(&self, payment_id: Uuid, order_id: Option<Uuid>) {
        let mut stale = vec![keys::payment(payment_id), keys::PAYMENTS_STATS.to_string()];
        if let Some(order_id) = order_id {
            stale.push(keys::payment_by_order(order_id));
        }
        stale.extend(bounded_pages(keys::payments_list));
        self.delete_keys(stale).await;
    }

    /// Cashback by id, the owner's bounded list pages and the statistics.
    pub async fn invalidate_cashback(&self, cashback_id: Uuid, user_id: Uuid) {
        let mut stale = vec![
            keys::cashback(cashback_id),
            keys::CASHBACKS_STATS.to_string(),
            keys::cashbacks_stats_for_user(user_id),
        ];
        stale.extend(bounded_pages(|page, limit| {
            keys::cashbacks_by_user(user_id, page, limit)
        }));
        self.delete_keys(stale).await;
    }

    /// Order by id and the bounded buyer and shop list pages.
    pub async fn invalidate_order(&self, order_id: Uuid, user_id: Uuid, shop_id: Uuid) {
        let mut stale = vec![keys::order(order_id)];
        stale.extend(bounded_pages(|page, limit| {
            keys::orders_by_user(user_id, page, limit)
        }));
        stale.extend(bounded_pages(|page, limit| {
            keys::orders_by_shop(shop_id, page, limit)
        }));
        self.delete_keys(stale).await;
    }
}
