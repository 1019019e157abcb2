// Settlement pipeline services
pub mod cashbacks;
pub mod orders;
pub mod payments;

// Service factory for dependency injection
pub mod factory;

pub use cashbacks::CashbackService;
pub use factory::ServiceFactory;
pub use orders::OrderService;
pub use payments::PaymentService;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Largest page a list query will return.
pub const MAX_PAGE_SIZE: u64 = 100;

/// One page of a list query. `page` is 1-based.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u64,
    pub limit: u64,
}

/// Clamps caller supplied paging to `page >= 1` and `1 <= limit <= MAX_PAGE_SIZE`.
pub fn page_params(page: u64, limit: u64) -> (u64, u64) {
    (page.max(1), limit.clamp(1, MAX_PAGE_SIZE))
}

/// Count and summed amount of the records in one status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTotals<S> {
    pub status: S,
    pub count: u64,
    pub amount: Decimal,
}

/// Folds `(status, amount)` rows into per-status totals, one entry per status in `all`.
pub(crate) fn totals_by_status<S: Copy + PartialEq>(
    all: impl IntoIterator<Item = S>,
    rows: &[(S, Decimal)],
) -> Vec<StatusTotals<S>> {
    all.into_iter()
        .map(|status| {
            let matching = rows.iter().filter(|(s, _)| *s == status);
            StatusTotals {
                status,
                count: matching.clone().count() as u64,
                amount: matching.map(|(_, amount)| *amount).sum(),
            }
        })
        .collect()
}
