//! Database entities for the settlement ledger.

pub mod cashback;
pub mod commerce;
pub mod order;
pub mod order_item;
pub mod order_status_history;
pub mod payment;
pub mod scheduler_lease;

pub use commerce::{cart, cart_item, product, product_variant, shop};

pub use cashback::{CashbackStatus, Entity as Cashback};
pub use order::{Entity as Order, OrderStatus};
pub use order_item::Entity as OrderItem;
pub use order_status_history::Entity as OrderStatusHistory;
pub use payment::{Entity as Payment, PaymentStatus};
