//! Catalog and cart tables the order flow reads from.
pub mod cart;
pub mod cart_item;
pub mod product;
pub mod product_variant;
pub mod shop;

pub use cart::{Entity as Cart, Model as CartModel};
pub use cart_item::{Entity as CartItem, Model as CartItemModel};
pub use product::{Entity as Product, Model as ProductModel};
pub use product_variant::{Entity as ProductVariant, Model as ProductVariantModel};
pub use shop::{Entity as Shop, Model as ShopModel};
