//! Catalog records (products and categories).
//!
//! Plain data plus patch rules; persistence, queueing and caching live in `storefront-infra`.

pub mod category;
pub mod product;

pub use category::{Category, CategoryPatch};
pub use product::{Product, ProductPatch};
