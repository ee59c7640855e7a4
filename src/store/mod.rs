//! Persistence seams for the catalog, carts and orders.
//!
//! Services only see these traits. `MemoryStore` implements all of them in
//! process; `PgStore` implements them over PostgreSQL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::aggregates::{Cart, Order, Product, ProductStatus};
use crate::domain::value_objects::{OrderId, OrderNumber, ProductId, UserId};
use crate::Result;

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// One page of a newest-first listing. Built through `Page::new`, which keeps
/// `page >= 1` and `1 <= per_page <= MAX_PER_PAGE`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Page {
    page: u32,
    per_page: u32,
}

impl Page {
    pub const MAX_PER_PAGE: u32 = 100;

    pub fn new(page: u32, per_page: u32) -> Self {
        Self { page: page.max(1), per_page: per_page.clamp(1, Self::MAX_PER_PAGE) }
    }

    pub fn number(&self) -> u32 { self.page }
    pub fn per_page(&self) -> u32 { self.per_page }

    pub fn offset(&self) -> u64 { u64::from(self.page.saturating_sub(1)) * u64::from(self.per_page) }
    pub fn limit(&self) -> u64 { u64::from(self.per_page) }
}

impl Default for Page {
    fn default() -> Self { Self::new(1, 10) }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ProductFilter {
    pub ids: Option<Vec<ProductId>>,
    pub vendor: Option<UserId>,
    pub status: Option<ProductStatus>,
    pub page: Option<Page>,
}

impl ProductFilter {
    pub fn ids(ids: impl IntoIterator<Item = ProductId>) -> Self {
        Self { ids: Some(ids.into_iter().collect()), ..Self::default() }
    }

    pub fn matches(&self, product: &Product) -> bool {
        self.ids.as_ref().map_or(true, |ids| ids.contains(&product.id))
            && self.vendor.map_or(true, |vendor| product.vendor == vendor)
            && self.status.map_or(true, |status| product.status == status)
    }
}

/// Stock after an adjustment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StockLevel {
    Tracked(i64),
    /// The product does not track quantity; nothing was changed.
    Untracked,
}

#[async_trait]
pub trait CatalogStore: Send + Sync {
    async fn get_product(&self, id: ProductId) -> Result<Option<Product>>;

    async fn find_products(&self, filter: ProductFilter) -> Result<Vec<Product>>;

    /// Adds `delta` to tracked stock in one conditional write. Fails with
    /// `InsufficientStock` when the result would be negative and the product does
    /// not allow backorders, and with `NotFound` for unknown products.
    async fn adjust_stock(&self, id: ProductId, delta: i64) -> Result<StockLevel>;

    async fn adjust_purchases(&self, id: ProductId, delta: i64) -> Result<()>;
}

#[async_trait]
pub trait CartStore: Send + Sync {
    async fn load_cart(&self, owner: UserId) -> Result<Option<Cart>>;

    /// Inserts a cart with revision 0, otherwise replaces the stored cart only if
    /// its revision still matches. Returns the cart as stored, with the revision
    /// bumped. A stale revision fails with `Conflict`.
    async fn save_cart(&self, cart: Cart) -> Result<Cart>;

    async fn delete_expired_carts(&self, now: DateTime<Utc>) -> Result<u64>;
}

#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Strictly increasing, never reused.
    async fn next_order_sequence(&self) -> Result<u64>;

    /// Fails with `Conflict` when the id or order number already exists.
    async fn insert_order(&self, order: Order) -> Result<Order>;

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>>;

    async fn find_by_order_number(&self, number: &OrderNumber) -> Result<Option<Order>>;

    /// Same revision contract as `CartStore::save_cart`.
    async fn replace_order(&self, order: Order) -> Result<Order>;

    async fn orders_for_user(&self, user: UserId, page: Page) -> Result<Vec<Order>>;

    async fn orders_for_vendor(&self, vendor: UserId, page: Page) -> Result<Vec<Order>>;

    async fn orders_needing_reconciliation(&self) -> Result<Vec<Order>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_bounds() {
        let page = Page::new(0, 500);
        assert_eq!((page.number(), page.per_page()), (1, 100));
        assert_eq!(page.offset(), 0);
        assert_eq!(Page::new(3, 20).offset(), 40);
        assert_eq!(Page::new(1, 0).per_page(), 1);
    }

    #[test]
    fn test_first_page_starts_at_zero() {
        let first = Page { page: 0, per_page: 10 };
        assert_eq!(first.offset(), 0);
        assert_eq!(first.limit(), 10);
    }
}
