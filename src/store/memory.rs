//! In-process store backing all three persistence traits.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::domain::aggregates::{Cart, Order, Product};
use crate::domain::value_objects::{OrderId, OrderNumber, ProductId, UserId};
use crate::store::{CartStore, CatalogStore, OrderStore, Page, ProductFilter, StockLevel};
use crate::{MarketplaceError, Result};

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    products: HashMap<ProductId, Product>,
    carts: HashMap<UserId, Cart>,
    orders: HashMap<OrderId, Order>,
    sequence: u64,
}

impl MemoryStore {
    pub fn new() -> Self { Self::default() }

    pub async fn insert_product(&self, product: Product) {
        self.inner.lock().await.products.insert(product.id, product);
    }

    /// Applies `change` to a stored product, standing in for catalog edits made
    /// outside this core.
    pub async fn update_product(&self, id: ProductId, change: impl FnOnce(&mut Product)) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let product = inner.products.get_mut(&id).ok_or_else(|| MarketplaceError::not_found("product", id))?;
        change(product);
        product.updated_at = Utc::now();
        Ok(())
    }

    pub async fn remove_product(&self, id: ProductId) {
        self.inner.lock().await.products.remove(&id);
    }

    pub async fn order_count(&self) -> usize { self.inner.lock().await.orders.len() }
}

fn newest_first(mut orders: Vec<Order>, page: Page) -> Vec<Order> {
    orders.sort_by(|a, b| b.created_at().cmp(&a.created_at()).then_with(|| b.id().cmp(&a.id())));
    let offset = usize::try_from(page.offset()).unwrap_or(usize::MAX);
    let limit = usize::try_from(page.limit()).unwrap_or(usize::MAX);
    orders.into_iter().skip(offset).take(limit).collect()
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn get_product(&self, id: ProductId) -> Result<Option<Product>> {
        Ok(self.inner.lock().await.products.get(&id).cloned())
    }

    async fn find_products(&self, filter: ProductFilter) -> Result<Vec<Product>> {
        let inner = self.inner.lock().await;
        let mut products: Vec<Product> = inner.products.values().filter(|p| filter.matches(p)).cloned().collect();
        products.sort_by_key(|p| p.id);
        if let Some(page) = filter.page {
            let offset = usize::try_from(page.offset()).unwrap_or(usize::MAX);
            let limit = usize::try_from(page.limit()).unwrap_or(usize::MAX);
            products = products.into_iter().skip(offset).take(limit).collect();
        }
        Ok(products)
    }

    async fn adjust_stock(&self, id: ProductId, delta: i64) -> Result<StockLevel> {
        let mut inner = self.inner.lock().await;
        let product = inner.products.get_mut(&id).ok_or_else(|| MarketplaceError::not_found("product", id))?;
        if !product.track_quantity {
            return Ok(StockLevel::Untracked);
        }
        let next = product.stock + delta;
        if delta < 0 && next < 0 && !product.allow_backorder {
            return Err(MarketplaceError::InsufficientStock {
                product: id,
                requested: u32::try_from(-delta).unwrap_or(u32::MAX),
                available: product.stock,
            });
        }
        product.stock = next;
        product.updated_at = Utc::now();
        Ok(StockLevel::Tracked(next))
    }

    async fn adjust_purchases(&self, id: ProductId, delta: i64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let product = inner.products.get_mut(&id).ok_or_else(|| MarketplaceError::not_found("product", id))?;
        product.purchases = (product.purchases + delta).max(0);
        Ok(())
    }
}

#[async_trait]
impl CartStore for MemoryStore {
    async fn load_cart(&self, owner: UserId) -> Result<Option<Cart>> {
        Ok(self.inner.lock().await.carts.get(&owner).cloned())
    }

    async fn save_cart(&self, mut cart: Cart) -> Result<Cart> {
        let mut inner = self.inner.lock().await;
        let stored = inner.carts.get(&cart.owner()).map_or(0, Cart::revision);
        if stored != cart.revision() {
            return Err(MarketplaceError::Conflict(format!(
                "cart {} was modified concurrently (revision {} != {})", cart.id(), cart.revision(), stored
            )));
        }
        cart.set_revision(stored + 1);
        inner.carts.insert(cart.owner(), cart.clone());
        Ok(cart)
    }

    async fn delete_expired_carts(&self, now: DateTime<Utc>) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let before = inner.carts.len();
        inner.carts.retain(|_, cart| !cart.is_expired(now));
        Ok((before - inner.carts.len()) as u64)
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn next_order_sequence(&self) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        inner.sequence += 1;
        Ok(inner.sequence)
    }

    async fn insert_order(&self, mut order: Order) -> Result<Order> {
        let mut inner = self.inner.lock().await;
        let duplicate = inner.orders.contains_key(&order.id())
            || inner.orders.values().any(|o| o.order_number() == order.order_number());
        if duplicate {
            return Err(MarketplaceError::Conflict(format!("order {} already exists", order.order_number())));
        }
        order.set_revision(1);
        inner.orders.insert(order.id(), order.clone());
        Ok(order)
    }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>> {
        Ok(self.inner.lock().await.orders.get(&id).cloned())
    }

    async fn find_by_order_number(&self, number: &OrderNumber) -> Result<Option<Order>> {
        Ok(self.inner.lock().await.orders.values().find(|o| o.order_number() == number).cloned())
    }

    async fn replace_order(&self, mut order: Order) -> Result<Order> {
        let mut inner = self.inner.lock().await;
        let stored = inner.orders.get(&order.id()).map(Order::revision)
            .ok_or_else(|| MarketplaceError::not_found("order", order.id()))?;
        if stored != order.revision() {
            return Err(MarketplaceError::Conflict(format!(
                "order {} was modified concurrently (revision {} != {})", order.order_number(), order.revision(), stored
            )));
        }
        order.set_revision(stored + 1);
        inner.orders.insert(order.id(), order.clone());
        Ok(order)
    }

    async fn orders_for_user(&self, user: UserId, page: Page) -> Result<Vec<Order>> {
        let inner = self.inner.lock().await;
        Ok(newest_first(inner.orders.values().filter(|o| o.user() == user).cloned().collect(), page))
    }

    async fn orders_for_vendor(&self, vendor: UserId, page: Page) -> Result<Vec<Order>> {
        let inner = self.inner.lock().await;
        Ok(newest_first(inner.orders.values().filter(|o| o.is_vendor(vendor)).cloned().collect(), page))
    }

    async fn orders_needing_reconciliation(&self) -> Result<Vec<Order>> {
        let inner = self.inner.lock().await;
        let mut flagged: Vec<Order> = inner.orders.values().filter(|o| o.needs_reconciliation()).cloned().collect();
        flagged.sort_by_key(Order::created_at);
        Ok(flagged)
    }
}
