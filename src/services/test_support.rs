//! Shared fixtures for service tests.

use async_trait::async_trait;
use std::sync::{Arc, Mutex};

use crate::config::PricingPolicy;
use crate::domain::aggregates::{Order, PaymentMethod, Product};
use crate::domain::value_objects::{Money, OrderId, OrderNumber, ProductId, ShippingAddress, UserId};
use crate::integrations::{MockNotificationSink, MockPaymentGateway};
use crate::services::{CartEngine, CheckoutRequest, OrderLifecycle};
use crate::store::{CatalogStore, MemoryStore, OrderStore, Page, ProductFilter, StockLevel};
use crate::{MarketplaceError, Result};

pub(crate) fn address() -> ShippingAddress {
    ShippingAddress {
        street: "221 Residency Road".into(),
        city: "Bengaluru".into(),
        state: "KA".into(),
        zip_code: "560025".into(),
        country: "India".into(),
    }
}

pub(crate) fn quiet_notifications() -> MockNotificationSink {
    let mut notifications = MockNotificationSink::new();
    notifications.expect_emit().returning(|_, _| Ok(()));
    notifications
}

pub(crate) struct Harness {
    pub store: Arc<MemoryStore>,
    pub lifecycle: OrderLifecycle,
}

impl Harness {
    pub async fn new(payments: MockPaymentGateway, notifications: MockNotificationSink) -> Self {
        let store = Arc::new(MemoryStore::new());
        Self::build(store.clone(), store.clone(), store, payments, notifications)
    }

    /// No payment calls expected, notifications accepted.
    pub async fn quiet() -> Self { Self::new(MockPaymentGateway::new(), quiet_notifications()).await }

    pub async fn with_catalog(store: Arc<MemoryStore>, catalog: Arc<dyn CatalogStore>) -> Self {
        Self::build(store.clone(), catalog, store, MockPaymentGateway::new(), quiet_notifications())
    }

    pub async fn with_orders(store: Arc<MemoryStore>, orders: Arc<dyn OrderStore>, payments: MockPaymentGateway) -> Self {
        Self::build(store.clone(), store, orders, payments, quiet_notifications())
    }

    fn build(
        store: Arc<MemoryStore>,
        catalog: Arc<dyn CatalogStore>,
        orders: Arc<dyn OrderStore>,
        payments: MockPaymentGateway,
        notifications: MockNotificationSink,
    ) -> Self {
        let carts = CartEngine::new(catalog, store.clone(), PricingPolicy::default());
        let lifecycle = OrderLifecycle::new(carts, orders, Arc::new(payments), Arc::new(notifications));
        Self { store, lifecycle }
    }

    pub fn checkout(&self) -> CheckoutRequest { CheckoutRequest::new(address(), PaymentMethod::Stripe) }

    pub async fn seed(&self, product: Product) -> ProductId {
        let id = product.id;
        self.store.insert_product(product).await;
        id
    }

    pub async fn product(&self, id: ProductId) -> Result<Product> {
        self.store.get_product(id).await?.ok_or_else(|| MarketplaceError::not_found("product", id))
    }

    /// Checks out `quantity` units of a fresh 100-priced product with stock 10.
    /// Returns the order and the product's vendor.
    pub async fn placed_order(&self, quantity: u32) -> Result<(Order, UserId)> {
        let vendor = UserId::new();
        let id = self.seed(Product::new(vendor, "Speaker", Money::from_major(100), 10)).await;
        let buyer = UserId::new();
        self.lifecycle.carts.add_item(buyer, id, quantity, None).await?;
        let order = self.lifecycle.create_order(buyer, self.checkout()).await?;
        Ok((order, vendor))
    }
}

/// Delegates to a `MemoryStore` but refuses every decrement of one product, as if
/// another buyer took the last units between validation and commit.
pub(crate) struct StockFailingCatalog {
    inner: Arc<MemoryStore>,
    fail_on: ProductId,
}

impl StockFailingCatalog {
    pub fn new(inner: Arc<MemoryStore>, fail_on: ProductId) -> Self { Self { inner, fail_on } }
}

#[async_trait]
impl CatalogStore for StockFailingCatalog {
    async fn get_product(&self, id: ProductId) -> Result<Option<Product>> { self.inner.get_product(id).await }

    async fn find_products(&self, filter: ProductFilter) -> Result<Vec<Product>> { self.inner.find_products(filter).await }

    async fn adjust_stock(&self, id: ProductId, delta: i64) -> Result<StockLevel> {
        if id == self.fail_on && delta < 0 {
            return Err(MarketplaceError::InsufficientStock {
                product: id,
                requested: u32::try_from(-delta).unwrap_or(u32::MAX),
                available: 0,
            });
        }
        self.inner.adjust_stock(id, delta).await
    }

    async fn adjust_purchases(&self, id: ProductId, delta: i64) -> Result<()> { self.inner.adjust_purchases(id, delta).await }
}

/// Delegates to a `MemoryStore` but, once armed, lets `n` order replacements
/// through and rejects the next one with `Conflict`, as if another writer got
/// there first.
pub(crate) struct ReplaceFailingOrders {
    inner: Arc<MemoryStore>,
    remaining: Mutex<Option<usize>>,
}

impl ReplaceFailingOrders {
    pub fn new(inner: Arc<MemoryStore>) -> Self { Self { inner, remaining: Mutex::new(None) } }

    pub fn fail_after(&self, n: usize) {
        *self.remaining.lock().expect("lock poisoned") = Some(n);
    }

    fn should_fail(&self) -> bool {
        let mut remaining = self.remaining.lock().expect("lock poisoned");
        match *remaining {
            Some(0) => {
                *remaining = None;
                true
            }
            Some(n) => {
                *remaining = Some(n - 1);
                false
            }
            None => false,
        }
    }
}

#[async_trait]
impl OrderStore for ReplaceFailingOrders {
    async fn next_order_sequence(&self) -> Result<u64> { self.inner.next_order_sequence().await }

    async fn insert_order(&self, order: Order) -> Result<Order> { self.inner.insert_order(order).await }

    async fn get_order(&self, id: OrderId) -> Result<Option<Order>> { self.inner.get_order(id).await }

    async fn find_by_order_number(&self, number: &OrderNumber) -> Result<Option<Order>> {
        self.inner.find_by_order_number(number).await
    }

    async fn replace_order(&self, order: Order) -> Result<Order> {
        if self.should_fail() {
            return Err(MarketplaceError::Conflict(format!("order {} was modified concurrently", order.order_number())));
        }
        self.inner.replace_order(order).await
    }

    async fn orders_for_user(&self, user: UserId, page: Page) -> Result<Vec<Order>> { self.inner.orders_for_user(user, page).await }

    async fn orders_for_vendor(&self, vendor: UserId, page: Page) -> Result<Vec<Order>> {
        self.inner.orders_for_vendor(vendor, page).await
    }

    async fn orders_needing_reconciliation(&self) -> Result<Vec<Order>> { self.inner.orders_needing_reconciliation().await }
}
