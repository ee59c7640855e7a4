//! Cart Engine
//!
//! Owns the per-user cart. Every read re-validates the lines against the live
//! catalog, and every write goes through the store's revision check.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, info};

use crate::config::PricingPolicy;
use crate::domain::aggregates::{Cart, Coupon, Product};
use crate::domain::value_objects::{ProductId, UserId, Variant};
use crate::store::{CartStore, CatalogStore, ProductFilter};
use crate::{MarketplaceError, Result};

#[derive(Clone)]
pub struct CartEngine {
    catalog: Arc<dyn CatalogStore>,
    carts: Arc<dyn CartStore>,
    policy: Arc<PricingPolicy>,
}

impl CartEngine {
    pub fn new(catalog: Arc<dyn CatalogStore>, carts: Arc<dyn CartStore>, policy: PricingPolicy) -> Self {
        Self { catalog, carts, policy: Arc::new(policy) }
    }

    pub fn policy(&self) -> &PricingPolicy { &self.policy }

    pub(crate) fn catalog(&self) -> Arc<dyn CatalogStore> { Arc::clone(&self.catalog) }

    /// Returns the user's cart, creating it on first use. Lines whose product is
    /// gone or inactive are dropped, prices follow the catalog and quantities are
    /// clamped to tracked stock; the healed cart is persisted when it changed.
    #[tracing::instrument(name = "cart.get_or_create", skip(self), fields(user = %user), err)]
    pub async fn get_or_create(&self, user: UserId) -> Result<Cart> {
        let Some(mut cart) = self.load_current(user).await? else {
            return self.carts.save_cart(Cart::new(user, &self.policy)).await;
        };
        if cart.is_empty() {
            return Ok(cart);
        }

        let catalog = self.products_in(&cart).await?;
        if cart.reconcile(&catalog, &self.policy) {
            debug!(cart = %cart.id(), "cart reconciled against catalog");
            return self.carts.save_cart(cart).await;
        }
        Ok(cart)
    }

    #[tracing::instrument(name = "cart.add_item", skip(self, variant), fields(user = %user, product = %product), err)]
    pub async fn add_item(&self, user: UserId, product: ProductId, quantity: u32, variant: Option<Variant>) -> Result<Cart> {
        let product = self.product(product).await?;
        let mut cart = self.load_or_new(user).await?;
        cart.add_item(&product, quantity, variant, &self.policy)?;
        self.carts.save_cart(cart).await
    }

    /// A quantity of zero or less removes the line.
    #[tracing::instrument(name = "cart.update_quantity", skip(self, variant), fields(user = %user, product = %product), err)]
    pub async fn update_quantity(&self, user: UserId, product: ProductId, quantity: i64, variant: Option<Variant>) -> Result<Cart> {
        if quantity <= 0 {
            return self.remove_item(user, product, variant).await;
        }
        let product = self.product(product).await?;
        let mut cart = self.load_or_new(user).await?;
        let held = cart.line(&product.id, variant.as_ref()).is_some();
        cart.update_quantity(&product, quantity, variant.as_ref(), &self.policy)?;
        if held || cart.revision() == 0 {
            return self.carts.save_cart(cart).await;
        }
        Ok(cart)
    }

    #[tracing::instrument(name = "cart.remove_item", skip(self, variant), fields(user = %user, product = %product), err)]
    pub async fn remove_item(&self, user: UserId, product: ProductId, variant: Option<Variant>) -> Result<Cart> {
        let Some(mut cart) = self.load_current(user).await? else {
            return self.get_or_create(user).await;
        };
        if cart.remove_item(&product, variant.as_ref(), &self.policy) {
            return self.carts.save_cart(cart).await;
        }
        Ok(cart)
    }

    #[tracing::instrument(name = "cart.clear", skip(self), fields(user = %user), err)]
    pub async fn clear(&self, user: UserId) -> Result<Cart> {
        let mut cart = self.load_or_new(user).await?;
        cart.clear(&self.policy);
        self.carts.save_cart(cart).await
    }

    #[tracing::instrument(name = "cart.apply_coupon", skip(self, coupon), fields(user = %user, code = %coupon.code), err)]
    pub async fn apply_coupon(&self, user: UserId, coupon: Coupon) -> Result<Cart> {
        let mut cart = self.load_or_new(user).await?;
        cart.apply_coupon(coupon, &self.policy)?;
        self.carts.save_cart(cart).await
    }

    #[tracing::instrument(name = "cart.remove_coupon", skip(self), fields(user = %user), err)]
    pub async fn remove_coupon(&self, user: UserId) -> Result<Cart> {
        let Some(mut cart) = self.load_current(user).await? else {
            return self.get_or_create(user).await;
        };
        if cart.coupon().is_none() {
            return Ok(cart);
        }
        cart.remove_coupon(&self.policy);
        self.carts.save_cart(cart).await
    }

    /// Deletes carts whose retention window has passed.
    #[tracing::instrument(name = "cart.purge_expired", skip(self), err)]
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> Result<u64> {
        let purged = self.carts.delete_expired_carts(now).await?;
        if purged > 0 {
            info!(purged, "expired carts deleted");
        }
        Ok(purged)
    }

    /// The stored cart, emptied if it outlived its retention window.
    pub(crate) async fn load_current(&self, user: UserId) -> Result<Option<Cart>> {
        let Some(mut cart) = self.carts.load_cart(user).await? else {
            return Ok(None);
        };
        if cart.is_expired(Utc::now()) && !cart.is_empty() {
            cart.clear(&self.policy);
        }
        Ok(Some(cart))
    }

    pub(crate) async fn save(&self, cart: Cart) -> Result<Cart> { self.carts.save_cart(cart).await }

    async fn load_or_new(&self, user: UserId) -> Result<Cart> {
        Ok(self.load_current(user).await?.unwrap_or_else(|| Cart::new(user, &self.policy)))
    }

    async fn product(&self, id: ProductId) -> Result<Product> {
        self.catalog.get_product(id).await?.ok_or_else(|| MarketplaceError::not_found("product", id))
    }

    async fn products_in(&self, cart: &Cart) -> Result<HashMap<ProductId, Product>> {
        let ids = cart.items().iter().map(|item| item.product);
        let products = self.catalog.find_products(ProductFilter::ids(ids)).await?;
        Ok(products.into_iter().map(|p| (p.id, p)).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::aggregates::{CartItem, ProductStatus};
    use crate::domain::value_objects::Money;
    use crate::store::MemoryStore;
    use testresult::TestResult;

    async fn engine_with(products: Vec<Product>) -> (Arc<MemoryStore>, CartEngine) {
        let store = Arc::new(MemoryStore::new());
        for product in products {
            store.insert_product(product).await;
        }
        let engine = CartEngine::new(store.clone(), store.clone(), PricingPolicy::default());
        (store, engine)
    }

    fn product(price: i64, stock: i64) -> Product {
        Product::new(UserId::new(), "Lamp", Money::from_major(price), stock)
    }

    fn assert_totals_consistent(cart: &Cart) {
        let subtotal: Money = cart.items().iter().map(CartItem::line_total).sum();
        assert_eq!(cart.subtotal(), subtotal);
        assert_eq!(cart.total(), cart.subtotal() + cart.tax() - cart.discount());
    }

    #[tokio::test]
    async fn test_get_or_create_is_lazy_and_stable() -> TestResult {
        let (_, engine) = engine_with(vec![]).await;
        let user = UserId::new();
        let first = engine.get_or_create(user).await?;
        let second = engine.get_or_create(user).await?;
        assert_eq!(first.id(), second.id());
        assert!(second.is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_add_unknown_product_is_not_found() -> TestResult {
        let (_, engine) = engine_with(vec![]).await;
        let err = engine.add_item(UserId::new(), ProductId::new(), 1, None).await.unwrap_err();
        assert!(matches!(err, MarketplaceError::NotFound { entity: "product", .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_inactive_product_is_unavailable() -> TestResult {
        let mut p = product(10, 5);
        p.status = ProductStatus::Inactive;
        let id = p.id;
        let (_, engine) = engine_with(vec![p]).await;
        let err = engine.add_item(UserId::new(), id, 1, None).await.unwrap_err();
        assert!(matches!(err, MarketplaceError::Unavailable { .. }));
        Ok(())
    }

    #[tokio::test]
    async fn test_rejected_add_leaves_stored_cart_unchanged() -> TestResult {
        let p = product(10, 3);
        let id = p.id;
        let (store, engine) = engine_with(vec![p]).await;
        let user = UserId::new();

        engine.add_item(user, id, 3, None).await?;
        let err = engine.add_item(user, id, 1, None).await.unwrap_err();
        assert!(matches!(err, MarketplaceError::InsufficientStock { requested: 4, available: 3, .. }));

        let stored = store.load_cart(user).await?.ok_or("cart missing")?;
        assert_eq!(stored.items()[0].quantity, 3);
        assert_totals_consistent(&stored);
        Ok(())
    }

    #[tokio::test]
    async fn test_read_heals_cart_against_catalog() -> TestResult {
        let (a, b, c) = (product(100, 10), product(40, 10), product(5, 10));
        let (a_id, b_id, c_id) = (a.id, b.id, c.id);
        let (store, engine) = engine_with(vec![a, b, c]).await;
        let user = UserId::new();

        engine.add_item(user, a_id, 2, None).await?;
        engine.add_item(user, b_id, 5, None).await?;
        engine.add_item(user, c_id, 1, None).await?;

        store.update_product(a_id, |p| p.status = ProductStatus::Inactive).await?;
        store.update_product(b_id, |p| { p.stock = 2; p.price = Money::from_major(50); }).await?;
        store.remove_product(c_id).await;

        let cart = engine.get_or_create(user).await?;
        assert_eq!(cart.items().len(), 1);
        assert_eq!(cart.items()[0].product, b_id);
        assert_eq!(cart.items()[0].quantity, 2);
        assert_eq!(cart.items()[0].unit_price, Money::from_major(50));
        assert_eq!(cart.subtotal(), Money::from_major(100));
        assert_totals_consistent(&cart);

        let stored = store.load_cart(user).await?.ok_or("cart missing")?;
        assert_eq!(stored.revision(), cart.revision());
        Ok(())
    }

    #[tokio::test]
    async fn test_update_and_remove() -> TestResult {
        let p = product(10, 10);
        let id = p.id;
        let (_, engine) = engine_with(vec![p]).await;
        let user = UserId::new();
        let medium = Some(Variant::new("size", "M"));

        engine.add_item(user, id, 1, medium.clone()).await?;
        let cart = engine.update_quantity(user, id, 4, medium.clone()).await?;
        assert_eq!(cart.items()[0].quantity, 4);

        let untouched = engine.update_quantity(user, id, 2, Some(Variant::new("size", "L"))).await?;
        assert_eq!(untouched.items().len(), 1);
        assert_eq!(untouched.items()[0].quantity, 4);

        let cart = engine.update_quantity(user, id, 0, medium.clone()).await?;
        assert!(cart.is_empty());
        let again = engine.remove_item(user, id, medium).await?;
        assert!(again.is_empty());
        assert_eq!(again.revision(), cart.revision());
        Ok(())
    }

    #[tokio::test]
    async fn test_coupon_and_clear() -> TestResult {
        let p = product(100, 10);
        let id = p.id;
        let (_, engine) = engine_with(vec![p]).await;
        let user = UserId::new();

        engine.add_item(user, id, 2, None).await?;
        let cart = engine.apply_coupon(user, Coupon::fixed("SAVE20", Money::from_major(20))).await?;
        assert_eq!(cart.total(), Money::from_major(216));

        let cart = engine.remove_coupon(user).await?;
        assert_eq!(cart.total(), Money::from_major(236));

        engine.apply_coupon(user, Coupon::fixed("SAVE20", Money::from_major(20))).await?;
        let cart = engine.clear(user).await?;
        assert!(cart.is_empty() && cart.coupon().is_none());
        assert_eq!(cart.total(), Money::ZERO);
        Ok(())
    }

    #[tokio::test]
    async fn test_purge_expired() -> TestResult {
        let (store, engine) = engine_with(vec![]).await;
        let user = UserId::new();
        engine.get_or_create(user).await?;

        assert_eq!(engine.purge_expired(Utc::now()).await?, 0);
        let later = Utc::now() + engine.policy().cart_retention + chrono::Duration::minutes(1);
        assert_eq!(engine.purge_expired(later).await?, 1);
        assert!(store.load_cart(user).await?.is_none());
        Ok(())
    }
}
