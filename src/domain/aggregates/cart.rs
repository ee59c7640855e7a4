//! Cart Aggregate

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::config::PricingPolicy;
use crate::domain::aggregates::product::Product;
use crate::domain::value_objects::{CartId, Money, ProductId, UserId, Variant};
use crate::{MarketplaceError, Result};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Cart {
    id: CartId,
    owner: UserId,
    items: Vec<CartItem>,
    subtotal: Money,
    tax: Money,
    discount: Money,
    total: Money,
    coupon: Option<Coupon>,
    expires_at: DateTime<Utc>,
    revision: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct CartItem {
    pub product: ProductId,
    pub quantity: u32,
    pub unit_price: Money,
    pub variant: Option<Variant>,
    pub added_at: DateTime<Utc>,
}

impl CartItem {
    pub fn line_total(&self) -> Money { self.unit_price.multiply(self.quantity) }

    fn is(&self, product: &ProductId, variant: Option<&Variant>) -> bool {
        self.product == *product && self.variant.as_ref() == variant
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Coupon {
    pub code: String,
    pub discount: CouponDiscount,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CouponDiscount {
    /// Out of 100, applied to the subtotal.
    Percentage(Decimal),
    Fixed(Money),
}

impl Coupon {
    pub fn percentage(code: impl Into<String>, percent: Decimal) -> Self {
        Self { code: code.into(), discount: CouponDiscount::Percentage(percent) }
    }

    pub fn fixed(code: impl Into<String>, amount: Money) -> Self {
        Self { code: code.into(), discount: CouponDiscount::Fixed(amount) }
    }

    pub fn discount_for(&self, subtotal: Money) -> Money {
        match &self.discount {
            CouponDiscount::Percentage(percent) => subtotal.percent(*percent).rounded(),
            CouponDiscount::Fixed(amount) => *amount,
        }
    }

    fn validate(&self) -> Result<()> {
        let valid = match &self.discount {
            CouponDiscount::Percentage(p) => *p >= Decimal::ZERO && *p <= Decimal::ONE_HUNDRED,
            CouponDiscount::Fixed(amount) => amount.amount() >= Decimal::ZERO,
        };
        if self.code.trim().is_empty() || !valid {
            return Err(MarketplaceError::InvalidInput(format!("invalid coupon {:?}", self.code)));
        }
        Ok(())
    }
}

impl Cart {
    pub fn new(owner: UserId, policy: &PricingPolicy) -> Self {
        let now = Utc::now();
        Self {
            id: CartId::new(), owner, items: vec![], subtotal: Money::ZERO, tax: Money::ZERO,
            discount: Money::ZERO, total: Money::ZERO, coupon: None,
            expires_at: now + policy.cart_retention, revision: 0, created_at: now, updated_at: now,
        }
    }

    pub fn id(&self) -> CartId { self.id }
    pub fn owner(&self) -> UserId { self.owner }
    pub fn items(&self) -> &[CartItem] { &self.items }
    pub fn subtotal(&self) -> Money { self.subtotal }
    pub fn tax(&self) -> Money { self.tax }
    pub fn discount(&self) -> Money { self.discount }
    pub fn total(&self) -> Money { self.total }
    pub fn coupon(&self) -> Option<&Coupon> { self.coupon.as_ref() }
    pub fn expires_at(&self) -> DateTime<Utc> { self.expires_at }
    pub fn revision(&self) -> u64 { self.revision }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool { self.expires_at <= now }

    pub fn line(&self, product: &ProductId, variant: Option<&Variant>) -> Option<&CartItem> {
        self.items.iter().find(|i| i.is(product, variant))
    }

    /// Adds `quantity` units, merging into an existing (product, variant) line.
    /// Validation happens before any change, so a rejected add leaves the cart untouched.
    pub fn add_item(&mut self, product: &Product, quantity: u32, variant: Option<Variant>, policy: &PricingPolicy) -> Result<()> {
        if quantity == 0 {
            return Err(MarketplaceError::InvalidInput("quantity must be at least 1".into()));
        }
        let price = product.effective_price();
        match self.items.iter_mut().find(|i| i.is(&product.id, variant.as_ref())) {
            Some(existing) => {
                let merged = existing.quantity.checked_add(quantity)
                    .ok_or_else(|| MarketplaceError::InvalidInput("quantity overflow".into()))?;
                product.ensure_orderable(merged)?;
                existing.quantity = merged;
                existing.unit_price = price;
            }
            None => {
                product.ensure_orderable(quantity)?;
                self.items.push(CartItem { product: product.id, quantity, unit_price: price, variant, added_at: Utc::now() });
            }
        }
        self.recalculate(policy);
        Ok(())
    }

    /// `quantity <= 0` removes the line. Updating a line the cart does not hold is a no-op.
    pub fn update_quantity(&mut self, product: &Product, quantity: i64, variant: Option<&Variant>, policy: &PricingPolicy) -> Result<()> {
        if quantity <= 0 {
            self.remove_item(&product.id, variant, policy);
            return Ok(());
        }
        let quantity = u32::try_from(quantity)
            .map_err(|e| MarketplaceError::InvalidInput(format!("quantity {quantity}: {e}")))?;
        product.ensure_orderable(quantity)?;
        if let Some(item) = self.items.iter_mut().find(|i| i.is(&product.id, variant)) {
            item.quantity = quantity;
            item.unit_price = product.effective_price();
            self.recalculate(policy);
        }
        Ok(())
    }

    /// Returns whether a line was removed.
    pub fn remove_item(&mut self, product: &ProductId, variant: Option<&Variant>, policy: &PricingPolicy) -> bool {
        let before = self.items.len();
        self.items.retain(|i| !i.is(product, variant));
        let removed = self.items.len() != before;
        if removed { self.recalculate(policy); }
        removed
    }

    pub fn clear(&mut self, policy: &PricingPolicy) {
        self.items.clear();
        self.coupon = None;
        self.recalculate(policy);
    }

    pub fn apply_coupon(&mut self, coupon: Coupon, policy: &PricingPolicy) -> Result<()> {
        coupon.validate()?;
        self.coupon = Some(coupon);
        self.recalculate(policy);
        Ok(())
    }

    pub fn remove_coupon(&mut self, policy: &PricingPolicy) {
        if self.coupon.take().is_some() { self.recalculate(policy); }
    }

    /// Brings every line in line with the live catalog: lines whose product is gone
    /// or no longer active are dropped, price snapshots follow the current price and
    /// quantities are clamped to tracked stock. Returns whether anything changed.
    pub fn reconcile(&mut self, catalog: &HashMap<ProductId, Product>, policy: &PricingPolicy) -> bool {
        let mut changed = false;
        self.items.retain_mut(|item| {
            let Some(product) = catalog.get(&item.product).filter(|p| p.is_active()) else {
                changed = true;
                return false;
            };
            let price = product.effective_price();
            if item.unit_price != price {
                item.unit_price = price;
                changed = true;
            }
            if let Some(cap) = product.quantity_cap().filter(|cap| item.quantity > *cap) {
                item.quantity = cap;
                changed = true;
            }
            if item.quantity == 0 {
                changed = true;
                return false;
            }
            true
        });
        if changed { self.recalculate(policy); }
        changed
    }

    /// Tax is charged on the pre-discount subtotal; the discount never exceeds
    /// subtotal plus tax.
    fn recalculate(&mut self, policy: &PricingPolicy) {
        self.subtotal = self.items.iter().map(CartItem::line_total).sum();
        self.tax = self.subtotal.scale(policy.tax_rate).rounded();
        let gross = self.subtotal + self.tax;
        self.discount = self.coupon.as_ref().map_or(Money::ZERO, |c| c.discount_for(self.subtotal)).min(gross);
        self.total = gross - self.discount;
        let now = Utc::now();
        self.updated_at = now;
        self.expires_at = now + policy.cart_retention;
    }

    pub(crate) fn set_revision(&mut self, revision: u64) { self.revision = revision; }
}
