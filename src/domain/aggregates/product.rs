//! Product Aggregate
//!
//! The catalog owns products; this core reads them and mutates stock and the
//! purchase counter only through the store's atomic adjustments.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::domain::value_objects::{Money, ProductId, UserId};
use crate::{MarketplaceError, Result};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub vendor: UserId,
    pub name: String,
    pub images: Vec<String>,
    pub price: Money,
    /// Out of 100.
    pub discount_percent: Decimal,
    pub stock: i64,
    pub track_quantity: bool,
    pub allow_backorder: bool,
    pub status: ProductStatus,
    pub purchases: i64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus { #[default] Draft, Active, Inactive, OutOfStock }

impl ProductStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Active => "active",
            Self::Inactive => "inactive",
            Self::OutOfStock => "out_of_stock",
        }
    }
}

impl fmt::Display for ProductStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for ProductStatus {
    type Err = MarketplaceError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "draft" => Ok(Self::Draft),
            "active" => Ok(Self::Active),
            "inactive" => Ok(Self::Inactive),
            "out_of_stock" => Ok(Self::OutOfStock),
            other => Err(MarketplaceError::InvalidInput(format!("unknown product status {other}"))),
        }
    }
}

impl Product {
    pub fn new(vendor: UserId, name: impl Into<String>, price: Money, stock: i64) -> Self {
        Self {
            id: ProductId::new(),
            vendor,
            name: name.into(),
            images: vec![],
            price,
            discount_percent: Decimal::ZERO,
            stock,
            track_quantity: true,
            allow_backorder: false,
            status: ProductStatus::Active,
            purchases: 0,
            updated_at: Utc::now(),
        }
    }

    pub fn is_active(&self) -> bool { self.status == ProductStatus::Active }

    /// Price after the product-level percentage discount.
    pub fn effective_price(&self) -> Money {
        if self.discount_percent > Decimal::ZERO {
            (self.price - self.price.percent(self.discount_percent)).rounded()
        } else {
            self.price
        }
    }

    pub fn can_fulfil(&self, quantity: u32) -> bool {
        !self.track_quantity || self.allow_backorder || self.stock >= i64::from(quantity)
    }

    /// The largest quantity a cart line may hold, `None` when unbounded.
    pub fn quantity_cap(&self) -> Option<u32> {
        if !self.track_quantity || self.allow_backorder {
            return None;
        }
        Some(u32::try_from(self.stock.max(0)).unwrap_or(u32::MAX))
    }

    /// Active and able to supply `quantity` units.
    pub fn ensure_orderable(&self, quantity: u32) -> Result<()> {
        if !self.is_active() {
            return Err(MarketplaceError::unavailable("product", self.id, format!("{} is {}", self.name, self.status)));
        }
        if !self.can_fulfil(quantity) {
            return Err(MarketplaceError::InsufficientStock { product: self.id, requested: quantity, available: self.stock });
        }
        Ok(())
    }

    pub fn cover_image(&self) -> String { self.images.first().cloned().unwrap_or_default() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_price_applies_discount() {
        let mut p = Product::new(UserId::new(), "Kettle", Money::from_major(1000), 5);
        assert_eq!(p.effective_price(), Money::from_major(1000));
        p.discount_percent = Decimal::new(15, 0);
        assert_eq!(p.effective_price(), Money::from_major(850));
    }

    #[test]
    fn test_ensure_orderable() {
        let mut p = Product::new(UserId::new(), "Lamp", Money::from_major(10), 3);
        assert!(p.ensure_orderable(3).is_ok());
        assert!(matches!(p.ensure_orderable(4), Err(MarketplaceError::InsufficientStock { requested: 4, available: 3, .. })));
        p.allow_backorder = true;
        assert!(p.ensure_orderable(4).is_ok());
        p.status = ProductStatus::Inactive;
        assert!(matches!(p.ensure_orderable(1), Err(MarketplaceError::Unavailable { .. })));
    }

    #[test]
    fn test_quantity_cap() {
        let mut p = Product::new(UserId::new(), "Mug", Money::from_major(4), -2);
        assert_eq!(p.quantity_cap(), Some(0));
        p.track_quantity = false;
        assert_eq!(p.quantity_cap(), None);
    }
}
