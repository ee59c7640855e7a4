//! Marketplace Core
//!
//! Cart and order lifecycle for a multi-vendor marketplace backend.
//!
//! ## Features
//! - Self-healing carts reconciled against live catalog price and stock
//! - Checkout with commit-time stock validation and atomic stock adjustment
//! - Order status state machine with vendor/admin gated transitions
//! - Cancellation with stock restoration and refunds
//! - PostgreSQL and in-memory stores, NATS notifications

use sqlx::error::{DatabaseError, ErrorKind};
use thiserror::Error;

pub mod config;
pub mod domain;
pub mod integrations;
pub mod services;
pub mod store;

pub use config::{PricingPolicy, Settings};
pub use domain::aggregates::{
    Actor, Cart, CartItem, Coupon, CouponDiscount, Order, OrderItem, OrderStatus, PaymentInfo,
    PaymentMethod, PaymentState, Product, ProductStatus, Role, ShippingMethod, StatusChange,
};
pub use domain::events::Notification;
pub use domain::value_objects::{
    CartId, Money, OrderId, OrderNumber, ProductId, ShippingAddress, UserId, Variant,
};
pub use services::{CartEngine, CheckoutRequest, OrderLifecycle, StatusUpdate};

// =============================================================================
// Error Types
// =============================================================================

#[derive(Error, Debug)]
pub enum MarketplaceError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("{entity} {id} is unavailable: {reason}")]
    Unavailable { entity: &'static str, id: String, reason: String },

    #[error("insufficient stock for product {product}: requested {requested}, available {available}")]
    InsufficientStock { product: ProductId, requested: u32, available: i64 },

    #[error("cart is empty")]
    EmptyCart,

    #[error("cannot change order status from {from} to {to}")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    #[error("not authorized: {0}")]
    Unauthorized(String),

    #[error("conflicting update: {0}")]
    Conflict(String),

    #[error("upstream failure: {0}")]
    UpstreamFailure(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("storage error")]
    Storage(#[source] sqlx::Error),
}

impl MarketplaceError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        Self::NotFound { entity, id: id.to_string() }
    }

    pub fn unavailable(entity: &'static str, id: impl ToString, reason: impl Into<String>) -> Self {
        Self::Unavailable { entity, id: id.to_string(), reason: reason.into() }
    }
}

impl From<sqlx::Error> for MarketplaceError {
    fn from(error: sqlx::Error) -> Self {
        match error.as_database_error().map(DatabaseError::kind) {
            Some(ErrorKind::UniqueViolation) => Self::Conflict(error.to_string()),
            Some(ErrorKind::CheckViolation) => Self::InvalidInput(error.to_string()),
            _ => Self::Storage(error),
        }
    }
}

impl From<validator::ValidationErrors> for MarketplaceError {
    fn from(errors: validator::ValidationErrors) -> Self {
        Self::InvalidInput(errors.to_string())
    }
}

pub type Result<T> = std::result::Result<T, MarketplaceError>;
