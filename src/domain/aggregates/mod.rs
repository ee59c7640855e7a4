//! Aggregates module
pub mod product;
pub mod order;
pub mod cart;

pub use product::{Product, ProductStatus};
pub use order::{
    NewOrder, Order, OrderItem, OrderStatus, PaymentInfo, PaymentMethod, PaymentState, ReconciliationIssue,
    ShippingInfo, ShippingMethod, StatusChange, Timeline, Tracking,
};
pub use cart::{Cart, CartItem, Coupon, CouponDiscount};
pub use crate::domain::value_objects::{Actor, Role};
