//! Application services: the cart engine and the order lifecycle.

pub mod cart;
pub mod orders;
pub mod payments;

pub use cart::CartEngine;
pub use orders::{CheckoutRequest, OrderLifecycle, StatusUpdate};

#[cfg(test)]
pub(crate) mod test_support;
