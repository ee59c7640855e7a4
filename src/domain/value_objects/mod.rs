//! Value Objects for the marketplace core

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::iter::Sum;
use std::ops::{Add, Sub};
use uuid::Uuid;
use validator::Validate;

macro_rules! typed_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            pub fn new() -> Self { Self(Uuid::now_v7()) }
            pub const fn from_uuid(uuid: Uuid) -> Self { Self(uuid) }
            pub const fn into_uuid(self) -> Uuid { self.0 }
        }

        impl Default for $name { fn default() -> Self { Self::new() } }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { fmt::Display::fmt(&self.0, f) }
        }

        impl From<Uuid> for $name {
            fn from(value: Uuid) -> Self { Self(value) }
        }
    };
}

typed_id!(
    /// Buyer, vendor or administrator account
    UserId
);
typed_id!(
    /// Catalog product
    ProductId
);
typed_id!(CartId);
typed_id!(OrderId);

/// Money value object.
///
/// Amounts are in the deployment currency's major unit; the currency code itself
/// travels on payment records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Money(Decimal);

impl Money {
    pub const ZERO: Money = Money(Decimal::ZERO);

    pub const fn new(amount: Decimal) -> Self { Self(amount) }
    pub fn from_major(units: i64) -> Self { Self(Decimal::from(units)) }
    pub const fn amount(&self) -> Decimal { self.0 }
    pub fn is_zero(&self) -> bool { self.0.is_zero() }
    pub fn multiply(&self, qty: u32) -> Money { Money(self.0 * Decimal::from(qty)) }

    /// `percent` is expressed out of 100.
    pub fn percent(&self, percent: Decimal) -> Money { Money(self.0 * percent / Decimal::ONE_HUNDRED) }

    /// Multiply by a plain rate such as `0.18`.
    pub fn scale(&self, rate: Decimal) -> Money { Money(self.0 * rate) }

    pub fn rounded(&self) -> Money {
        Money(self.0.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero))
    }
}

impl Add for Money {
    type Output = Money;
    fn add(self, rhs: Money) -> Money { Money(self.0 + rhs.0) }
}

impl Sub for Money {
    type Output = Money;
    fn sub(self, rhs: Money) -> Money { Money(self.0 - rhs.0) }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Money>>(iter: I) -> Money { iter.fold(Money::ZERO, Add::add) }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "{:.2}", self.0) }
}

/// Product variant selector, e.g. `{ name: "size", value: "M" }`.
///
/// Cart line identity compares variants structurally, so two lines for the same
/// product only merge when both carry equal variants or both carry none.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Variant {
    pub name: String,
    pub value: String,
}

impl Variant {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self { name: name.into(), value: value.into() }
    }
}

/// Human-readable order reference used on receipts and support emails.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OrderNumber(String);

impl OrderNumber {
    /// `ORD-<unix millis>-<sequence padded to 6 digits>`. The sequence comes from
    /// the order store and never repeats, so numbers cannot collide.
    pub fn generate(at: DateTime<Utc>, sequence: u64) -> Self {
        Self(format!("ORD-{}-{:06}", at.timestamp_millis(), sequence))
    }

    pub fn as_str(&self) -> &str { &self.0 }
}

impl From<String> for OrderNumber {
    fn from(value: String) -> Self { Self(value) }
}

impl fmt::Display for OrderNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role { Customer, Vendor, Admin }

/// The authenticated account performing an operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub id: UserId,
    pub role: Role,
}

impl Actor {
    pub fn customer(id: UserId) -> Self { Self { id, role: Role::Customer } }
    pub fn vendor(id: UserId) -> Self { Self { id, role: Role::Vendor } }
    pub fn admin(id: UserId) -> Self { Self { id, role: Role::Admin } }
    pub fn is_admin(&self) -> bool { self.role == Role::Admin }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct ShippingAddress {
    #[validate(length(min = 1, max = 200))]
    pub street: String,
    #[validate(length(min = 1, max = 100))]
    pub city: String,
    #[validate(length(min = 1, max = 100))]
    pub state: String,
    #[validate(length(min = 3, max = 12))]
    pub zip_code: String,
    #[validate(length(min = 2, max = 100))]
    pub country: String,
}
