//! Runtime configuration read from the environment.

use chrono::Duration;
use rust_decimal::Decimal;
use std::env;
use std::str::FromStr;
use thiserror::Error;

use crate::domain::value_objects::Money;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),

    #[error("invalid value {value:?} for {key}")]
    Invalid { key: &'static str, value: String },
}

/// Prices, tax and cart retention shared by the cart engine and checkout.
#[derive(Clone, Debug, PartialEq)]
pub struct PricingPolicy {
    /// Plain rate, `0.18` for 18%.
    pub tax_rate: Decimal,
    /// Orders whose subtotal is strictly above this ship for free.
    pub free_shipping_threshold: Money,
    pub shipping_fee: Money,
    pub currency: String,
    pub cart_retention: Duration,
}

impl PricingPolicy {
    pub fn shipping_cost_for(&self, subtotal: Money) -> Money {
        if subtotal > self.free_shipping_threshold { Money::ZERO } else { self.shipping_fee }
    }
}

impl Default for PricingPolicy {
    fn default() -> Self {
        Self {
            tax_rate: Decimal::new(18, 2),
            free_shipping_threshold: Money::from_major(500),
            shipping_fee: Money::from_major(50),
            currency: "INR".into(),
            cart_retention: Duration::days(30),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub database_url: String,
    pub database_max_connections: u32,
    pub sweep_interval: std::time::Duration,
    pub pricing: PricingPolicy,
}

impl Settings {
    /// Reads settings from the process environment. Call `dotenvy::dotenv()` first
    /// to pick up a `.env` file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = PricingPolicy::default();
        let database_url = lookup("DATABASE_URL").ok_or(ConfigError::Missing("DATABASE_URL"))?;
        let retention_days: i64 = parse_or(&lookup, "CART_RETENTION_DAYS", 30)?;
        let sweep_secs: u64 = parse_or(&lookup, "SWEEP_INTERVAL_SECS", 300)?;
        Ok(Self {
            database_url,
            database_max_connections: parse_or(&lookup, "DATABASE_MAX_CONNECTIONS", 10)?,
            sweep_interval: std::time::Duration::from_secs(sweep_secs),
            pricing: PricingPolicy {
                tax_rate: parse_or(&lookup, "TAX_RATE", defaults.tax_rate)?,
                free_shipping_threshold: Money::new(parse_or(&lookup, "FREE_SHIPPING_THRESHOLD", defaults.free_shipping_threshold.amount())?),
                shipping_fee: Money::new(parse_or(&lookup, "SHIPPING_FEE", defaults.shipping_fee.amount())?),
                currency: lookup("CURRENCY").unwrap_or(defaults.currency),
                cart_retention: Duration::days(retention_days),
            },
        })
    }
}

fn parse_or<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &'static str, default: T) -> Result<T, ConfigError> {
    match lookup(key) {
        None => Ok(default),
        Some(value) => value.trim().parse().map_err(|_| ConfigError::Invalid { key, value }),
    }
}
