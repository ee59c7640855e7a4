//! Order Aggregate

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::config::PricingPolicy;
use crate::domain::aggregates::cart::Coupon;
use crate::domain::value_objects::{Actor, Money, OrderId, OrderNumber, ProductId, ShippingAddress, UserId, Variant};
use crate::{MarketplaceError, Result};

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Order {
    id: OrderId,
    order_number: OrderNumber,
    user: UserId,
    items: Vec<OrderItem>,
    subtotal: Money,
    tax: Money,
    shipping_cost: Money,
    discount: Money,
    total: Money,
    coupon: Option<Coupon>,
    shipping: ShippingInfo,
    payment: PaymentInfo,
    status: OrderStatus,
    status_history: Vec<StatusChange>,
    timeline: Timeline,
    notes: Option<String>,
    cancellation_reason: Option<String>,
    reconciliation: Option<ReconciliationIssue>,
    revision: u64,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

/// Snapshot of a cart line and its product at checkout. Never refreshed.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub product: ProductId,
    pub vendor: UserId,
    pub name: String,
    pub image: String,
    pub unit_price: Money,
    pub quantity: u32,
    pub variant: Option<Variant>,
}

impl OrderItem {
    pub fn line_total(&self) -> Money { self.unit_price.multiply(self.quantity) }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus { #[default] Pending, Confirmed, Processing, Shipped, Delivered, Cancelled, Returned, Refunded }

impl OrderStatus {
    pub const ALL: [OrderStatus; 8] = [
        Self::Pending, Self::Confirmed, Self::Processing, Self::Shipped,
        Self::Delivered, Self::Cancelled, Self::Returned, Self::Refunded,
    ];

    /// Targets reachable through a status update. `Refunded` is absent on purpose:
    /// only the refund operation moves an order there.
    pub fn allowed_targets(&self) -> &'static [OrderStatus] {
        match self {
            Self::Pending => &[Self::Confirmed, Self::Cancelled],
            Self::Confirmed => &[Self::Processing, Self::Cancelled],
            Self::Processing => &[Self::Shipped, Self::Cancelled],
            Self::Shipped => &[Self::Delivered],
            Self::Delivered => &[Self::Returned],
            Self::Cancelled | Self::Returned | Self::Refunded => &[],
        }
    }

    pub fn can_transition_to(&self, target: OrderStatus) -> bool { self.allowed_targets().contains(&target) }
    pub fn is_terminal(&self) -> bool { matches!(self, Self::Cancelled | Self::Returned) }
    pub fn is_cancellable_by_buyer(&self) -> bool { matches!(self, Self::Pending | Self::Confirmed) }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Processing => "processing",
            Self::Shipped => "shipped",
            Self::Delivered => "delivered",
            Self::Cancelled => "cancelled",
            Self::Returned => "returned",
            Self::Refunded => "refunded",
        }
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(self.as_str()) }
}

impl FromStr for OrderStatus {
    type Err = MarketplaceError;

    fn from_str(s: &str) -> Result<Self> {
        Self::ALL.into_iter().find(|status| status.as_str() == s)
            .ok_or_else(|| MarketplaceError::InvalidInput(format!("unknown order status {s}")))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusChange {
    pub status: OrderStatus,
    pub actor: UserId,
    pub note: Option<String>,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Timeline {
    pub confirmed_at: Option<DateTime<Utc>>,
    pub shipped_at: Option<DateTime<Utc>>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub returned_at: Option<DateTime<Utc>>,
}

impl Timeline {
    fn stamp(&mut self, status: OrderStatus, at: DateTime<Utc>) {
        let slot = match status {
            OrderStatus::Confirmed => &mut self.confirmed_at,
            OrderStatus::Shipped => &mut self.shipped_at,
            OrderStatus::Delivered => &mut self.delivered_at,
            OrderStatus::Cancelled => &mut self.cancelled_at,
            OrderStatus::Returned => &mut self.returned_at,
            OrderStatus::Pending | OrderStatus::Processing | OrderStatus::Refunded => return,
        };
        *slot = Some(at);
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShippingMethod { #[default] Standard, Express, Overnight }

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Tracking {
    pub number: String,
    pub carrier: String,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ShippingInfo {
    pub address: ShippingAddress,
    pub method: ShippingMethod,
    pub tracking: Option<Tracking>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod { Stripe, Paypal, Razorpay, Cod }

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PaymentInfo {
    pub method: PaymentMethod,
    pub amount: Money,
    pub currency: String,
    /// Gateway-specific data supplied at checkout, stored as given.
    pub details: serde_json::Value,
    pub state: PaymentState,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PaymentState {
    Pending,
    Completed { transaction_id: String, paid_at: DateTime<Utc> },
    Failed { reason: String },
    Refunded { transaction_id: String, refund_id: String, refund_amount: Money, refunded_at: DateTime<Utc> },
}

impl PaymentInfo {
    pub fn is_completed(&self) -> bool { matches!(self.state, PaymentState::Completed { .. }) }

    pub fn transaction_id(&self) -> Option<&str> {
        match &self.state {
            PaymentState::Completed { transaction_id, .. } | PaymentState::Refunded { transaction_id, .. } => Some(transaction_id.as_str()),
            PaymentState::Pending | PaymentState::Failed { .. } => None,
        }
    }
}

/// Set when a checkout wrote the order but could not finish adjusting stock.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ReconciliationIssue {
    pub reason: String,
    pub flagged_at: DateTime<Utc>,
}

/// Everything needed to place an order besides its number.
#[derive(Clone, Debug)]
pub struct NewOrder {
    pub user: UserId,
    pub items: Vec<OrderItem>,
    pub coupon: Option<Coupon>,
    pub shipping: ShippingInfo,
    pub payment_method: PaymentMethod,
    pub payment_details: serde_json::Value,
    pub notes: Option<String>,
}

impl Order {
    /// Prices the items and opens the order as `pending`, seeding the history with
    /// the buyer's placement entry.
    pub fn place(order_number: OrderNumber, new: NewOrder, policy: &PricingPolicy) -> Self {
        let now = Utc::now();
        let subtotal: Money = new.items.iter().map(OrderItem::line_total).sum();
        let tax = subtotal.scale(policy.tax_rate).rounded();
        let shipping_cost = policy.shipping_cost_for(subtotal);
        let discount = new.coupon.as_ref().map_or(Money::ZERO, |c| c.discount_for(subtotal)).min(subtotal + tax);
        let total = subtotal + tax + shipping_cost - discount;
        Self {
            id: OrderId::new(),
            order_number,
            user: new.user,
            items: new.items,
            subtotal, tax, shipping_cost, discount, total,
            coupon: new.coupon,
            shipping: new.shipping,
            payment: PaymentInfo {
                method: new.payment_method,
                amount: total,
                currency: policy.currency.clone(),
                details: new.payment_details,
                state: PaymentState::Pending,
            },
            status: OrderStatus::Pending,
            status_history: vec![StatusChange { status: OrderStatus::Pending, actor: new.user, note: Some("Order placed".into()), at: now }],
            timeline: Timeline::default(),
            notes: new.notes,
            cancellation_reason: None,
            reconciliation: None,
            revision: 0,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> OrderId { self.id }
    pub fn order_number(&self) -> &OrderNumber { &self.order_number }
    pub fn user(&self) -> UserId { self.user }
    pub fn items(&self) -> &[OrderItem] { &self.items }
    pub fn subtotal(&self) -> Money { self.subtotal }
    pub fn tax(&self) -> Money { self.tax }
    pub fn shipping_cost(&self) -> Money { self.shipping_cost }
    pub fn discount(&self) -> Money { self.discount }
    pub fn total(&self) -> Money { self.total }
    pub fn coupon(&self) -> Option<&Coupon> { self.coupon.as_ref() }
    pub fn shipping(&self) -> &ShippingInfo { &self.shipping }
    pub fn payment(&self) -> &PaymentInfo { &self.payment }
    pub fn status(&self) -> OrderStatus { self.status }
    pub fn status_history(&self) -> &[StatusChange] { &self.status_history }
    pub fn timeline(&self) -> &Timeline { &self.timeline }
    pub fn notes(&self) -> Option<&str> { self.notes.as_deref() }
    pub fn cancellation_reason(&self) -> Option<&str> { self.cancellation_reason.as_deref() }
    pub fn reconciliation(&self) -> Option<&ReconciliationIssue> { self.reconciliation.as_ref() }
    pub fn needs_reconciliation(&self) -> bool { self.reconciliation.is_some() }
    pub fn revision(&self) -> u64 { self.revision }
    pub fn created_at(&self) -> DateTime<Utc> { self.created_at }
    pub fn updated_at(&self) -> DateTime<Utc> { self.updated_at }

    /// Distinct vendors, in the order their first line appears.
    pub fn vendors(&self) -> Vec<UserId> {
        let mut vendors: Vec<UserId> = Vec::new();
        for item in &self.items {
            if !vendors.contains(&item.vendor) { vendors.push(item.vendor); }
        }
        vendors
    }

    pub fn is_vendor(&self, user: UserId) -> bool { self.items.iter().any(|i| i.vendor == user) }

    /// Vendors of the order and administrators.
    pub fn is_manageable_by(&self, actor: &Actor) -> bool { actor.is_admin() || self.is_vendor(actor.id) }

    pub fn is_visible_to(&self, actor: &Actor) -> bool { actor.id == self.user || self.is_manageable_by(actor) }

    /// Applies a transition from the status table. Nothing changes when the
    /// transition is not allowed.
    pub fn transition(&mut self, to: OrderStatus, actor: UserId, note: Option<String>) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(MarketplaceError::InvalidTransition { from: self.status, to });
        }
        self.record_status(to, actor, note);
        Ok(())
    }

    pub fn cancel(&mut self, actor: UserId, reason: String) -> Result<()> {
        self.transition(OrderStatus::Cancelled, actor, Some(reason.clone()))?;
        self.cancellation_reason = Some(reason);
        Ok(())
    }

    pub fn set_tracking(&mut self, tracking: Tracking) {
        self.shipping.tracking = Some(tracking);
        self.touch();
    }

    pub fn complete_payment(&mut self, transaction_id: impl Into<String>) {
        self.payment.state = PaymentState::Completed { transaction_id: transaction_id.into(), paid_at: Utc::now() };
        self.touch();
    }

    /// Marks the payment refunded without touching the order status; cancellation
    /// refunds keep the order `cancelled`.
    pub fn record_refund(&mut self, refund_id: impl Into<String>, refund_amount: Money) -> Result<()> {
        let PaymentState::Completed { transaction_id, .. } = &self.payment.state else {
            return Err(MarketplaceError::not_found("payment", &self.order_number));
        };
        let transaction_id = transaction_id.clone();
        self.payment.state = PaymentState::Refunded {
            transaction_id,
            refund_id: refund_id.into(),
            refund_amount,
            refunded_at: Utc::now(),
        };
        self.touch();
        Ok(())
    }

    /// Moves the order to `refunded` outside the status table.
    pub fn mark_refunded(&mut self, actor: UserId, note: Option<String>) {
        self.record_status(OrderStatus::Refunded, actor, note);
    }

    pub fn flag_for_reconciliation(&mut self, reason: impl Into<String>) {
        self.reconciliation = Some(ReconciliationIssue { reason: reason.into(), flagged_at: Utc::now() });
        self.touch();
    }

    pub(crate) fn set_revision(&mut self, revision: u64) { self.revision = revision; }

    fn record_status(&mut self, status: OrderStatus, actor: UserId, note: Option<String>) {
        let now = Utc::now();
        self.status = status;
        self.status_history.push(StatusChange { status, actor, note, at: now });
        self.timeline.stamp(status, now);
        self.updated_at = now;
    }

    fn touch(&mut self) { self.updated_at = Utc::now(); }
}
