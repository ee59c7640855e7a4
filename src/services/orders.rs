//! Order Lifecycle
//!
//! Turns a cart into an order, walks the order through its status table and
//! keeps catalog stock in step with it. Payment-facing operations live in
//! `payments.rs`.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{error, info, warn};
use validator::Validate;

use crate::domain::aggregates::{
    Cart, NewOrder, Order, OrderItem, OrderStatus, PaymentMethod, ShippingInfo, ShippingMethod, Tracking,
};
use crate::domain::events::Notification;
use crate::domain::value_objects::{Actor, OrderId, OrderNumber, ProductId, ShippingAddress, UserId};
use crate::integrations::{NotificationSink, PaymentGateway, Refund};
use crate::services::CartEngine;
use crate::store::{CatalogStore, OrderStore, Page};
use crate::{MarketplaceError, Result};

const MAX_NOTES_LEN: usize = 1000;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CheckoutRequest {
    pub shipping_address: ShippingAddress,
    #[serde(default)]
    pub shipping_method: ShippingMethod,
    pub payment_method: PaymentMethod,
    #[serde(default)]
    pub payment_details: serde_json::Value,
    pub notes: Option<String>,
}

impl CheckoutRequest {
    pub fn new(shipping_address: ShippingAddress, payment_method: PaymentMethod) -> Self {
        Self {
            shipping_address,
            shipping_method: ShippingMethod::default(),
            payment_method,
            payment_details: serde_json::Value::Null,
            notes: None,
        }
    }

    fn check(&self) -> Result<()> {
        self.shipping_address.validate()?;
        if self.notes.as_ref().is_some_and(|notes| notes.chars().count() > MAX_NOTES_LEN) {
            return Err(MarketplaceError::InvalidInput(format!("notes exceed {MAX_NOTES_LEN} characters")));
        }
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: OrderStatus,
    pub note: Option<String>,
    pub tracking: Option<Tracking>,
}

impl StatusUpdate {
    pub fn to(status: OrderStatus) -> Self { Self { status, note: None, tracking: None } }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }

    pub fn with_tracking(mut self, number: impl Into<String>, carrier: impl Into<String>) -> Self {
        self.tracking = Some(Tracking { number: number.into(), carrier: carrier.into() });
        self
    }
}

#[derive(Clone)]
pub struct OrderLifecycle {
    pub(super) carts: CartEngine,
    pub(super) catalog: Arc<dyn CatalogStore>,
    pub(super) orders: Arc<dyn OrderStore>,
    pub(super) payments: Arc<dyn PaymentGateway>,
    pub(super) notifications: Arc<dyn NotificationSink>,
}

impl OrderLifecycle {
    pub fn new(
        carts: CartEngine,
        orders: Arc<dyn OrderStore>,
        payments: Arc<dyn PaymentGateway>,
        notifications: Arc<dyn NotificationSink>,
    ) -> Self {
        let catalog = carts.catalog();
        Self { carts, catalog, orders, payments, notifications }
    }

    /// Checks the user's cart out into a `pending` order.
    ///
    /// Every line is re-validated against the live catalog before anything is
    /// written. The cart is then claimed with a revision check, so a second
    /// concurrent checkout of the same cart fails with `Conflict`. Stock is
    /// decremented line by line once the order exists; if that fails the applied
    /// lines are put back, the order is flagged for reconciliation, the cart is
    /// restored and the error is returned.
    #[tracing::instrument(
        name = "orders.create_order",
        skip(self, request),
        fields(user = %user, order_number = tracing::field::Empty),
        err
    )]
    pub async fn create_order(&self, user: UserId, request: CheckoutRequest) -> Result<Order> {
        request.check()?;
        let cart = self.carts.load_current(user).await?
            .filter(|cart| !cart.is_empty())
            .ok_or(MarketplaceError::EmptyCart)?;
        let items = self.snapshot(&cart).await?;

        let mut claimed = cart.clone();
        claimed.clear(self.carts.policy());
        let claimed = self.carts.save(claimed).await?;

        let order = match self.write_order(user, &cart, items, request).await {
            Ok(order) => order,
            Err(error) => {
                self.restore_cart(cart, &claimed).await;
                return Err(error);
            }
        };
        tracing::Span::current().record("order_number", order.order_number().as_str());

        if let Err(error) = self.commit_stock(&order).await {
            return Err(self.abandon_checkout(order, cart, &claimed, error).await);
        }

        info!(order_number = %order.order_number(), total = %order.total(), lines = order.items().len(), "order placed");
        for vendor in order.vendors() {
            self.notify(vendor, Notification::new_order(&order)).await;
        }
        Ok(order)
    }

    /// Moves an order along the status table on behalf of one of its vendors or
    /// an administrator. Entering `cancelled` this way settles the cancellation
    /// like a buyer cancel does.
    #[tracing::instrument(
        name = "orders.update_status",
        skip(self, update, actor),
        fields(order = %order_id, actor = %actor.id, status = %update.status),
        err
    )]
    pub async fn update_status(&self, order_id: OrderId, update: StatusUpdate, actor: &Actor) -> Result<Order> {
        let mut order = self.load_order(order_id).await?;
        if !order.is_manageable_by(actor) {
            return Err(MarketplaceError::Unauthorized(format!(
                "{} cannot manage order {}", actor.id, order.order_number()
            )));
        }
        Self::ensure_reconciled(&order)?;

        let StatusUpdate { status, note, tracking } = update;
        if status == OrderStatus::Cancelled {
            let reason = note.clone().unwrap_or_else(|| "Cancelled by seller".into());
            order.cancel(actor.id, reason)?;
        } else {
            order.transition(status, actor.id, note.clone())?;
        }
        if let Some(tracking) = tracking {
            order.set_tracking(tracking);
        }

        let mut order = self.orders.replace_order(order).await?;
        if status == OrderStatus::Cancelled {
            order = self.settle_cancellation(order, "cancelled_by_seller").await?;
        }
        info!(order_number = %order.order_number(), %status, "order status updated");
        self.notify(order.user(), Notification::status_changed(&order, note)).await;
        Ok(order)
    }

    /// The order, if `actor` is its buyer, one of its vendors or an administrator.
    pub async fn get_order(&self, order_id: OrderId, actor: &Actor) -> Result<Order> {
        let order = self.load_order(order_id).await?;
        Self::ensure_visible(order, actor)
    }

    pub async fn get_order_by_number(&self, number: &OrderNumber, actor: &Actor) -> Result<Order> {
        let order = self.orders.find_by_order_number(number).await?
            .ok_or_else(|| MarketplaceError::not_found("order", number))?;
        Self::ensure_visible(order, actor)
    }

    pub async fn orders_for_user(&self, user: UserId, page: Page) -> Result<Vec<Order>> {
        self.orders.orders_for_user(user, page).await
    }

    pub async fn orders_for_vendor(&self, vendor: UserId, page: Page) -> Result<Vec<Order>> {
        self.orders.orders_for_vendor(vendor, page).await
    }

    pub async fn orders_needing_reconciliation(&self) -> Result<Vec<Order>> {
        self.orders.orders_needing_reconciliation().await
    }

    pub(super) async fn load_order(&self, order_id: OrderId) -> Result<Order> {
        self.orders.get_order(order_id).await?.ok_or_else(|| MarketplaceError::not_found("order", order_id))
    }

    /// A refund went through at the gateway but the order carrying it could not
    /// be written. Flags the latest stored copy so the refund is not issued twice.
    pub(super) async fn flag_unrecorded_refund(&self, order_id: OrderId, refund: &Refund, cause: &MarketplaceError) {
        error!(order = %order_id, refund_id = %refund.refund_id, amount = %refund.amount, error = %cause, "refund issued but not recorded");
        let mut latest = match self.load_order(order_id).await {
            Ok(order) => order,
            Err(error) => {
                error!(order = %order_id, %error, "failed to reload order after unrecorded refund");
                return;
            }
        };
        latest.flag_for_reconciliation(format!(
            "refund {} of {} issued but not recorded: {cause}", refund.refund_id, refund.amount
        ));
        if let Err(error) = self.orders.replace_order(latest).await {
            error!(order = %order_id, refund_id = %refund.refund_id, %error, "failed to flag order after unrecorded refund");
        }
    }

    /// A flagged order's stock and payment are out of step with its status, so
    /// nothing may move it until it has been reconciled.
    pub(super) fn ensure_reconciled(order: &Order) -> Result<()> {
        match order.reconciliation() {
            Some(issue) => Err(MarketplaceError::Conflict(format!(
                "order {} needs reconciliation: {}", order.order_number(), issue.reason
            ))),
            None => Ok(()),
        }
    }

    pub(super) async fn notify(&self, target: UserId, notification: Notification) {
        let event = notification.event_name();
        if let Err(error) = self.notifications.emit(target, notification).await {
            warn!(%target, event, %error, "notification not delivered");
        }
    }

    /// Puts stock back for a cancelled order and refunds a completed payment.
    /// Failures flag the order for reconciliation; a refund failure wins over a
    /// stock failure as the returned error.
    pub(super) async fn settle_cancellation(&self, mut order: Order, refund_reason: &str) -> Result<Order> {
        let mut failure = None;
        let mut changed = false;

        if let Err(error) = self.restock(&order).await {
            order.flag_for_reconciliation(format!("stock restore failed: {error}"));
            changed = true;
            failure = Some(error);
        }

        let mut issued = None;
        if order.payment().is_completed() {
            match self.refund(&order, None, refund_reason).await {
                Ok(refund) => {
                    order.record_refund(refund.refund_id.clone(), refund.amount)?;
                    issued = Some(refund);
                }
                Err(error) => {
                    order.flag_for_reconciliation(format!("refund failed: {error}"));
                    failure = Some(error);
                }
            }
            changed = true;
        }

        if changed {
            let order_id = order.id();
            order = match self.orders.replace_order(order).await {
                Ok(order) => order,
                Err(error) => {
                    if let Some(refund) = issued {
                        self.flag_unrecorded_refund(order_id, &refund, &error).await;
                    }
                    return Err(error);
                }
            };
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(order),
        }
    }

    /// Returns stock and purchase counts for every line, attempting all of them
    /// and reporting the first failure.
    async fn restock(&self, order: &Order) -> Result<()> {
        let mut first_failure = None;
        for item in order.items() {
            if let Err(error) = self.restock_line(item).await {
                warn!(order_number = %order.order_number(), product = %item.product, %error, "stock restore failed");
                first_failure.get_or_insert(error);
            }
        }
        first_failure.map_or(Ok(()), Err)
    }

    async fn restock_line(&self, item: &OrderItem) -> Result<()> {
        let quantity = i64::from(item.quantity);
        match self.catalog.adjust_stock(item.product, quantity).await {
            Ok(_) => {}
            // Delisted products have nothing to restore.
            Err(MarketplaceError::NotFound { .. }) => return Ok(()),
            Err(error) => return Err(error),
        }
        self.catalog.adjust_purchases(item.product, -quantity).await
    }

    async fn snapshot(&self, cart: &Cart) -> Result<Vec<OrderItem>> {
        let mut requested: HashMap<ProductId, u32> = HashMap::new();
        for line in cart.items() {
            let total = requested.entry(line.product).or_default();
            *total = total.saturating_add(line.quantity);
        }

        let mut products = HashMap::with_capacity(requested.len());
        for (id, quantity) in requested {
            let product = self.catalog.get_product(id).await?
                .ok_or_else(|| MarketplaceError::unavailable("product", id, "no longer listed"))?;
            product.ensure_orderable(quantity)?;
            products.insert(id, product);
        }

        let mut items = Vec::with_capacity(cart.items().len());
        for line in cart.items() {
            let Some(product) = products.get(&line.product) else {
                return Err(MarketplaceError::unavailable("product", line.product, "no longer listed"));
            };
            items.push(OrderItem {
                product: product.id,
                vendor: product.vendor,
                name: product.name.clone(),
                image: product.cover_image(),
                unit_price: product.effective_price(),
                quantity: line.quantity,
                variant: line.variant.clone(),
            });
        }
        Ok(items)
    }

    async fn write_order(&self, user: UserId, cart: &Cart, items: Vec<OrderItem>, request: CheckoutRequest) -> Result<Order> {
        let sequence = self.orders.next_order_sequence().await?;
        let new = NewOrder {
            user,
            items,
            coupon: cart.coupon().cloned(),
            shipping: ShippingInfo { address: request.shipping_address, method: request.shipping_method, tracking: None },
            payment_method: request.payment_method,
            payment_details: request.payment_details,
            notes: request.notes,
        };
        let order = Order::place(OrderNumber::generate(Utc::now(), sequence), new, self.carts.policy());
        self.orders.insert_order(order).await
    }

    async fn commit_stock(&self, order: &Order) -> Result<()> {
        let mut applied: Vec<&OrderItem> = Vec::with_capacity(order.items().len());
        for item in order.items() {
            let quantity = i64::from(item.quantity);
            if let Err(error) = self.catalog.adjust_stock(item.product, -quantity).await {
                self.compensate(&applied).await;
                return Err(error);
            }
            if let Err(error) = self.catalog.adjust_purchases(item.product, quantity).await {
                if let Err(undo) = self.catalog.adjust_stock(item.product, quantity).await {
                    error!(product = %item.product, error = %undo, "failed to undo stock decrement");
                }
                self.compensate(&applied).await;
                return Err(error);
            }
            applied.push(item);
        }
        Ok(())
    }

    async fn compensate(&self, applied: &[&OrderItem]) {
        for item in applied {
            if let Err(undo) = self.restock_line(item).await {
                error!(product = %item.product, error = %undo, "failed to compensate stock adjustment");
            }
        }
    }

    async fn abandon_checkout(&self, mut order: Order, cart: Cart, claimed: &Cart, cause: MarketplaceError) -> MarketplaceError {
        let cause = match cause {
            MarketplaceError::InsufficientStock { product, .. } => MarketplaceError::Conflict(format!(
                "stock for product {product} changed during checkout; order {} flagged for reconciliation",
                order.order_number()
            )),
            other => other,
        };
        let number = order.order_number().clone();
        order.flag_for_reconciliation(cause.to_string());
        if let Err(persist) = self.orders.replace_order(order).await {
            error!(order_number = %number, error = %persist, "failed to flag order for reconciliation");
        }
        warn!(order_number = %number, error = %cause, "checkout aborted after the order was written");
        self.restore_cart(cart, claimed).await;
        cause
    }

    async fn restore_cart(&self, mut cart: Cart, claimed: &Cart) {
        cart.set_revision(claimed.revision());
        if let Err(error) = self.carts.save(cart).await {
            error!(user = %claimed.owner(), %error, "failed to restore cart after aborted checkout");
        }
    }

    fn ensure_visible(order: Order, actor: &Actor) -> Result<Order> {
        if !order.is_visible_to(actor) {
            return Err(MarketplaceError::Unauthorized(format!("{} cannot view order {}", actor.id, order.order_number())));
        }
        Ok(order)
    }
}
