//! Payment-facing order operations: buyer cancellation, refunds and payment
//! confirmation through the gateway.

use tracing::info;

use crate::domain::aggregates::{Order, OrderStatus, PaymentState};
use crate::domain::events::Notification;
use crate::domain::value_objects::{Actor, Money, OrderId};
use crate::integrations::{IntentStatus, PaymentIntent, Refund};
use crate::services::OrderLifecycle;
use crate::{MarketplaceError, Result};

impl OrderLifecycle {
    /// Buyer cancellation. Only `pending` and `confirmed` orders qualify. Stock
    /// and purchase counts are restored for every line, and a completed payment
    /// is refunded in full exactly once.
    #[tracing::instrument(name = "orders.cancel_order", skip(self, actor, reason), fields(order = %order_id, actor = %actor.id), err)]
    pub async fn cancel_order(&self, order_id: OrderId, actor: &Actor, reason: String) -> Result<Order> {
        let mut order = self.load_order(order_id).await?;
        if actor.id != order.user() {
            return Err(MarketplaceError::Unauthorized(format!(
                "only the buyer can cancel order {}", order.order_number()
            )));
        }
        Self::ensure_reconciled(&order)?;
        if !order.status().is_cancellable_by_buyer() {
            return Err(MarketplaceError::InvalidTransition { from: order.status(), to: OrderStatus::Cancelled });
        }

        order.cancel(actor.id, reason)?;
        let order = self.orders.replace_order(order).await?;
        info!(order_number = %order.order_number(), "order cancelled by buyer");
        self.settle_cancellation(order, "requested_by_customer").await
    }

    /// Refunds `amount`, or the full payment when `None`, and moves the order to
    /// `refunded`. Vendors of the order and administrators only.
    #[tracing::instrument(name = "orders.process_refund", skip(self, actor, reason), fields(order = %order_id, actor = %actor.id), err)]
    pub async fn process_refund(&self, order_id: OrderId, actor: &Actor, amount: Option<Money>, reason: String) -> Result<Order> {
        let mut order = self.load_order(order_id).await?;
        if !order.is_manageable_by(actor) {
            return Err(MarketplaceError::Unauthorized(format!(
                "{} cannot refund order {}", actor.id, order.order_number()
            )));
        }
        Self::ensure_reconciled(&order)?;
        match &order.payment().state {
            PaymentState::Completed { .. } => {}
            PaymentState::Refunded { .. } => {
                return Err(MarketplaceError::Conflict(format!("order {} is already refunded", order.order_number())));
            }
            PaymentState::Pending | PaymentState::Failed { .. } => {
                return Err(MarketplaceError::not_found("payment", order.order_number()));
            }
        }
        if let Some(amount) = amount {
            if amount <= Money::ZERO || amount > order.payment().amount {
                return Err(MarketplaceError::InvalidInput(format!(
                    "refund amount {amount} must be positive and at most {}", order.payment().amount
                )));
            }
        }

        let refund = self.refund(&order, amount, &reason).await?;
        order.record_refund(refund.refund_id.clone(), refund.amount)?;
        order.mark_refunded(actor.id, Some(reason));
        let order = match self.orders.replace_order(order).await {
            Ok(order) => order,
            Err(error) => {
                self.flag_unrecorded_refund(order_id, &refund, &error).await;
                return Err(error);
            }
        };
        self.notify(order.user(), Notification::status_changed(&order, Some("Refund processed".into()))).await;
        Ok(order)
    }

    pub async fn create_payment_intent(&self, actor: &Actor, amount: Money) -> Result<PaymentIntent> {
        if amount <= Money::ZERO {
            return Err(MarketplaceError::InvalidInput(format!("payment amount {amount} must be positive")));
        }
        let currency = self.carts.policy().currency.clone();
        self.payments
            .create_payment_intent(amount, currency, actor.id)
            .await
            .map_err(|e| upstream("create payment intent", e))
    }

    /// Records a succeeded payment intent against the order and confirms a
    /// `pending` order. Confirming an already paid order is a no-op.
    #[tracing::instrument(name = "orders.confirm_payment", skip(self, actor), fields(order = %order_id, actor = %actor.id), err)]
    pub async fn confirm_payment(&self, order_id: OrderId, actor: &Actor, intent_id: String) -> Result<Order> {
        let mut order = self.load_order(order_id).await?;
        if actor.id != order.user() && !actor.is_admin() {
            return Err(MarketplaceError::Unauthorized(format!(
                "{} cannot pay for order {}", actor.id, order.order_number()
            )));
        }
        Self::ensure_reconciled(&order)?;
        match &order.payment().state {
            PaymentState::Completed { .. } => return Ok(order),
            PaymentState::Refunded { .. } => {
                return Err(MarketplaceError::Conflict(format!("order {} is already refunded", order.order_number())));
            }
            PaymentState::Pending | PaymentState::Failed { .. } => {}
        }
        if matches!(order.status(), OrderStatus::Cancelled | OrderStatus::Returned | OrderStatus::Refunded) {
            return Err(MarketplaceError::unavailable("order", order.order_number(), format!("order is {}", order.status())));
        }

        let status = self.payments
            .retrieve_payment_intent(intent_id.clone())
            .await
            .map_err(|e| upstream("retrieve payment intent", e))?;
        if status != IntentStatus::Succeeded {
            return Err(MarketplaceError::unavailable("payment", &intent_id, "payment not completed"));
        }

        order.complete_payment(intent_id);
        let confirmed = order.status() == OrderStatus::Pending;
        if confirmed {
            order.transition(OrderStatus::Confirmed, actor.id, Some("Payment completed".into()))?;
        }
        let order = self.orders.replace_order(order).await?;
        info!(order_number = %order.order_number(), "payment completed");
        if confirmed {
            self.notify(order.user(), Notification::status_changed(&order, Some("Payment completed".into()))).await;
        }
        Ok(order)
    }

    pub(super) async fn refund(&self, order: &Order, amount: Option<Money>, reason: &str) -> Result<Refund> {
        let transaction_id = order.payment().transaction_id()
            .ok_or_else(|| MarketplaceError::not_found("payment", order.order_number()))?
            .to_string();
        let refund = self.payments
            .create_refund(transaction_id, amount, reason.to_string())
            .await
            .map_err(|e| upstream("refund", e))?;
        info!(order_number = %order.order_number(), refund_id = %refund.refund_id, amount = %refund.amount, "refund issued");
        Ok(refund)
    }
}

fn upstream(context: &str, error: MarketplaceError) -> MarketplaceError {
    match error {
        MarketplaceError::UpstreamFailure(_) => error,
        other => MarketplaceError::UpstreamFailure(format!("{context}: {other}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::value_objects::UserId;
    use crate::integrations::{MockNotificationSink, MockPaymentGateway};
    use crate::services::test_support::{quiet_notifications, Harness, ReplaceFailingOrders};
    use crate::store::{MemoryStore, OrderStore};
    use std::sync::Arc;
    use testresult::TestResult;

    fn refunding_gateway(times: usize) -> MockPaymentGateway {
        let mut payments = MockPaymentGateway::new();
        payments.expect_retrieve_payment_intent().returning(|_| Ok(IntentStatus::Succeeded));
        payments.expect_create_refund()
            .withf(|tx, _, _| tx == "pi_123")
            .times(times)
            .returning(|_, amount, _| Ok(Refund {
                refund_id: "re_1".into(),
                amount: amount.unwrap_or(Money::from_major(286)),
                status: "succeeded".into(),
            }));
        payments
    }

    #[tokio::test]
    async fn test_paid_cancellation_restores_stock_and_refunds_once() -> TestResult {
        let harness = Harness::new(refunding_gateway(1), quiet_notifications()).await;
        let (order, _) = harness.placed_order(2).await?;
        let buyer = Actor::customer(order.user());
        let product = order.items()[0].product;
        harness.lifecycle.confirm_payment(order.id(), &buyer, "pi_123".into()).await?;

        let cancelled = harness.lifecycle.cancel_order(order.id(), &buyer, "found it cheaper".into()).await?;
        assert_eq!(cancelled.status(), OrderStatus::Cancelled);
        assert_eq!(cancelled.cancellation_reason(), Some("found it cheaper"));
        assert!(matches!(cancelled.payment().state, PaymentState::Refunded { ref refund_id, .. } if refund_id == "re_1"));
        let restored = harness.product(product).await?;
        assert_eq!((restored.stock, restored.purchases), (10, 0));
        Ok(())
    }

    #[tokio::test]
    async fn test_unpaid_cancellation_skips_refund() -> TestResult {
        let harness = Harness::quiet().await;
        let (order, _) = harness.placed_order(1).await?;
        let cancelled = harness.lifecycle
            .cancel_order(order.id(), &Actor::customer(order.user()), "no longer needed".into())
            .await?;
        assert_eq!(cancelled.status(), OrderStatus::Cancelled);
        assert!(matches!(cancelled.payment().state, PaymentState::Pending));
        Ok(())
    }

    #[tokio::test]
    async fn test_cancellation_rules() -> TestResult {
        let harness = Harness::quiet().await;
        let (order, vendor) = harness.placed_order(1).await?;
        let seller = Actor::vendor(vendor);

        let err = harness.lifecycle.cancel_order(order.id(), &seller, "nope".into()).await.unwrap_err();
        assert!(matches!(err, MarketplaceError::Unauthorized(_)));

        for status in [OrderStatus::Confirmed, OrderStatus::Processing, OrderStatus::Shipped] {
            harness.lifecycle.update_status(order.id(), crate::StatusUpdate::to(status), &seller).await?;
        }
        let err = harness.lifecycle
            .cancel_order(order.id(), &Actor::customer(order.user()), "too late".into())
            .await
            .unwrap_err();
        assert!(matches!(err, MarketplaceError::InvalidTransition { from: OrderStatus::Shipped, to: OrderStatus::Cancelled }));
        Ok(())
    }

    #[tokio::test]
    async fn test_refund_failure_surfaces_as_upstream_failure() -> TestResult {
        let mut payments = MockPaymentGateway::new();
        payments.expect_retrieve_payment_intent().returning(|_| Ok(IntentStatus::Succeeded));
        payments.expect_create_refund()
            .times(1)
            .returning(|_, _, _| Err(MarketplaceError::InvalidInput("card network timeout".into())));
        let harness = Harness::new(payments, quiet_notifications()).await;
        let (order, _) = harness.placed_order(1).await?;
        let buyer = Actor::customer(order.user());
        harness.lifecycle.confirm_payment(order.id(), &buyer, "pi_123".into()).await?;

        let err = harness.lifecycle.cancel_order(order.id(), &buyer, "changed mind".into()).await.unwrap_err();
        assert!(matches!(err, MarketplaceError::UpstreamFailure(_)));

        let stored = harness.store.get_order(order.id()).await?.ok_or("order missing")?;
        assert_eq!(stored.status(), OrderStatus::Cancelled);
        assert!(stored.needs_reconciliation());
        assert!(stored.payment().is_completed());
        Ok(())
    }

    #[tokio::test]
    async fn test_unrecorded_refund_flags_order_and_blocks_second_refund() -> TestResult {
        let store = Arc::new(MemoryStore::new());
        let orders = Arc::new(ReplaceFailingOrders::new(store.clone()));
        let harness = Harness::with_orders(store, orders.clone(), refunding_gateway(1)).await;
        let (order, vendor) = harness.placed_order(2).await?;
        let buyer = Actor::customer(order.user());
        harness.lifecycle.confirm_payment(order.id(), &buyer, "pi_123".into()).await?;

        // The cancel write goes through, the write recording the refund does not.
        orders.fail_after(1);
        let err = harness.lifecycle.cancel_order(order.id(), &buyer, "duplicate".into()).await.unwrap_err();
        assert!(matches!(err, MarketplaceError::Conflict(_)));

        let stored = harness.store.get_order(order.id()).await?.ok_or("order missing")?;
        assert_eq!(stored.status(), OrderStatus::Cancelled);
        let issue = stored.reconciliation().ok_or("order not flagged")?;
        assert!(issue.reason.contains("re_1"));

        let err = harness.lifecycle
            .process_refund(order.id(), &Actor::vendor(vendor), None, "retry".into())
            .await
            .unwrap_err();
        assert!(matches!(err, MarketplaceError::Conflict(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_process_refund() -> TestResult {
        let harness = Harness::new(refunding_gateway(1), quiet_notifications()).await;
        let (order, vendor) = harness.placed_order(1).await?;
        let seller = Actor::vendor(vendor);

        let err = harness.lifecycle.process_refund(order.id(), &seller, None, "damaged".into()).await.unwrap_err();
        assert!(matches!(err, MarketplaceError::NotFound { entity: "payment", .. }));

        harness.lifecycle.confirm_payment(order.id(), &Actor::customer(order.user()), "pi_123".into()).await?;
        let err = harness.lifecycle
            .process_refund(order.id(), &Actor::customer(order.user()), None, "damaged".into())
            .await
            .unwrap_err();
        assert!(matches!(err, MarketplaceError::Unauthorized(_)));
        let too_much = Some(order.total() + Money::from_major(1));
        let err = harness.lifecycle.process_refund(order.id(), &seller, too_much, "damaged".into()).await.unwrap_err();
        assert!(matches!(err, MarketplaceError::InvalidInput(_)));

        let refunded = harness.lifecycle
            .process_refund(order.id(), &seller, Some(Money::from_major(40)), "damaged".into())
            .await?;
        assert_eq!(refunded.status(), OrderStatus::Refunded);
        assert_eq!(refunded.status_history().last().map(|c| c.status), Some(OrderStatus::Refunded));
        assert!(matches!(
            refunded.payment().state,
            PaymentState::Refunded { refund_amount, .. } if refund_amount == Money::from_major(40)
        ));

        let err = harness.lifecycle.process_refund(order.id(), &seller, None, "again".into()).await.unwrap_err();
        assert!(matches!(err, MarketplaceError::Conflict(_)));
        Ok(())
    }

    #[tokio::test]
    async fn test_confirm_payment() -> TestResult {
        let mut payments = MockPaymentGateway::new();
        payments.expect_retrieve_payment_intent()
            .returning(|id| Ok(if id == "pi_ok" { IntentStatus::Succeeded } else { IntentStatus::Pending }));
        let mut notifications = MockNotificationSink::new();
        notifications.expect_emit().returning(|_, _| Ok(()));
        let harness = Harness::new(payments, notifications).await;
        let (order, _) = harness.placed_order(1).await?;
        let buyer = Actor::customer(order.user());

        let err = harness.lifecycle.confirm_payment(order.id(), &Actor::customer(UserId::new()), "pi_ok".into()).await.unwrap_err();
        assert!(matches!(err, MarketplaceError::Unauthorized(_)));
        let err = harness.lifecycle.confirm_payment(order.id(), &buyer, "pi_wait".into()).await.unwrap_err();
        assert!(matches!(err, MarketplaceError::Unavailable { .. }));

        let paid = harness.lifecycle.confirm_payment(order.id(), &buyer, "pi_ok".into()).await?;
        assert_eq!(paid.status(), OrderStatus::Confirmed);
        assert_eq!(paid.payment().transaction_id(), Some("pi_ok"));
        assert_eq!(paid.status_history().last().and_then(|c| c.note.as_deref()), Some("Payment completed"));

        let again = harness.lifecycle.confirm_payment(order.id(), &buyer, "pi_ok".into()).await?;
        assert_eq!(again.revision(), paid.revision());
        Ok(())
    }

    #[tokio::test]
    async fn test_payment_intent_uses_configured_currency() -> TestResult {
        let mut payments = MockPaymentGateway::new();
        payments.expect_create_payment_intent()
            .withf(|amount, currency, _| *amount == Money::from_major(99) && currency == "INR")
            .times(1)
            .returning(|_, _, _| Ok(PaymentIntent { id: "pi_new".into(), client_secret: "secret".into() }));
        let harness = Harness::new(payments, quiet_notifications()).await;
        let actor = Actor::customer(UserId::new());

        let intent = harness.lifecycle.create_payment_intent(&actor, Money::from_major(99)).await?;
        assert_eq!(intent.id, "pi_new");
        assert!(matches!(
            harness.lifecycle.create_payment_intent(&actor, Money::ZERO).await,
            Err(MarketplaceError::InvalidInput(_))
        ));
        Ok(())
    }
}
