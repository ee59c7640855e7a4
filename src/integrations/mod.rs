//! Outbound seams: the payment gateway and the notification channel.

use async_trait::async_trait;
use mockall::automock;
use serde::{Deserialize, Serialize};

use crate::domain::events::Notification;
use crate::domain::value_objects::{Money, UserId};
use crate::Result;

pub mod nats;

pub use nats::NatsNotificationSink;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct PaymentIntent {
    pub id: String,
    pub client_secret: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentStatus { Succeeded, Pending, Failed }

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Refund {
    pub refund_id: String,
    pub amount: Money,
    pub status: String,
}

#[automock]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment_intent(&self, amount: Money, currency: String, user: UserId) -> Result<PaymentIntent>;

    async fn retrieve_payment_intent(&self, intent_id: String) -> Result<IntentStatus>;

    /// Refunds `amount`, or the full captured amount when `None`.
    async fn create_refund(&self, transaction_id: String, amount: Option<Money>, reason: String) -> Result<Refund>;
}

/// Best-effort delivery of user-facing events. Callers log failures and carry on.
#[automock]
#[async_trait]
pub trait NotificationSink: Send + Sync {
    async fn emit(&self, target: UserId, notification: Notification) -> Result<()>;
}
