//! Domain events delivered to users through the notification sink
use serde::{Deserialize, Serialize};

use crate::domain::aggregates::{Order, OrderStatus};
use crate::domain::value_objects::{OrderId, OrderNumber};

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Notification {
    /// Sent to each vendor with lines in a new order.
    NewOrder { order_id: OrderId, order_number: OrderNumber, message: String },
    /// Sent to the buyer.
    OrderStatusChanged { order_id: OrderId, order_number: OrderNumber, status: OrderStatus, note: Option<String> },
}

impl Notification {
    pub fn new_order(order: &Order) -> Self {
        Self::NewOrder {
            order_id: order.id(),
            order_number: order.order_number().clone(),
            message: "You have received a new order!".into(),
        }
    }

    pub fn status_changed(order: &Order, note: Option<String>) -> Self {
        Self::OrderStatusChanged {
            order_id: order.id(),
            order_number: order.order_number().clone(),
            status: order.status(),
            note,
        }
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::NewOrder { .. } => "new-order",
            Self::OrderStatusChanged { .. } => "order-status-changed",
        }
    }
}
