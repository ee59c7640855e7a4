//! NATS-backed notification sink.

use async_trait::async_trait;

use crate::domain::events::Notification;
use crate::domain::value_objects::UserId;
use crate::integrations::NotificationSink;
use crate::{MarketplaceError, Result};

const SUBJECT_PREFIX: &str = "marketplace.notifications";

/// Publishes each notification as JSON on a per-user subject.
#[derive(Clone, Debug)]
pub struct NatsNotificationSink {
    client: async_nats::Client,
}

impl NatsNotificationSink {
    pub fn new(client: async_nats::Client) -> Self { Self { client } }

    pub async fn connect(url: &str) -> Result<Self> {
        let client = async_nats::connect(url)
            .await
            .map_err(|e| MarketplaceError::UpstreamFailure(format!("nats connect: {e}")))?;
        Ok(Self::new(client))
    }
}

pub fn subject_for(target: UserId) -> String { format!("{SUBJECT_PREFIX}.{target}") }

#[async_trait]
impl NotificationSink for NatsNotificationSink {
    async fn emit(&self, target: UserId, notification: Notification) -> Result<()> {
        let payload = serde_json::to_vec(&notification)
            .map_err(|e| MarketplaceError::InvalidInput(format!("notification payload: {e}")))?;
        self.client
            .publish(subject_for(target), payload.into())
            .await
            .map_err(|e| MarketplaceError::UpstreamFailure(format!("publish {}: {e}", notification.event_name())))?;
        tracing::debug!(%target, event = notification.event_name(), "notification published");
        Ok(())
    }
}
