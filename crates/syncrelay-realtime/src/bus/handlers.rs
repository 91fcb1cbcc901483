//! Handlers that forward bus events to this instance's connections.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use syncrelay_core::error::AppError;
use syncrelay_core::result::AppResult;
use syncrelay_core::types::{SyncMessage, user_from_channel};

use super::subscriber::MessageHandler;
use crate::connection::ConnectionRegistry;
use crate::message::ServerFrame;
use crate::metrics::{self, DeliveryMetrics};

/// Delivers `sync:user:<id>` events to that user's local sessions.
pub struct UserDeliveryHandler {
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<DeliveryMetrics>,
}

impl UserDeliveryHandler {
    pub fn new(registry: Arc<ConnectionRegistry>, metrics: Arc<DeliveryMetrics>) -> Self {
        Self { registry, metrics }
    }
}

#[async_trait]
impl MessageHandler for UserDeliveryHandler {
    async fn handle(&self, channel: &str, message: &SyncMessage) -> AppResult<()> {
        let user_id = user_from_channel(channel)
            .ok_or_else(|| AppError::validation(format!("Not a user channel: {channel}")))?;

        let delivered = self
            .registry
            .send_to_user(user_id, &ServerFrame::event(message.clone()));
        metrics::add(&self.metrics.remote_deliveries, delivered as u64);

        debug!(
            user_id,
            message_id = %message.id,
            origin = %message.origin_instance_id,
            delivered,
            "Remote event delivered"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "user_delivery"
    }
}

/// Delivers broadcast events to every local session.
pub struct BroadcastDeliveryHandler {
    registry: Arc<ConnectionRegistry>,
    metrics: Arc<DeliveryMetrics>,
}

impl BroadcastDeliveryHandler {
    pub fn new(registry: Arc<ConnectionRegistry>, metrics: Arc<DeliveryMetrics>) -> Self {
        Self { registry, metrics }
    }
}

#[async_trait]
impl MessageHandler for BroadcastDeliveryHandler {
    async fn handle(&self, _channel: &str, message: &SyncMessage) -> AppResult<()> {
        let delivered = self.registry.send_to_all(&ServerFrame::event(message.clone()));
        metrics::add(&self.metrics.remote_deliveries, delivered as u64);
        debug!(message_id = %message.id, delivered, "Remote broadcast delivered");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "broadcast_delivery"
    }
}
