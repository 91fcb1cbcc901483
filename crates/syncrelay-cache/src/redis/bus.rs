//! Redis pub/sub message bus.

use async_trait::async_trait;
use futures::StreamExt;
use redis::AsyncCommands;
use tracing::{debug, warn};

use syncrelay_core::result::AppResult;
use syncrelay_core::traits::{BusMessage, BusStream, MessageBus};

use super::client::{RedisClient, bus_err};

/// Message bus over Redis `PUBLISH` / `PSUBSCRIBE`.
#[derive(Debug, Clone)]
pub struct RedisMessageBus {
    /// Redis client.
    client: RedisClient,
}

impl RedisMessageBus {
    /// Create a new Redis bus.
    pub fn new(client: RedisClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl MessageBus for RedisMessageBus {
    async fn publish(&self, channel: &str, payload: &str) -> AppResult<()> {
        let mut conn = self.client.conn_mut();
        let receivers: i64 = conn.publish(channel, payload).await.map_err(bus_err)?;
        debug!(channel, receivers, "Published to Redis");
        Ok(())
    }

    async fn subscribe(&self, patterns: &[String]) -> AppResult<BusStream> {
        let mut pubsub = self.client.pubsub().await?;
        for pattern in patterns {
            pubsub.psubscribe(pattern).await.map_err(bus_err)?;
        }
        debug!(?patterns, "Subscribed to Redis patterns");

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let channel = msg.get_channel_name().to_string();
            match msg.get_payload::<String>() {
                Ok(payload) => Some(BusMessage { channel, payload }),
                Err(e) => {
                    warn!(channel = %channel, error = %e, "Skipping non-text Redis payload");
                    None
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn health_check(&self) -> AppResult<bool> {
        let mut conn = self.client.conn_mut();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(bus_err)?;
        Ok(pong == "PONG")
    }

    fn backend_name(&self) -> &'static str {
        "redis"
    }
}
