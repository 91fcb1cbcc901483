//! Redis-backed cluster presence.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::AsyncCommands;
use tracing::debug;

use syncrelay_core::result::AppResult;
use syncrelay_core::traits::PresenceStore;

use super::client::{RedisClient, storage_err};
use crate::keys;

/// Presence stored as one sorted set per user: member = instance ID,
/// score = expiry in epoch milliseconds. The key itself also carries a TTL
/// so users whose instances all died disappear entirely.
#[derive(Debug, Clone)]
pub struct RedisPresenceStore {
    /// Redis client.
    client: RedisClient,
}

impl RedisPresenceStore {
    /// Create a new Redis presence store.
    pub fn new(client: RedisClient) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn mark_online(&self, user_id: &str, instance_id: &str, ttl: Duration) -> AppResult<()> {
        self.refresh(&[user_id.to_string()], instance_id, ttl).await
    }

    async fn mark_offline(&self, user_id: &str, instance_id: &str) -> AppResult<()> {
        let mut conn = self.client.conn_mut();
        let _: i64 = conn
            .zrem(keys::presence(self.client.prefix(), user_id), instance_id)
            .await
            .map_err(storage_err)?;
        debug!(user_id, instance_id, "Presence cleared");
        Ok(())
    }

    async fn refresh(&self, user_ids: &[String], instance_id: &str, ttl: Duration) -> AppResult<()> {
        if user_ids.is_empty() {
            return Ok(());
        }
        let now_ms = Utc::now().timestamp_millis();
        let ttl_ms = ttl.as_millis() as i64;
        let expires_at = now_ms + ttl_ms;

        let mut pipe = redis::pipe();
        for user_id in user_ids {
            let key = keys::presence(self.client.prefix(), user_id);
            pipe.zadd(&key, instance_id, expires_at)
                .ignore()
                .zrembyscore(&key, "-inf", now_ms)
                .ignore()
                .pexpire(&key, ttl_ms)
                .ignore();
        }

        let mut conn = self.client.conn_mut();
        let _: () = pipe.query_async(&mut conn).await.map_err(storage_err)?;
        Ok(())
    }

    async fn is_online(&self, user_id: &str) -> AppResult<bool> {
        let now_ms = Utc::now().timestamp_millis();
        let mut conn = self.client.conn_mut();
        let live: u64 = conn
            .zcount(keys::presence(self.client.prefix(), user_id), now_ms, "+inf")
            .await
            .map_err(storage_err)?;
        Ok(live > 0)
    }
}
