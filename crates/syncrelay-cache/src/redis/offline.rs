//! Redis-backed offline queue using Lua scripts for atomicity.
//!
//! Layout per user: a sorted set of pending entry IDs scored by enqueue time
//! in milliseconds, plus one JSON document per entry. Acknowledged entries
//! are removed from both, which makes a repeated ack a no-op.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use tracing::{debug, info};

use syncrelay_core::result::AppResult;
use syncrelay_core::traits::OfflineStore;
use syncrelay_core::types::{OfflineMessage, OfflineMessageId, SyncMessage};

use super::client::{RedisClient, storage_err};
use crate::keys;

/// Lua script for atomic enqueue.
///
/// KEYS[1] = user queue
/// KEYS[2] = entry document
/// KEYS[3] = user index set
/// ARGV[1] = entry id
/// ARGV[2] = enqueue score (ms)
/// ARGV[3] = entry JSON
/// ARGV[4] = user id
const ENQUEUE_SCRIPT: &str = r#"
    redis.call('SET', KEYS[2], ARGV[3])
    redis.call('ZADD', KEYS[1], ARGV[2], ARGV[1])
    redis.call('SADD', KEYS[3], ARGV[4])
    return redis.call('ZCARD', KEYS[1])
"#;

/// Lua script for atomic acknowledgment.
///
/// KEYS[1] = user queue
/// KEYS[2] = entry document
/// ARGV[1] = entry id
///
/// Returns:
///   1 = acknowledged
///   0 = unknown, already acknowledged, or owned by another user
const ACK_SCRIPT: &str = r#"
    if redis.call('ZREM', KEYS[1], ARGV[1]) == 1 then
        redis.call('DEL', KEYS[2])
        return 1
    end
    return 0
"#;

/// Lua script removing entries scored at or below a cutoff.
///
/// KEYS[1] = user queue
/// KEYS[2] = user index set
/// ARGV[1] = cutoff score (ms)
/// ARGV[2] = entry document key prefix
/// ARGV[3] = user id
const PURGE_SCRIPT: &str = r#"
    local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
    for _, id in ipairs(ids) do
        redis.call('DEL', ARGV[2] .. id)
    end
    if #ids > 0 then
        redis.call('ZREMRANGEBYSCORE', KEYS[1], '-inf', ARGV[1])
    end
    if redis.call('ZCARD', KEYS[1]) == 0 then
        redis.call('SREM', KEYS[2], ARGV[3])
    end
    return #ids
"#;

/// Lua script keeping only the newest ARGV[1] entries of a queue.
///
/// KEYS[1] = user queue
/// ARGV[1] = maximum length
/// ARGV[2] = entry document key prefix
const TRIM_SCRIPT: &str = r#"
    local max = tonumber(ARGV[1])
    local total = redis.call('ZCARD', KEYS[1])
    if total <= max then
        return 0
    end
    local excess = total - max
    local ids = redis.call('ZRANGE', KEYS[1], 0, excess - 1)
    for _, id in ipairs(ids) do
        redis.call('DEL', ARGV[2] .. id)
    end
    redis.call('ZREMRANGEBYRANK', KEYS[1], 0, excess - 1)
    return excess
"#;

/// Inclusive `ZRANGE` ranks for a page, or `None` when the page is empty.
///
/// Ranks are signed in Redis, so offsets past `isize::MAX` can never match.
fn rank_range(offset: usize, limit: usize) -> Option<(isize, isize)> {
    if limit == 0 {
        return None;
    }
    let start = isize::try_from(offset).ok()?;
    let stop = start.saturating_add(isize::try_from(limit - 1).unwrap_or(isize::MAX));
    Some((start, stop))
}

/// Offline queue stored in Redis.
#[derive(Debug, Clone)]
pub struct RedisOfflineStore {
    /// Redis client.
    client: RedisClient,
}

impl RedisOfflineStore {
    /// Create a new Redis offline store.
    pub fn new(client: RedisClient) -> Self {
        Self { client }
    }

    async fn queued_users(&self) -> AppResult<Vec<String>> {
        let mut conn = self.client.conn_mut();
        conn.smembers(keys::offline_users(self.client.prefix()))
            .await
            .map_err(storage_err)
    }
}

#[async_trait]
impl OfflineStore for RedisOfflineStore {
    async fn enqueue(&self, user_id: &str, message: &SyncMessage) -> AppResult<OfflineMessage> {
        let entry = OfflineMessage::new(user_id, message.clone());
        let json = serde_json::to_string(&entry)?;
        let prefix = self.client.prefix();

        let mut conn = self.client.conn_mut();
        let depth: i64 = redis::Script::new(ENQUEUE_SCRIPT)
            .key(keys::offline_queue(prefix, user_id))
            .key(keys::offline_message(prefix, entry.id))
            .key(keys::offline_users(prefix))
            .arg(entry.id.to_string())
            .arg(entry.enqueued_at.timestamp_millis())
            .arg(json)
            .arg(user_id)
            .invoke_async(&mut conn)
            .await
            .map_err(storage_err)?;

        debug!(user_id, offline_id = %entry.id, depth, "Offline entry queued in Redis");
        Ok(entry)
    }

    async fn list_pending(
        &self,
        user_id: &str,
        offset: usize,
        limit: usize,
    ) -> AppResult<Vec<OfflineMessage>> {
        let Some((start, stop)) = rank_range(offset, limit) else {
            return Ok(Vec::new());
        };
        let prefix = self.client.prefix();
        let mut conn = self.client.conn_mut();

        let ids: Vec<String> = conn
            .zrange(keys::offline_queue(prefix, user_id), start, stop)
            .await
            .map_err(storage_err)?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let doc_prefix = keys::offline_message_prefix(prefix);
        let doc_keys: Vec<String> = ids.iter().map(|id| format!("{doc_prefix}{id}")).collect();
        let docs: Vec<Option<String>> = redis::cmd("MGET")
            .arg(&doc_keys)
            .query_async(&mut conn)
            .await
            .map_err(storage_err)?;

        let mut entries = Vec::with_capacity(docs.len());
        for doc in docs.into_iter().flatten() {
            entries.push(serde_json::from_str::<OfflineMessage>(&doc)?);
        }
        Ok(entries)
    }

    async fn ack(&self, user_id: &str, id: OfflineMessageId) -> AppResult<bool> {
        let prefix = self.client.prefix();
        let mut conn = self.client.conn_mut();

        let removed: i64 = redis::Script::new(ACK_SCRIPT)
            .key(keys::offline_queue(prefix, user_id))
            .key(keys::offline_message(prefix, id))
            .arg(id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(storage_err)?;

        if removed == 0 {
            debug!(user_id, offline_id = %id, "Ack for unknown or already acknowledged entry");
        }
        Ok(removed == 1)
    }

    async fn count(&self, user_id: &str) -> AppResult<u64> {
        let mut conn = self.client.conn_mut();
        conn.zcard(keys::offline_queue(self.client.prefix(), user_id))
            .await
            .map_err(storage_err)
    }

    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let prefix = self.client.prefix();
        let doc_prefix = keys::offline_message_prefix(prefix);
        let mut purged = 0u64;

        for user_id in self.queued_users().await? {
            let mut conn = self.client.conn_mut();
            let removed: u64 = redis::Script::new(PURGE_SCRIPT)
                .key(keys::offline_queue(prefix, &user_id))
                .key(keys::offline_users(prefix))
                .arg(cutoff.timestamp_millis())
                .arg(&doc_prefix)
                .arg(&user_id)
                .invoke_async(&mut conn)
                .await
                .map_err(storage_err)?;
            purged += removed;
        }

        if purged > 0 {
            info!(purged, cutoff = %cutoff, "Purged expired offline entries");
        }
        Ok(purged)
    }

    async fn trim_per_user(&self, max: u64) -> AppResult<u64> {
        let prefix = self.client.prefix();
        let doc_prefix = keys::offline_message_prefix(prefix);
        let mut trimmed = 0u64;

        for user_id in self.queued_users().await? {
            let mut conn = self.client.conn_mut();
            let removed: u64 = redis::Script::new(TRIM_SCRIPT)
                .key(keys::offline_queue(prefix, &user_id))
                .arg(max)
                .arg(&doc_prefix)
                .invoke_async(&mut conn)
                .await
                .map_err(storage_err)?;
            trimmed += removed;
        }

        if trimmed > 0 {
            info!(trimmed, max, "Trimmed oversized offline queues");
        }
        Ok(trimmed)
    }

    async fn health_check(&self) -> AppResult<bool> {
        let mut conn = self.client.conn_mut();
        let pong: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(storage_err)?;
        Ok(pong == "PONG")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_range_pages() {
        assert_eq!(rank_range(0, 50), Some((0, 49)));
        assert_eq!(rank_range(20, 10), Some((20, 29)));
        assert_eq!(rank_range(5, 0), None);
    }

    #[test]
    fn test_rank_range_huge_offset_is_empty() {
        assert_eq!(rank_range(usize::MAX, 50), None);
        assert_eq!(rank_range(isize::MAX as usize + 1, 1), None);
    }

    #[test]
    fn test_rank_range_saturates_stop() {
        assert_eq!(rank_range(isize::MAX as usize, 50), Some((isize::MAX, isize::MAX)));
        assert_eq!(rank_range(1, usize::MAX), Some((1, isize::MAX)));
    }
}
