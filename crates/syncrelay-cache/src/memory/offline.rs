//! In-memory offline queue.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use tracing::debug;

use syncrelay_core::result::AppResult;
use syncrelay_core::traits::OfflineStore;
use syncrelay_core::types::{OfflineMessage, OfflineMessageId, SyncMessage};

/// Offline queue held in process memory, one vector per user in enqueue order.
///
/// Acknowledged entries are marked terminal in place and reclaimed by
/// [`OfflineStore::purge_expired`].
#[derive(Debug, Clone, Default)]
pub struct MemoryOfflineStore {
    queues: Arc<DashMap<String, Vec<OfflineMessage>>>,
}

impl MemoryOfflineStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OfflineStore for MemoryOfflineStore {
    async fn enqueue(&self, user_id: &str, message: &SyncMessage) -> AppResult<OfflineMessage> {
        let entry = OfflineMessage::new(user_id, message.clone());
        self.queues
            .entry(user_id.to_string())
            .or_default()
            .push(entry.clone());
        debug!(user_id, offline_id = %entry.id, "Offline entry queued in memory");
        Ok(entry)
    }

    async fn list_pending(
        &self,
        user_id: &str,
        offset: usize,
        limit: usize,
    ) -> AppResult<Vec<OfflineMessage>> {
        Ok(self
            .queues
            .get(user_id)
            .map(|queue| {
                queue
                    .iter()
                    .filter(|e| e.is_pending())
                    .skip(offset)
                    .take(limit)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn ack(&self, user_id: &str, id: OfflineMessageId) -> AppResult<bool> {
        let Some(mut queue) = self.queues.get_mut(user_id) else {
            return Ok(false);
        };
        match queue.iter_mut().find(|e| e.id == id && e.is_pending()) {
            Some(entry) => {
                entry.acked_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn count(&self, user_id: &str) -> AppResult<u64> {
        Ok(self
            .queues
            .get(user_id)
            .map(|queue| queue.iter().filter(|e| e.is_pending()).count() as u64)
            .unwrap_or(0))
    }

    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let mut purged = 0u64;
        for mut queue in self.queues.iter_mut() {
            let before = queue.len();
            queue.retain(|e| e.is_pending() && e.enqueued_at > cutoff);
            purged += (before - queue.len()) as u64;
        }
        self.queues.retain(|_, queue| !queue.is_empty());
        Ok(purged)
    }

    async fn trim_per_user(&self, max: u64) -> AppResult<u64> {
        let max = max as usize;
        let mut trimmed = 0u64;
        for mut queue in self.queues.iter_mut() {
            let pending = queue.iter().filter(|e| e.is_pending()).count();
            if pending <= max {
                continue;
            }
            let mut excess = pending - max;
            queue.retain(|e| {
                if excess > 0 && e.is_pending() {
                    excess -= 1;
                    false
                } else {
                    true
                }
            });
            trimmed += (pending - max) as u64;
        }
        Ok(trimmed)
    }

    async fn health_check(&self) -> AppResult<bool> {
        Ok(true)
    }
}
