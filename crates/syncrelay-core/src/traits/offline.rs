//! Offline-delivery queue trait.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::result::AppResult;
use crate::types::{AckBatchReport, AckFailure, OfflineMessage, OfflineMessageId, SyncMessage};

/// Durable per-user queue of events awaiting client acknowledgment.
///
/// Entries stay listable until acknowledged or expired. Acknowledgment is
/// scoped to the owning user and idempotent: unknown or already-acked IDs
/// report `false` rather than failing.
#[async_trait]
pub trait OfflineStore: Send + Sync + std::fmt::Debug + 'static {
    /// Queue `message` for `user_id`.
    async fn enqueue(&self, user_id: &str, message: &SyncMessage) -> AppResult<OfflineMessage>;

    /// Unacknowledged entries for `user_id`, oldest first.
    async fn list_pending(
        &self,
        user_id: &str,
        offset: usize,
        limit: usize,
    ) -> AppResult<Vec<OfflineMessage>>;

    /// Acknowledge one entry. Returns `true` only if it was pending.
    async fn ack(&self, user_id: &str, id: OfflineMessageId) -> AppResult<bool>;

    /// Acknowledge several entries, one at a time.
    ///
    /// A store error on one ID is recorded in the report and the remaining
    /// IDs are still attempted.
    async fn ack_batch(&self, user_id: &str, ids: &[OfflineMessageId]) -> AckBatchReport {
        let mut report = AckBatchReport::default();
        for &id in ids {
            match self.ack(user_id, id).await {
                Ok(true) => report.acked.push(id),
                Ok(false) => report.noop.push(id),
                Err(e) => report.failed.push(AckFailure {
                    id,
                    error: e.to_string(),
                }),
            }
        }
        report
    }

    /// Number of unacknowledged entries for `user_id`.
    async fn count(&self, user_id: &str) -> AppResult<u64>;

    /// Drop entries queued before `cutoff`, acked or not. Returns the number removed.
    async fn purge_expired(&self, cutoff: DateTime<Utc>) -> AppResult<u64>;

    /// Keep at most `max` pending entries per user, dropping the oldest.
    async fn trim_per_user(&self, max: u64) -> AppResult<u64>;

    /// Check that the backing store is reachable.
    async fn health_check(&self) -> AppResult<bool>;
}
