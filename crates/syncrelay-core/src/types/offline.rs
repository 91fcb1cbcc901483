//! Offline-queue entries.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::id::OfflineMessageId;
use super::message::SyncMessage;

/// An event held for a user who had no live session when it was published.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfflineMessage {
    /// Queue entry ID, used for acknowledgment.
    pub id: OfflineMessageId,
    /// Owning user.
    pub user_id: String,
    /// The queued event.
    pub message: SyncMessage,
    /// When the entry was queued.
    pub enqueued_at: DateTime<Utc>,
    /// When the owner acknowledged it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub acked_at: Option<DateTime<Utc>>,
}

impl OfflineMessage {
    /// Build a fresh, unacknowledged entry.
    pub fn new(user_id: impl Into<String>, message: SyncMessage) -> Self {
        Self {
            id: OfflineMessageId::new(),
            user_id: user_id.into(),
            message,
            enqueued_at: Utc::now(),
            acked_at: None,
        }
    }

    /// Whether the entry still awaits acknowledgment.
    pub fn is_pending(&self) -> bool {
        self.acked_at.is_none()
    }
}

/// An entry that could not be acknowledged in a batch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckFailure {
    pub id: OfflineMessageId,
    /// Error text.
    pub error: String,
}

/// Per-entry outcome of a batch acknowledgment.
///
/// Every requested ID lands in exactly one list, in request order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AckBatchReport {
    /// Newly acknowledged.
    pub acked: Vec<OfflineMessageId>,
    /// Unknown, already acknowledged, or owned by someone else.
    pub noop: Vec<OfflineMessageId>,
    /// The store failed for these; they may still be pending.
    pub failed: Vec<AckFailure>,
}

impl AckBatchReport {
    /// Number of newly acknowledged entries.
    pub fn acked_count(&self) -> u64 {
        self.acked.len() as u64
    }

    /// Whether every ID was processed without a store error.
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}
