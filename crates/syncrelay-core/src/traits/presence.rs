//! Cluster-wide presence trait.

use std::time::Duration;

use async_trait::async_trait;

use crate::result::AppResult;

/// Shared record of which users hold a live session on any instance.
///
/// Entries are per (user, instance) and expire after `ttl` unless refreshed,
/// so a crashed instance stops claiming its users.
#[async_trait]
pub trait PresenceStore: Send + Sync + std::fmt::Debug + 'static {
    /// Record that `user_id` has a session on `instance_id`.
    async fn mark_online(&self, user_id: &str, instance_id: &str, ttl: Duration) -> AppResult<()>;

    /// Remove the entry for `user_id` on `instance_id`.
    async fn mark_offline(&self, user_id: &str, instance_id: &str) -> AppResult<()>;

    /// Extend the entries of all `user_ids` on `instance_id`.
    async fn refresh(&self, user_ids: &[String], instance_id: &str, ttl: Duration) -> AppResult<()>;

    /// Whether any instance holds an unexpired entry for `user_id`.
    async fn is_online(&self, user_id: &str) -> AppResult<bool>;
}
