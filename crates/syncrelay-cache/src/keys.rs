//! Redis key builders for presence and the offline queue.
//!
//! Centralising key construction prevents typos and makes it easy
//! to find every key the relay uses. All builders take the configured
//! prefix (e.g. `"syncrelay:"`).

use syncrelay_core::types::OfflineMessageId;

// ── Offline queue keys ─────────────────────────────────────

/// Sorted set of a user's pending entry IDs, scored by enqueue time (ms).
pub fn offline_queue(prefix: &str, user_id: &str) -> String {
    format!("{prefix}offline:queue:{user_id}")
}

/// Prefix of the per-entry JSON documents; the entry ID is appended.
pub fn offline_message_prefix(prefix: &str) -> String {
    format!("{prefix}offline:msg:")
}

/// JSON document of a single offline entry.
pub fn offline_message(prefix: &str, id: OfflineMessageId) -> String {
    format!("{}{id}", offline_message_prefix(prefix))
}

/// Set of user IDs that currently own a queue.
pub fn offline_users(prefix: &str) -> String {
    format!("{prefix}offline:users")
}

// ── Presence keys ──────────────────────────────────────────

/// Sorted set of instances holding a session for a user, scored by expiry (ms).
pub fn presence(prefix: &str, user_id: &str) -> String {
    format!("{prefix}presence:{user_id}")
}
