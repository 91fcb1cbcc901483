//! In-memory presence.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::time::Instant;

use syncrelay_core::result::AppResult;
use syncrelay_core::traits::PresenceStore;

/// Presence held in process memory: user → (instance → expiry).
///
/// Clones share state, so engines built from clones see each other's users.
#[derive(Debug, Clone, Default)]
pub struct MemoryPresenceStore {
    entries: Arc<DashMap<String, HashMap<String, Instant>>>,
}

impl MemoryPresenceStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PresenceStore for MemoryPresenceStore {
    async fn mark_online(&self, user_id: &str, instance_id: &str, ttl: Duration) -> AppResult<()> {
        self.entries
            .entry(user_id.to_string())
            .or_default()
            .insert(instance_id.to_string(), Instant::now() + ttl);
        Ok(())
    }

    async fn mark_offline(&self, user_id: &str, instance_id: &str) -> AppResult<()> {
        self.entries.remove_if_mut(user_id, |_, instances| {
            instances.remove(instance_id);
            instances.is_empty()
        });
        Ok(())
    }

    async fn refresh(&self, user_ids: &[String], instance_id: &str, ttl: Duration) -> AppResult<()> {
        let now = Instant::now();
        for user_id in user_ids {
            let mut instances = self.entries.entry(user_id.clone()).or_default();
            instances.retain(|_, expiry| *expiry > now);
            instances.insert(instance_id.to_string(), now + ttl);
        }
        Ok(())
    }

    async fn is_online(&self, user_id: &str) -> AppResult<bool> {
        let now = Instant::now();
        Ok(self
            .entries
            .get(user_id)
            .is_some_and(|instances| instances.values().any(|expiry| *expiry > now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_online_until_last_instance_leaves() {
        let presence = MemoryPresenceStore::new();
        let ttl = Duration::from_secs(60);
        presence.mark_online("u1", "a", ttl).await.expect("mark");
        presence.mark_online("u1", "b", ttl).await.expect("mark");

        presence.mark_offline("u1", "a").await.expect("clear");
        assert!(presence.is_online("u1").await.expect("lookup"));

        presence.mark_offline("u1", "b").await.expect("clear");
        assert!(!presence.is_online("u1").await.expect("lookup"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_entries_expire_without_refresh() {
        let presence = MemoryPresenceStore::new();
        let ttl = Duration::from_secs(10);
        presence.mark_online("u1", "a", ttl).await.expect("mark");
        presence.mark_online("u2", "a", ttl).await.expect("mark");

        tokio::time::advance(Duration::from_secs(6)).await;
        presence
            .refresh(&["u1".to_string()], "a", ttl)
            .await
            .expect("refresh");

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(presence.is_online("u1").await.expect("lookup"));
        assert!(!presence.is_online("u2").await.expect("lookup"));
    }
}
