//! Periodic upkeep: presence refresh and offline-queue expiry.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time;
use tokio_util::sync::CancellationToken;

use syncrelay_core::config::SyncConfig;
use syncrelay_core::traits::{OfflineStore, PresenceStore};

use crate::connection::ConnectionRegistry;
use crate::metrics::{self, DeliveryMetrics};

/// Background service that keeps shared state in shape.
///
/// Each tick it re-asserts presence for every locally connected user and
/// expires offline entries. Expiry has two administrative policies: entries
/// older than the retention window are purged, and the oldest pending
/// entries beyond the per-user cap are dropped. Both are counted.
#[derive(Debug)]
pub struct MaintenanceTask {
    registry: Arc<ConnectionRegistry>,
    offline: Arc<dyn OfflineStore>,
    presence: Arc<dyn PresenceStore>,
    metrics: Arc<DeliveryMetrics>,
    instance_id: String,
    interval: Duration,
    presence_ttl: Duration,
    message_ttl: chrono::Duration,
    max_per_user: u64,
}

impl MaintenanceTask {
    /// Create the task from the sync configuration.
    pub fn new(
        config: &SyncConfig,
        registry: Arc<ConnectionRegistry>,
        offline: Arc<dyn OfflineStore>,
        presence: Arc<dyn PresenceStore>,
        metrics: Arc<DeliveryMetrics>,
    ) -> Self {
        Self {
            registry,
            offline,
            presence,
            metrics,
            instance_id: config.instance_id.clone(),
            interval: Duration::from_secs(config.maintenance_interval_seconds.max(1)),
            presence_ttl: Duration::from_secs(config.presence_ttl_seconds),
            message_ttl: chrono::Duration::hours(config.offline.message_ttl_hours as i64),
            max_per_user: config.offline.max_per_user,
        }
    }

    /// Run until `token` is cancelled.
    pub async fn run(&self, token: CancellationToken) {
        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "Maintenance task started"
        );

        let mut interval = time::interval(self.interval);
        interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = token.cancelled() => {
                    tracing::info!("Maintenance task shutting down");
                    break;
                }
                _ = interval.tick() => self.tick().await,
            }
        }
    }

    /// One maintenance pass. Step failures are logged and counted.
    pub async fn tick(&self) {
        let users = self.registry.all_user_ids();
        if !users.is_empty() {
            if let Err(e) = self
                .presence
                .refresh(&users, &self.instance_id, self.presence_ttl)
                .await
            {
                metrics::inc(&self.metrics.maintenance_failures);
                tracing::warn!(error = %e, users = users.len(), "Presence refresh failed");
            }
        }

        let cutoff = Utc::now() - self.message_ttl;
        match self.offline.purge_expired(cutoff).await {
            Ok(0) => {}
            Ok(purged) => {
                metrics::add(&self.metrics.offline_expired, purged);
                tracing::info!(purged, "Expired offline messages purged");
            }
            Err(e) => {
                metrics::inc(&self.metrics.maintenance_failures);
                tracing::warn!(error = %e, "Offline purge failed");
            }
        }

        match self.offline.trim_per_user(self.max_per_user).await {
            Ok(0) => {}
            Ok(trimmed) => {
                metrics::add(&self.metrics.offline_trimmed, trimmed);
                tracing::warn!(
                    trimmed,
                    max_per_user = self.max_per_user,
                    "Pending offline entries dropped by queue cap"
                );
            }
            Err(e) => {
                metrics::inc(&self.metrics.maintenance_failures);
                tracing::warn!(error = %e, "Offline trim failed");
            }
        }

        tracing::trace!("Maintenance pass complete");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use syncrelay_cache::memory::{MemoryOfflineStore, MemoryPresenceStore};
    use syncrelay_core::types::{MessageType, SyncMessage};
    use tokio::sync::mpsc;

    use crate::connection::ConnectionHandle;

    #[tokio::test]
    async fn test_tick_trims_queues_and_refreshes_presence() {
        let mut config = SyncConfig::default();
        config.instance_id = "node-a".into();
        config.offline.max_per_user = 2;

        let registry = Arc::new(ConnectionRegistry::new(10));
        let (tx, _rx) = mpsc::channel(4);
        registry
            .register(Arc::new(ConnectionHandle::new("online", "node-a", tx)))
            .expect("register");

        let offline = Arc::new(MemoryOfflineStore::new());
        let presence = Arc::new(MemoryPresenceStore::new());
        for _ in 0..4 {
            let msg = SyncMessage::new(MessageType::FavoriteAdded, "away", json!({}));
            offline.enqueue("away", &msg).await.expect("enqueue");
        }

        let metrics = Arc::new(DeliveryMetrics::default());
        let task = MaintenanceTask::new(
            &config,
            registry,
            offline.clone(),
            presence.clone(),
            metrics.clone(),
        );
        task.tick().await;

        assert_eq!(offline.count("away").await.expect("count"), 2);
        assert!(presence.is_online("online").await.expect("presence"));
        let snapshot = metrics.snapshot(0);
        assert_eq!(snapshot.offline_trimmed, 2);
        assert_eq!(snapshot.offline_expired, 0);
        assert_eq!(snapshot.maintenance_failures, 0);
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let mut config = SyncConfig::default();
        config.maintenance_interval_seconds = 1;
        let task = MaintenanceTask::new(
            &config,
            Arc::new(ConnectionRegistry::new(1)),
            Arc::new(MemoryOfflineStore::new()),
            Arc::new(MemoryPresenceStore::new()),
            Arc::new(DeliveryMetrics::default()),
        );
        let token = CancellationToken::new();
        token.cancel();
        time::timeout(Duration::from_secs(1), task.run(token))
            .await
            .expect("run returns after cancel");
    }
}
