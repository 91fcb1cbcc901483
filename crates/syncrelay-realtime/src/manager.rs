//! Sync manager: lifecycle owner and delivery coordinator for one instance.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use syncrelay_cache::Backends;
use syncrelay_core::config::{BusConfig, SyncConfig};
use syncrelay_core::error::{AppError, ErrorKind};
use syncrelay_core::result::AppResult;
use syncrelay_core::traits::{MessageBus, OfflineStore, PresenceStore};
use syncrelay_core::types::{
    AckBatchReport, BROADCAST_CHANNEL, ConnectionId, OfflineMessage, OfflineMessageId,
    SyncMessage, USER_CHANNEL_PATTERN,
};

use crate::bus::{BroadcastDeliveryHandler, Publisher, Subscriber, UserDeliveryHandler};
use crate::connection::{
    CloseReason, ConnectionHandle, ConnectionInfo, ConnectionRegistry, HeartbeatConfig,
};
use crate::maintenance::MaintenanceTask;
use crate::message::{ClientFrame, ServerFrame};
use crate::metrics::{
    self, DeliveryMetrics, DeliveryStatsSnapshot, PublisherStatsSnapshot, SubscriberStatsSnapshot,
};

/// How long shutdown waits for in-flight publishes.
const PUBLISH_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Lifecycle of a sync manager. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncState {
    /// Built, not yet consuming the bus.
    Initializing = 0,
    /// Accepting connections and deliveries.
    Running = 1,
    /// Shutting down; new work is refused.
    Draining = 2,
    /// Fully stopped.
    Stopped = 3,
}

impl SyncState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Initializing,
            1 => Self::Running,
            2 => Self::Draining,
            _ => Self::Stopped,
        }
    }

    /// Lowercase name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "initializing",
            Self::Running => "running",
            Self::Draining => "draining",
            Self::Stopped => "stopped",
        }
    }
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a single-user delivery.
#[derive(Debug, Clone, Serialize)]
pub struct DeliveryReport {
    /// Event ID.
    pub message_id: String,
    /// Local sessions that accepted the event.
    pub local_deliveries: usize,
    /// Whether the bus accepted the event.
    pub published: bool,
    /// Offline entry, when one was written.
    pub offline_id: Option<OfflineMessageId>,
}

/// Per-user line of a [`BatchDeliveryReport`].
#[derive(Debug, Clone, Serialize)]
pub struct UserDeliveryOutcome {
    /// Target user.
    pub user_id: String,
    /// Local sessions that accepted the event.
    pub local_deliveries: usize,
    /// Whether the bus accepted the event.
    pub published: bool,
    /// Offline entry, when one was written.
    pub offline_id: Option<OfflineMessageId>,
    /// Set when the event reached nobody and could not be queued.
    pub error: Option<String>,
}

/// Outcome of a multi-user delivery.
#[derive(Debug, Clone, Serialize)]
pub struct BatchDeliveryReport {
    /// Event ID shared by all targets.
    pub message_id: String,
    /// One entry per distinct target, in request order.
    pub results: Vec<UserDeliveryOutcome>,
}

impl BatchDeliveryReport {
    /// Targets that were not reached in any way.
    pub fn failed_count(&self) -> usize {
        self.results.iter().filter(|r| r.error.is_some()).count()
    }
}

/// Outcome of a broadcast.
#[derive(Debug, Clone, Serialize)]
pub struct BroadcastReport {
    /// Event ID.
    pub message_id: String,
    /// Local sessions that accepted the event.
    pub local_deliveries: usize,
    /// Whether the bus accepted the event.
    pub published: bool,
}

/// Where a user is connected.
#[derive(Debug, Clone, Serialize)]
pub struct UserPresence {
    /// User ID.
    pub user_id: String,
    /// Sessions on this instance.
    pub local_sessions: usize,
    /// Live on any instance, according to the shared presence store.
    pub online: bool,
    /// Details of the local sessions, oldest first.
    pub sessions: Vec<ConnectionInfo>,
}

/// Instance statistics.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStats {
    pub instance_id: String,
    pub state: SyncState,
    pub bus_backend: &'static str,
    pub connections: usize,
    pub users: usize,
    pub max_connections: usize,
    pub publisher: PublisherStatsSnapshot,
    pub subscriber: SubscriberStatsSnapshot,
    pub delivery: DeliveryStatsSnapshot,
}

/// Backend reachability.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct BackendHealth {
    pub bus: bool,
    pub offline: bool,
}

/// Owns the registry, publisher, subscriber and maintenance task of one
/// instance, and routes each event to local sessions, the bus, and the
/// offline queue.
pub struct SyncManager {
    config: SyncConfig,
    state: AtomicU8,
    registry: Arc<ConnectionRegistry>,
    publisher: Arc<Publisher>,
    subscriber: Arc<Subscriber>,
    bus: Arc<dyn MessageBus>,
    offline: Arc<dyn OfflineStore>,
    presence: Arc<dyn PresenceStore>,
    metrics: Arc<DeliveryMetrics>,
    maintenance: Arc<MaintenanceTask>,
    maintenance_task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
    /// Parent of every background task; cancelled once stopped.
    token: CancellationToken,
}

impl std::fmt::Debug for SyncManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncManager")
            .field("instance_id", &self.config.instance_id)
            .field("state", &self.state())
            .field("connections", &self.registry.count())
            .finish()
    }
}

impl SyncManager {
    /// Wire up a manager over the given backends.
    ///
    /// `sync.instance_id` must already be set.
    pub async fn new(sync: SyncConfig, bus_config: &BusConfig, backends: Backends) -> Self {
        let instance_id = sync.instance_id.clone();
        let registry = Arc::new(ConnectionRegistry::new(sync.max_connections));
        let metrics = Arc::new(DeliveryMetrics::default());

        let publisher = Arc::new(Publisher::new(
            backends.bus.clone(),
            instance_id.clone(),
            bus_config,
        ));
        let subscriber = Arc::new(Subscriber::new(
            backends.bus.clone(),
            instance_id.clone(),
            Duration::from_millis(bus_config.reconnect_backoff_ms),
        ));
        subscriber
            .subscribe(
                USER_CHANNEL_PATTERN,
                Arc::new(UserDeliveryHandler::new(registry.clone(), metrics.clone())),
            )
            .await;
        subscriber
            .subscribe(
                BROADCAST_CHANNEL,
                Arc::new(BroadcastDeliveryHandler::new(registry.clone(), metrics.clone())),
            )
            .await;

        let maintenance = Arc::new(MaintenanceTask::new(
            &sync,
            registry.clone(),
            backends.offline.clone(),
            backends.presence.clone(),
            metrics.clone(),
        ));

        Self {
            config: sync,
            state: AtomicU8::new(SyncState::Initializing as u8),
            registry,
            publisher,
            subscriber,
            bus: backends.bus,
            offline: backends.offline,
            presence: backends.presence,
            metrics,
            maintenance,
            maintenance_task: Mutex::new(None),
            token: CancellationToken::new(),
        }
    }

    // ── Lifecycle ──────────────────────────────────────────────────

    /// Move to `Running`, start background tasks, and shut down when
    /// `shutdown` is cancelled.
    pub async fn start(self: &Arc<Self>, shutdown: CancellationToken) -> AppResult<()> {
        self.transition(SyncState::Initializing, SyncState::Running)
            .map_err(|state| {
                AppError::service_unavailable(format!("Cannot start sync manager in state {state}"))
            })?;

        self.subscriber.start(&self.token).await;

        let maintenance_token = self.token.child_token();
        let maintenance = self.maintenance.clone();
        let run_token = maintenance_token.clone();
        let handle = tokio::spawn(async move { maintenance.run(run_token).await });
        *self.maintenance_task.lock().await = Some((maintenance_token, handle));

        let this = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => this.shutdown().await,
                _ = this.token.cancelled() => {}
            }
        });

        info!(
            instance_id = %self.config.instance_id,
            bus = self.bus.backend_name(),
            max_connections = self.config.max_connections,
            "Sync manager running"
        );
        Ok(())
    }

    /// Drain and stop. Safe to call more than once.
    pub async fn shutdown(&self) {
        loop {
            let current = self.state();
            match current {
                SyncState::Draining | SyncState::Stopped => return,
                SyncState::Initializing | SyncState::Running => {
                    if self.transition(current, SyncState::Draining).is_ok() {
                        break;
                    }
                }
            }
        }
        info!(instance_id = %self.config.instance_id, "Sync manager draining");

        // ── Step 1: Close client connections ──
        let closed = self.registry.close_all(CloseReason::Draining);

        // ── Step 2: Stop consuming the bus ──
        self.subscriber.stop().await;

        // ── Step 3: Let in-flight publishes finish ──
        self.publisher.drain(PUBLISH_DRAIN_TIMEOUT).await;

        // ── Step 4: Stop maintenance ──
        if let Some((token, handle)) = self.maintenance_task.lock().await.take() {
            token.cancel();
            let _ = handle.await;
        }

        // ── Step 5: Withdraw presence claims ──
        for user_id in self.registry.all_user_ids() {
            if let Err(e) = self
                .presence
                .mark_offline(&user_id, &self.config.instance_id)
                .await
            {
                metrics::inc(&self.metrics.presence_failures);
                warn!(user_id = %user_id, error = %e, "Failed to clear presence on shutdown");
            }
        }

        self.state.store(SyncState::Stopped as u8, Ordering::Release);
        self.token.cancel();
        info!(
            instance_id = %self.config.instance_id,
            closed_connections = closed,
            "Sync manager stopped"
        );
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SyncState {
        SyncState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn transition(&self, from: SyncState, to: SyncState) -> Result<(), SyncState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(SyncState::from_u8)
    }

    fn ensure_running(&self) -> AppResult<()> {
        match self.state() {
            SyncState::Running => Ok(()),
            state => Err(AppError::service_unavailable(format!(
                "Sync manager is {state}"
            ))),
        }
    }

    // ── Connections ────────────────────────────────────────────────

    /// Admit a client session for `user_id`.
    ///
    /// Returns the handle and the receiver the session's writer drains.
    pub async fn register_connection(
        &self,
        user_id: &str,
    ) -> AppResult<(Arc<ConnectionHandle>, mpsc::Receiver<ServerFrame>)> {
        self.ensure_running()?;

        let (tx, rx) = mpsc::channel(self.config.outbound_buffer_size.max(1));
        let handle = Arc::new(ConnectionHandle::new(
            user_id,
            self.config.instance_id.clone(),
            tx,
        ));

        if let Err(e) = self.registry.register(handle.clone()) {
            if e.kind == ErrorKind::CapacityExceeded {
                metrics::inc(&self.metrics.connections_rejected);
            }
            return Err(e);
        }

        // A drain that began during registration may have missed this handle.
        if let Err(e) = self.ensure_running() {
            self.registry.unregister(&handle.id);
            return Err(e);
        }
        metrics::inc(&self.metrics.connections_total);

        if let Err(e) = self
            .presence
            .mark_online(user_id, &self.config.instance_id, self.presence_ttl())
            .await
        {
            metrics::inc(&self.metrics.presence_failures);
            warn!(user_id, error = %e, "Failed to record presence");
        }

        Ok((handle, rx))
    }

    /// Remove a session. Clears this instance's presence claim when it was
    /// the user's last local session.
    pub async fn unregister_connection(&self, conn_id: &ConnectionId) -> Option<Arc<ConnectionHandle>> {
        let handle = self.registry.unregister(conn_id)?;

        if self.registry.local_sessions_for(&handle.user_id).is_empty() {
            if let Err(e) = self
                .presence
                .mark_offline(&handle.user_id, &self.config.instance_id)
                .await
            {
                metrics::inc(&self.metrics.presence_failures);
                warn!(user_id = %handle.user_id, error = %e, "Failed to clear presence");
            }
        }
        Some(handle)
    }

    /// Handle a text frame from a client.
    pub async fn handle_inbound(&self, handle: &ConnectionHandle, raw: &str) {
        handle.touch();

        let frame = match serde_json::from_str::<ClientFrame>(raw) {
            Ok(frame) => frame,
            Err(e) => {
                debug!(conn_id = %handle.id, error = %e, "Invalid client frame");
                handle.send(ServerFrame::error("INVALID_MESSAGE", e.to_string()));
                return;
            }
        };

        match frame {
            ClientFrame::Pong { .. } => {}
            ClientFrame::Ack { ids } => {
                let report = self.ack_batch(&handle.user_id, &ids).await;
                handle.send(ServerFrame::acked(report));
            }
            ClientFrame::FetchOffline { offset, limit } => {
                let reply = match self.fetch_offline(&handle.user_id, offset, limit).await {
                    Ok(messages) => ServerFrame::OfflineMessages { messages },
                    Err(e) => ServerFrame::error("FETCH_FAILED", e.message),
                };
                handle.send(reply);
            }
        }
    }

    // ── Delivery ───────────────────────────────────────────────────

    /// Deliver an event to one user.
    ///
    /// Pushes to local sessions, publishes to the bus regardless, and queues
    /// offline when the user has no live session anywhere or the bus is
    /// unreachable. Fails only when none of the three paths succeeded.
    pub async fn deliver(&self, user_id: &str, message: &SyncMessage) -> AppResult<DeliveryReport> {
        self.ensure_running()?;
        let message = message.for_user(user_id).stamped(&self.config.instance_id);

        let local = self.push_local(user_id, &message);

        let published = match self.publisher.publish_to_user(user_id, &message).await {
            Ok(()) => true,
            Err(e) => {
                metrics::inc(&self.metrics.fanout_failures);
                warn!(user_id, message_id = %message.id, error = %e, "Bus fan-out failed");
                false
            }
        };

        let (offline_id, offline_error) = self.queue_if_unreachable(user_id, &message, local, published).await;

        if local == 0 && !published {
            if let Some(e) = offline_error {
                return Err(AppError::with_source(
                    ErrorKind::ServiceUnavailable,
                    format!("Event {} could not be delivered, published, or queued", message.id),
                    e,
                ));
            }
        }

        Ok(DeliveryReport {
            message_id: message.id,
            local_deliveries: local,
            published,
            offline_id,
        })
    }

    /// Deliver the same event to several users.
    ///
    /// Duplicate IDs are collapsed. Each target is judged on its own; one
    /// failure does not roll back the others.
    pub async fn deliver_batch(
        &self,
        user_ids: &[String],
        message: &SyncMessage,
    ) -> AppResult<BatchDeliveryReport> {
        self.ensure_running()?;
        let message = message.stamped(&self.config.instance_id);

        let mut seen = HashSet::new();
        let targets: Vec<String> = user_ids
            .iter()
            .filter(|u| seen.insert(u.as_str()))
            .cloned()
            .collect();

        let local: Vec<usize> = targets
            .iter()
            .map(|user_id| self.push_local(user_id, &message.for_user(user_id)))
            .collect();

        let publish = self.publisher.batch_publish_to_users(&targets, &message).await;
        if !publish.failed.is_empty() {
            metrics::add(&self.metrics.fanout_failures, publish.failed.len() as u64);
        }

        let mut results = Vec::with_capacity(targets.len());
        for (user_id, local) in targets.into_iter().zip(local) {
            let published = publish.succeeded(&user_id);
            let targeted = message.for_user(&user_id);
            let (offline_id, offline_error) =
                self.queue_if_unreachable(&user_id, &targeted, local, published).await;
            let error = match offline_error {
                Some(e) if local == 0 && !published => Some(e.to_string()),
                _ => None,
            };
            results.push(UserDeliveryOutcome {
                user_id,
                local_deliveries: local,
                published,
                offline_id,
                error,
            });
        }

        let report = BatchDeliveryReport {
            message_id: message.id,
            results,
        };
        debug!(
            message_id = %report.message_id,
            targets = report.results.len(),
            failed = report.failed_count(),
            "Batch delivery finished"
        );
        Ok(report)
    }

    /// Deliver an event to every connected user on every instance.
    ///
    /// Broadcasts are never queued offline.
    pub async fn broadcast(&self, message: &SyncMessage) -> AppResult<BroadcastReport> {
        self.ensure_running()?;
        let mut message = message.stamped(&self.config.instance_id);
        message.target_user_id = None;

        let local = self.registry.send_to_all(&ServerFrame::event(message.clone()));
        metrics::add(&self.metrics.local_deliveries, local as u64);

        let published = match self.publisher.publish_broadcast(&message).await {
            Ok(()) => true,
            Err(e) => {
                metrics::inc(&self.metrics.fanout_failures);
                if local == 0 {
                    return Err(e);
                }
                warn!(message_id = %message.id, error = %e, "Broadcast fan-out failed");
                false
            }
        };

        Ok(BroadcastReport {
            message_id: message.id,
            local_deliveries: local,
            published,
        })
    }

    fn push_local(&self, user_id: &str, message: &SyncMessage) -> usize {
        let delivered = self
            .registry
            .send_to_user(user_id, &ServerFrame::event(message.clone()));
        metrics::add(&self.metrics.local_deliveries, delivered as u64);
        delivered
    }

    /// Queue `message` when no session received it and either the user is
    /// absent from presence or the bus did not take it.
    async fn queue_if_unreachable(
        &self,
        user_id: &str,
        message: &SyncMessage,
        local: usize,
        published: bool,
    ) -> (Option<OfflineMessageId>, Option<AppError>) {
        if local > 0 {
            return (None, None);
        }
        if published && self.online_elsewhere(user_id).await {
            return (None, None);
        }

        match self.offline.enqueue(user_id, message).await {
            Ok(entry) => {
                metrics::inc(&self.metrics.offline_enqueued);
                debug!(user_id, offline_id = %entry.id, "Event queued offline");
                (Some(entry.id), None)
            }
            Err(e) => {
                metrics::inc(&self.metrics.offline_failures);
                warn!(user_id, message_id = %message.id, error = %e, "Offline enqueue failed");
                (None, Some(e))
            }
        }
    }

    /// Presence lookup; a failed lookup counts as absent.
    async fn online_elsewhere(&self, user_id: &str) -> bool {
        match self.presence.is_online(user_id).await {
            Ok(online) => online,
            Err(e) => {
                metrics::inc(&self.metrics.presence_failures);
                warn!(user_id, error = %e, "Presence lookup failed");
                false
            }
        }
    }

    // ── Offline queue ──────────────────────────────────────────────

    /// A page of pending offline entries, oldest first.
    ///
    /// `limit` defaults to the configured page size and is capped by the
    /// configured maximum.
    pub async fn fetch_offline(
        &self,
        user_id: &str,
        offset: usize,
        limit: Option<usize>,
    ) -> AppResult<Vec<OfflineMessage>> {
        let limit = limit
            .unwrap_or(self.config.offline.default_page_size)
            .clamp(1, self.config.offline.max_page_size.max(1));
        self.offline.list_pending(user_id, offset, limit).await
    }

    /// Acknowledge one entry. Unknown or already-acked IDs return `false`.
    pub async fn ack(&self, user_id: &str, id: OfflineMessageId) -> AppResult<bool> {
        self.offline.ack(user_id, id).await
    }

    /// Acknowledge several entries, reporting the outcome of each ID.
    pub async fn ack_batch(&self, user_id: &str, ids: &[OfflineMessageId]) -> AckBatchReport {
        let report = self.offline.ack_batch(user_id, ids).await;
        if !report.is_complete() {
            warn!(
                user_id,
                acked = report.acked.len(),
                failed = report.failed.len(),
                "Batch ack partially failed"
            );
        }
        report
    }

    /// Pending offline entries for `user_id`.
    pub async fn offline_count(&self, user_id: &str) -> AppResult<u64> {
        self.offline.count(user_id).await
    }

    // ── Queries ────────────────────────────────────────────────────

    /// Users with at least one session on this instance, sorted.
    pub fn online_users(&self) -> Vec<String> {
        let mut users = self.registry.all_user_ids();
        users.sort();
        users
    }

    /// Local sessions plus cluster presence for `user_id`.
    pub async fn user_presence(&self, user_id: &str) -> AppResult<UserPresence> {
        let mut sessions: Vec<ConnectionInfo> = self
            .registry
            .local_sessions_for(user_id)
            .iter()
            .map(|handle| handle.info())
            .collect();
        sessions.sort_by_key(|info| info.established_at);

        let local_sessions = sessions.len();
        let online = local_sessions > 0 || self.presence.is_online(user_id).await?;
        Ok(UserPresence {
            user_id: user_id.to_string(),
            local_sessions,
            online,
            sessions,
        })
    }

    /// Instance statistics.
    pub fn stats(&self) -> SyncStats {
        SyncStats {
            instance_id: self.config.instance_id.clone(),
            state: self.state(),
            bus_backend: self.bus.backend_name(),
            connections: self.registry.count(),
            users: self.registry.user_count(),
            max_connections: self.registry.max_connections(),
            publisher: self.publisher.stats(),
            subscriber: self.subscriber.stats(),
            delivery: self.metrics.snapshot(self.registry.slow_consumer_closes()),
        }
    }

    /// Check that the bus and the offline store are reachable.
    pub async fn backend_health(&self) -> BackendHealth {
        BackendHealth {
            bus: self.bus.health_check().await.unwrap_or(false),
            offline: self.offline.health_check().await.unwrap_or(false),
        }
    }

    /// This instance's ID.
    pub fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    /// Heartbeat timings for new sessions.
    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            ping_interval: Duration::from_secs(self.config.ping_interval_seconds.max(1)),
            idle_timeout: Duration::from_secs(self.config.idle_timeout_seconds),
        }
    }

    /// The connection registry.
    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    fn presence_ttl(&self) -> Duration {
        Duration::from_secs(self.config.presence_ttl_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use serde_json::json;
    use syncrelay_cache::memory::{MemoryMessageBus, MemoryOfflineStore};
    use syncrelay_core::traits::BusStream;
    use syncrelay_core::types::MessageType;

    /// Offline store whose `fail_on`-th ack call errors.
    #[derive(Debug)]
    struct FlakyOffline {
        inner: MemoryOfflineStore,
        calls: AtomicU32,
        fail_on: u32,
    }

    #[async_trait]
    impl OfflineStore for FlakyOffline {
        async fn enqueue(&self, user_id: &str, message: &SyncMessage) -> AppResult<OfflineMessage> {
            self.inner.enqueue(user_id, message).await
        }

        async fn list_pending(
            &self,
            user_id: &str,
            offset: usize,
            limit: usize,
        ) -> AppResult<Vec<OfflineMessage>> {
            self.inner.list_pending(user_id, offset, limit).await
        }

        async fn ack(&self, user_id: &str, id: OfflineMessageId) -> AppResult<bool> {
            if self.calls.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
                return Err(AppError::storage("connection reset"));
            }
            self.inner.ack(user_id, id).await
        }

        async fn count(&self, user_id: &str) -> AppResult<u64> {
            self.inner.count(user_id).await
        }

        async fn purge_expired(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
            self.inner.purge_expired(cutoff).await
        }

        async fn trim_per_user(&self, max: u64) -> AppResult<u64> {
            self.inner.trim_per_user(max).await
        }

        async fn health_check(&self) -> AppResult<bool> {
            Ok(true)
        }
    }

    /// Bus that rejects every publish but still serves subscriptions.
    #[derive(Debug)]
    struct DownBus {
        inner: MemoryMessageBus,
    }

    #[async_trait]
    impl MessageBus for DownBus {
        async fn publish(&self, _channel: &str, _payload: &str) -> AppResult<()> {
            Err(AppError::bus_unavailable("connection refused"))
        }

        async fn subscribe(&self, patterns: &[String]) -> AppResult<BusStream> {
            self.inner.subscribe(patterns).await
        }

        async fn health_check(&self) -> AppResult<bool> {
            Ok(false)
        }

        fn backend_name(&self) -> &'static str {
            "down"
        }
    }

    fn config(instance: &str) -> SyncConfig {
        let mut config = SyncConfig::default();
        config.instance_id = instance.to_string();
        config
    }

    async fn running(instance: &str, backends: Backends) -> Arc<SyncManager> {
        let manager = Arc::new(SyncManager::new(config(instance), &BusConfig::default(), backends).await);
        manager.start(CancellationToken::new()).await.expect("start");
        manager
    }

    fn event(user: &str) -> SyncMessage {
        SyncMessage::new(MessageType::FavoriteAdded, user, json!({"track": 1}))
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let manager = Arc::new(
            SyncManager::new(config("node-a"), &BusConfig::default(), Backends::in_memory(16)).await,
        );
        assert_eq!(manager.state(), SyncState::Initializing);
        assert!(manager.register_connection("u1").await.is_err());

        manager.start(CancellationToken::new()).await.expect("start");
        assert_eq!(manager.state(), SyncState::Running);
        assert!(manager.start(CancellationToken::new()).await.is_err());

        manager.shutdown().await;
        assert_eq!(manager.state(), SyncState::Stopped);
        manager.shutdown().await;
        assert_eq!(manager.state(), SyncState::Stopped);
    }

    #[tokio::test]
    async fn test_local_delivery_skips_offline_queue() {
        let manager = running("node-a", Backends::in_memory(16)).await;
        let (_handle, mut rx) = manager.register_connection("u1").await.expect("register");

        let report = manager.deliver("u1", &event("u1")).await.expect("deliver");
        assert_eq!(report.local_deliveries, 1);
        assert!(report.published);
        assert!(report.offline_id.is_none());

        match rx.recv().await.expect("frame") {
            ServerFrame::Event { message } => {
                assert_eq!(message.origin_instance_id, "node-a");
                assert_eq!(message.target_user_id.as_deref(), Some("u1"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
        assert_eq!(manager.offline_count("u1").await.expect("count"), 0);
    }

    #[tokio::test]
    async fn test_absent_user_is_queued() {
        let manager = running("node-a", Backends::in_memory(16)).await;
        let report = manager.deliver("ghost", &event("ghost")).await.expect("deliver");

        assert_eq!(report.local_deliveries, 0);
        assert!(report.offline_id.is_some());
        assert_eq!(manager.offline_count("ghost").await.expect("count"), 1);
        assert_eq!(manager.stats().delivery.offline_enqueued, 1);
    }

    #[tokio::test]
    async fn test_inbound_ack_and_fetch() {
        let manager = running("node-a", Backends::in_memory(16)).await;
        manager.deliver("u1", &event("u1")).await.expect("deliver");
        let pending = manager.fetch_offline("u1", 0, None).await.expect("fetch");
        assert_eq!(pending.len(), 1);

        let (handle, mut rx) = manager.register_connection("u1").await.expect("register");
        manager
            .handle_inbound(&handle, r#"{"type":"fetch_offline","limit":10}"#)
            .await;
        match rx.recv().await.expect("frame") {
            ServerFrame::OfflineMessages { messages } => assert_eq!(messages.len(), 1),
            other => panic!("unexpected frame: {other:?}"),
        }

        let ack = json!({"type": "ack", "ids": [pending[0].id, pending[0].id]}).to_string();
        manager.handle_inbound(&handle, &ack).await;
        match rx.recv().await.expect("frame") {
            ServerFrame::Acked { count, report } => {
                assert_eq!(count, 1);
                assert_eq!(report.acked, vec![pending[0].id]);
                assert_eq!(report.noop, vec![pending[0].id]);
            }
            other => panic!("unexpected frame: {other:?}"),
        }

        manager.handle_inbound(&handle, "{oops").await;
        match rx.recv().await.expect("frame") {
            ServerFrame::Error { code, .. } => assert_eq!(code, "INVALID_MESSAGE"),
            other => panic!("unexpected frame: {other:?}"),
        }
        assert_eq!(manager.offline_count("u1").await.expect("count"), 0);
    }

    #[tokio::test]
    async fn test_broadcast_is_never_queued() {
        let manager = running("node-a", Backends::in_memory(16)).await;
        let (_handle, mut rx) = manager.register_connection("u1").await.expect("register");

        let msg = SyncMessage::broadcast(MessageType::Broadcast, json!({"notice": "maintenance"}));
        let report = manager.broadcast(&msg).await.expect("broadcast");
        assert_eq!(report.local_deliveries, 1);
        assert!(rx.recv().await.is_some());
        assert_eq!(manager.offline_count("ghost").await.expect("count"), 0);
        assert_eq!(manager.stats().delivery.offline_enqueued, 0);
    }

    #[tokio::test]
    async fn test_presence_follows_last_session() {
        let manager = running("node-a", Backends::in_memory(16)).await;
        let (a, _ra) = manager.register_connection("u1").await.expect("a");
        let (b, _rb) = manager.register_connection("u1").await.expect("b");

        let both = manager.user_presence("u1").await.expect("presence");
        assert_eq!(both.local_sessions, 2);
        assert!(both.sessions.iter().all(|s| s.alive && s.instance_id == "node-a"));

        manager.unregister_connection(&a.id).await.expect("a registered");
        let one = manager.user_presence("u1").await.expect("presence");
        assert!(one.online);
        assert_eq!(one.sessions.len(), 1);
        assert_eq!(one.sessions[0].id, b.id);

        manager.unregister_connection(&b.id).await.expect("b registered");
        let presence = manager.user_presence("u1").await.expect("presence");
        assert_eq!(presence.local_sessions, 0);
        assert!(presence.sessions.is_empty());
        assert!(!presence.online);
    }

    #[tokio::test]
    async fn test_shutdown_closes_sessions_and_refuses_work() {
        let manager = running("node-a", Backends::in_memory(16)).await;
        let (handle, _rx) = manager.register_connection("u1").await.expect("register");

        manager.shutdown().await;

        assert_eq!(handle.close_reason(), Some(CloseReason::Draining));
        let err = manager.deliver("u1", &event("u1")).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ServiceUnavailable);
        assert!(manager.register_connection("u2").await.is_err());
    }

    #[tokio::test]
    async fn test_cancelled_token_triggers_shutdown() {
        let manager = Arc::new(
            SyncManager::new(config("node-a"), &BusConfig::default(), Backends::in_memory(16)).await,
        );
        let token = CancellationToken::new();
        manager.start(token.clone()).await.expect("start");

        token.cancel();
        tokio::time::timeout(Duration::from_secs(5), async {
            while manager.state() != SyncState::Stopped {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("stopped after cancel");
    }

    #[tokio::test]
    async fn test_ack_batch_continues_past_store_error() {
        let backends = Backends {
            offline: Arc::new(FlakyOffline {
                inner: MemoryOfflineStore::new(),
                calls: AtomicU32::new(0),
                fail_on: 2,
            }),
            ..Backends::in_memory(16)
        };
        let manager = running("node-a", backends).await;
        let mut ids = Vec::new();
        for _ in 0..3 {
            let report = manager.deliver("away", &event("away")).await.expect("deliver");
            ids.push(report.offline_id.expect("queued"));
        }

        let report = manager.ack_batch("away", &ids).await;

        assert_eq!(report.acked, vec![ids[0], ids[2]]);
        assert!(report.noop.is_empty());
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].id, ids[1]);
        assert!(report.failed[0].error.contains("connection reset"));
        assert_eq!(manager.offline_count("away").await.expect("count"), 1);

        let retry = manager.ack_batch("away", &ids).await;
        assert_eq!(retry.acked, vec![ids[1]]);
        assert_eq!(retry.noop, vec![ids[0], ids[2]]);
        assert!(retry.is_complete());
    }

    #[tokio::test]
    async fn test_failed_publish_queues_even_when_online_elsewhere() {
        let backends = Backends {
            bus: Arc::new(DownBus {
                inner: MemoryMessageBus::new(16),
            }),
            ..Backends::in_memory(16)
        };
        backends
            .presence
            .mark_online("u1", "node-b", Duration::from_secs(60))
            .await
            .expect("presence");

        let bus_config = BusConfig {
            publish_max_retries: 0,
            ..BusConfig::default()
        };
        let manager = Arc::new(SyncManager::new(config("node-a"), &bus_config, backends).await);
        manager.start(CancellationToken::new()).await.expect("start");

        let report = manager.deliver("u1", &event("u1")).await.expect("deliver");

        assert!(!report.published);
        assert_eq!(report.local_deliveries, 0);
        assert!(report.offline_id.is_some());
        assert_eq!(manager.offline_count("u1").await.expect("count"), 1);
        assert_eq!(manager.stats().delivery.fanout_failures, 1);
    }
}
