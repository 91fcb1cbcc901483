//! Bus publisher with bounded retry and in-flight draining.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use syncrelay_core::config::BusConfig;
use syncrelay_core::error::AppError;
use syncrelay_core::result::AppResult;
use syncrelay_core::traits::MessageBus;
use syncrelay_core::types::{BROADCAST_CHANNEL, SyncMessage, user_channel};

use crate::metrics::{self, PublisherMetrics, PublisherStatsSnapshot};

/// Exponent cap for the retry backoff.
const MAX_BACKOFF_SHIFT: u32 = 6;

/// Per-target outcome of [`Publisher::batch_publish_to_users`].
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchPublishReport {
    /// Users whose channel accepted the message.
    pub published: Vec<String>,
    /// Users whose publish failed, with the error.
    pub failed: Vec<BatchFailure>,
}

/// A failed target in a batch publish.
#[derive(Debug, Clone, Serialize)]
pub struct BatchFailure {
    /// Target user.
    pub user_id: String,
    /// Error text.
    pub error: String,
}

impl BatchPublishReport {
    /// Whether the publish to `user_id` succeeded.
    pub fn succeeded(&self, user_id: &str) -> bool {
        self.published.iter().any(|u| u == user_id)
    }
}

/// Writes events onto the shared bus, stamped with this instance's ID.
#[derive(Debug)]
pub struct Publisher {
    /// Bus transport.
    bus: Arc<dyn MessageBus>,
    /// This instance's ID.
    instance_id: String,
    /// Attempts after the first failure.
    max_retries: u32,
    /// Base retry delay.
    retry_backoff: Duration,
    /// Counters.
    metrics: PublisherMetrics,
    /// Publishes currently running.
    in_flight: AtomicUsize,
    /// Signalled when `in_flight` drops to zero.
    idle: Notify,
    /// Set by [`drain`](Self::drain); new publishes are refused.
    closed: AtomicBool,
}

/// Decrements the in-flight count when a publish finishes.
struct InFlightGuard<'a>(&'a Publisher);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.0.in_flight.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.0.idle.notify_waiters();
        }
    }
}

impl Publisher {
    /// Create a publisher for `instance_id`.
    pub fn new(bus: Arc<dyn MessageBus>, instance_id: impl Into<String>, config: &BusConfig) -> Self {
        Self {
            bus,
            instance_id: instance_id.into(),
            max_retries: config.publish_max_retries,
            retry_backoff: Duration::from_millis(config.retry_backoff_ms),
            metrics: PublisherMetrics::default(),
            in_flight: AtomicUsize::new(0),
            idle: Notify::new(),
            closed: AtomicBool::new(false),
        }
    }

    /// Publish to `sync:user:<user_id>`.
    pub async fn publish_to_user(&self, user_id: &str, message: &SyncMessage) -> AppResult<()> {
        let payload = serde_json::to_string(&message.stamped(&self.instance_id))?;
        self.publish_raw(&user_channel(user_id), &payload).await?;
        metrics::inc(&self.metrics.user_published);
        Ok(())
    }

    /// Publish to the broadcast channel.
    pub async fn publish_broadcast(&self, message: &SyncMessage) -> AppResult<()> {
        let payload = serde_json::to_string(&message.stamped(&self.instance_id))?;
        self.publish_raw(BROADCAST_CHANNEL, &payload).await?;
        metrics::inc(&self.metrics.broadcast_published);
        Ok(())
    }

    /// Publish the same event to each distinct user's channel.
    ///
    /// Failures are reported per target; successful publishes are kept.
    pub async fn batch_publish_to_users(
        &self,
        user_ids: &[String],
        message: &SyncMessage,
    ) -> BatchPublishReport {
        let mut report = BatchPublishReport::default();
        let mut seen = HashSet::new();

        for user_id in user_ids {
            if !seen.insert(user_id.as_str()) {
                continue;
            }
            match self.publish_to_user(user_id, &message.for_user(user_id)).await {
                Ok(()) => report.published.push(user_id.clone()),
                Err(e) => report.failed.push(BatchFailure {
                    user_id: user_id.clone(),
                    error: e.to_string(),
                }),
            }
        }

        debug!(
            published = report.published.len(),
            failed = report.failed.len(),
            "Batch publish finished"
        );
        report
    }

    /// Refuse new publishes and wait up to `timeout` for in-flight ones.
    ///
    /// Returns `true` if everything finished in time.
    pub async fn drain(&self, timeout: Duration) -> bool {
        self.closed.store(true, Ordering::Release);

        let wait = async {
            loop {
                let notified = self.idle.notified();
                if self.in_flight.load(Ordering::Acquire) == 0 {
                    return;
                }
                notified.await;
            }
        };

        let drained = tokio::time::timeout(timeout, wait).await.is_ok();
        if drained {
            info!(instance_id = %self.instance_id, "Publisher drained");
        } else {
            warn!(
                in_flight = self.in_flight(),
                "Publisher drain timed out with publishes still running"
            );
        }
        drained
    }

    /// Publishes currently running.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Whether [`drain`](Self::drain) has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> PublisherStatsSnapshot {
        self.metrics.snapshot()
    }

    async fn publish_raw(&self, channel: &str, payload: &str) -> AppResult<()> {
        self.in_flight.fetch_add(1, Ordering::AcqRel);
        let _guard = InFlightGuard(self);

        if self.is_closed() {
            return Err(AppError::service_unavailable(
                "Publisher is draining; publish refused",
            ));
        }

        let mut attempt = 0u32;
        loop {
            match self.bus.publish(channel, payload).await {
                Ok(()) => {
                    metrics::inc(&self.metrics.total_published);
                    return Ok(());
                }
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    metrics::inc(&self.metrics.retries);
                    let delay = self.retry_backoff * (1u32 << attempt.min(MAX_BACKOFF_SHIFT));
                    warn!(
                        channel,
                        attempt = attempt + 1,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Publish failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    metrics::inc(&self.metrics.failed);
                    warn!(channel, attempts = attempt + 1, error = %e, "Publish failed");
                    return Err(AppError::with_source(
                        syncrelay_core::error::ErrorKind::BusUnavailable,
                        format!("Publish to '{channel}' failed after {} attempts", attempt + 1),
                        e,
                    ));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    use async_trait::async_trait;
    use futures::StreamExt;
    use serde_json::json;
    use syncrelay_cache::memory::MemoryMessageBus;
    use syncrelay_core::error::ErrorKind;
    use syncrelay_core::traits::BusStream;
    use syncrelay_core::types::MessageType;

    /// Bus that fails the first `failures` publishes.
    #[derive(Debug)]
    struct FlakyBus {
        failures: AtomicU32,
        inner: MemoryMessageBus,
    }

    #[async_trait]
    impl MessageBus for FlakyBus {
        async fn publish(&self, channel: &str, payload: &str) -> AppResult<()> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(AppError::bus_unavailable("connection reset"));
            }
            self.inner.publish(channel, payload).await
        }

        async fn subscribe(&self, patterns: &[String]) -> AppResult<BusStream> {
            self.inner.subscribe(patterns).await
        }

        async fn health_check(&self) -> AppResult<bool> {
            Ok(true)
        }

        fn backend_name(&self) -> &'static str {
            "flaky"
        }
    }

    /// Bus whose publishes take `delay` to be accepted.
    #[derive(Debug)]
    struct SlowBus {
        delay: Duration,
        accepted: AtomicBool,
    }

    #[async_trait]
    impl MessageBus for SlowBus {
        async fn publish(&self, _channel: &str, _payload: &str) -> AppResult<()> {
            tokio::time::sleep(self.delay).await;
            self.accepted.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn subscribe(&self, _patterns: &[String]) -> AppResult<BusStream> {
            Ok(futures::stream::empty().boxed())
        }

        async fn health_check(&self) -> AppResult<bool> {
            Ok(true)
        }

        fn backend_name(&self) -> &'static str {
            "slow"
        }
    }

    fn config(retries: u32) -> BusConfig {
        BusConfig {
            publish_max_retries: retries,
            retry_backoff_ms: 1,
            ..BusConfig::default()
        }
    }

    fn event() -> SyncMessage {
        SyncMessage::new(MessageType::PlaylistUpdated, "u1", json!({}))
    }

    #[tokio::test]
    async fn test_publish_stamps_origin() {
        let bus = MemoryMessageBus::new(8);
        let mut stream = bus.subscribe(&["sync:*".to_string()]).await.expect("subscribe");
        let publisher = Publisher::new(Arc::new(bus), "node-a", &config(0));

        publisher.publish_to_user("u1", &event()).await.expect("publish");

        let raw = stream.next().await.expect("message");
        assert_eq!(raw.channel, "sync:user:u1");
        let msg: SyncMessage = serde_json::from_str(&raw.payload).expect("json");
        assert_eq!(msg.origin_instance_id, "node-a");

        let stats = publisher.stats();
        assert_eq!(stats.total_published, 1);
        assert_eq!(stats.user_published, 1);
        assert_eq!(stats.broadcast_published, 0);
    }

    #[tokio::test]
    async fn test_batch_counts_each_distinct_user() {
        let publisher = Publisher::new(Arc::new(MemoryMessageBus::new(8)), "node-a", &config(0));
        let users: Vec<String> = ["a", "b", "c", "a"].iter().map(|s| s.to_string()).collect();

        let report = publisher.batch_publish_to_users(&users, &event()).await;

        assert_eq!(report.published, vec!["a", "b", "c"]);
        assert!(report.failed.is_empty());
        assert_eq!(publisher.stats().user_published, 3);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let bus = FlakyBus {
            failures: AtomicU32::new(2),
            inner: MemoryMessageBus::new(8),
        };
        let publisher = Publisher::new(Arc::new(bus), "node-a", &config(3));

        publisher.publish_broadcast(&event()).await.expect("publish");
        let stats = publisher.stats();
        assert_eq!(stats.retries, 2);
        assert_eq!(stats.broadcast_published, 1);
        assert_eq!(stats.failed, 0);
    }

    #[tokio::test]
    async fn test_exhausted_retries_surface_bus_unavailable() {
        let bus = FlakyBus {
            failures: AtomicU32::new(10),
            inner: MemoryMessageBus::new(8),
        };
        let publisher = Publisher::new(Arc::new(bus), "node-a", &config(1));

        let err = publisher.publish_to_user("u1", &event()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::BusUnavailable);
        let stats = publisher.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.user_published, 0);
    }

    #[tokio::test]
    async fn test_drain_refuses_new_publishes() {
        let publisher = Publisher::new(Arc::new(MemoryMessageBus::new(8)), "node-a", &config(0));
        assert!(publisher.drain(Duration::from_millis(50)).await);

        let err = publisher.publish_broadcast(&event()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ServiceUnavailable);
        assert_eq!(publisher.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_drain_waits_for_in_flight_publish() {
        let bus = Arc::new(SlowBus {
            delay: Duration::from_millis(100),
            accepted: AtomicBool::new(false),
        });
        let publisher = Arc::new(Publisher::new(bus.clone(), "node-a", &config(0)));

        let running = {
            let publisher = publisher.clone();
            tokio::spawn(async move { publisher.publish_to_user("u1", &event()).await })
        };
        tokio::time::timeout(Duration::from_secs(1), async {
            while publisher.in_flight() == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("publish started");

        assert!(publisher.drain(Duration::from_secs(2)).await);
        assert!(bus.accepted.load(Ordering::SeqCst));
        assert_eq!(publisher.in_flight(), 0);
        running.await.expect("join").expect("in-flight publish completes");

        let err = publisher.publish_to_user("u1", &event()).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::ServiceUnavailable);
    }

    #[tokio::test]
    async fn test_drain_times_out_on_stuck_publish() {
        let bus = Arc::new(SlowBus {
            delay: Duration::from_secs(30),
            accepted: AtomicBool::new(false),
        });
        let publisher = Arc::new(Publisher::new(bus, "node-a", &config(0)));

        let running = {
            let publisher = publisher.clone();
            tokio::spawn(async move { publisher.publish_broadcast(&event()).await })
        };
        while publisher.in_flight() == 0 {
            tokio::task::yield_now().await;
        }

        assert!(!publisher.drain(Duration::from_millis(50)).await);
        assert_eq!(publisher.in_flight(), 1);
        running.abort();
    }
}
