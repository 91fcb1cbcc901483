//! Bus subscriber: consumes the shared bus and dispatches to local handlers.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::{Mutex, RwLock, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use syncrelay_core::result::AppResult;
use syncrelay_core::traits::{BusMessage, MessageBus};
use syncrelay_core::types::{SyncMessage, channel_matches};

use crate::metrics::{self, SubscriberMetrics, SubscriberStatsSnapshot};

/// Receives events read from the bus.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    /// Handle an event that arrived on `channel`.
    async fn handle(&self, channel: &str, message: &SyncMessage) -> AppResult<()>;

    /// Handler name for logs.
    fn name(&self) -> &'static str;
}

/// A glob pattern and the handlers bound to it, in registration order.
struct Route {
    pattern: String,
    handlers: Vec<Arc<dyn MessageHandler>>,
}

/// Long-running consumer of the bus.
///
/// Messages stamped with this instance's ID are dropped before any handler
/// runs. Handlers are awaited one at a time in bus order.
pub struct Subscriber {
    bus: Arc<dyn MessageBus>,
    instance_id: String,
    reconnect_backoff: Duration,
    routes: RwLock<Vec<Route>>,
    metrics: SubscriberMetrics,
    task: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl std::fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscriber")
            .field("instance_id", &self.instance_id)
            .field("backend", &self.bus.backend_name())
            .finish()
    }
}

impl Subscriber {
    /// Create a subscriber with an empty dispatch table.
    pub fn new(
        bus: Arc<dyn MessageBus>,
        instance_id: impl Into<String>,
        reconnect_backoff: Duration,
    ) -> Self {
        Self {
            bus,
            instance_id: instance_id.into(),
            reconnect_backoff,
            routes: RwLock::new(Vec::new()),
            metrics: SubscriberMetrics::default(),
            task: Mutex::new(None),
        }
    }

    /// Bind `handler` to a channel glob pattern.
    ///
    /// Patterns added after [`start`](Self::start) take effect on the next
    /// bus resubscription.
    pub async fn subscribe(&self, pattern: impl Into<String>, handler: Arc<dyn MessageHandler>) {
        let pattern = pattern.into();
        let mut routes = self.routes.write().await;
        debug!(pattern = %pattern, handler = handler.name(), "Handler bound");
        match routes.iter_mut().find(|r| r.pattern == pattern) {
            Some(route) => route.handlers.push(handler),
            None => routes.push(Route {
                pattern,
                handlers: vec![handler],
            }),
        }
    }

    /// Spawn the consume loop under a child of `parent`.
    ///
    /// Returns once the first bus subscription attempt has completed.
    /// Calling this while the loop is already running does nothing.
    pub async fn start(self: &Arc<Self>, parent: &CancellationToken) {
        let mut task = self.task.lock().await;
        if task.is_some() {
            return;
        }
        let token = parent.child_token();
        let this = Arc::clone(self);
        let loop_token = token.clone();
        let (ready_tx, ready_rx) = oneshot::channel();
        let handle = tokio::spawn(async move { this.run(loop_token, ready_tx).await });
        *task = Some((token, handle));
        drop(task);

        let _ = ready_rx.await;
        info!(instance_id = %self.instance_id, "Subscriber started");
    }

    /// Cancel the consume loop and wait for it to exit.
    pub async fn stop(&self) {
        let Some((token, handle)) = self.task.lock().await.take() else {
            return;
        };
        token.cancel();
        if let Err(e) = handle.await {
            error!(error = %e, "Subscriber task panicked");
        }
        info!(instance_id = %self.instance_id, "Subscriber stopped");
    }

    /// Whether the consume loop is running.
    pub async fn is_running(&self) -> bool {
        self.task
            .lock()
            .await
            .as_ref()
            .is_some_and(|(_, handle)| !handle.is_finished())
    }

    /// Counter snapshot.
    pub fn stats(&self) -> SubscriberStatsSnapshot {
        self.metrics.snapshot()
    }

    async fn patterns(&self) -> Vec<String> {
        self.routes
            .read()
            .await
            .iter()
            .map(|r| r.pattern.clone())
            .collect()
    }

    async fn run(&self, token: CancellationToken, ready: oneshot::Sender<()>) {
        let mut ready = Some(ready);
        let mut first = true;
        while !token.is_cancelled() {
            if !first {
                metrics::inc(&self.metrics.reconnects);
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(self.reconnect_backoff) => {}
                }
            }
            first = false;

            let patterns = self.patterns().await;
            let subscribed = self.bus.subscribe(&patterns).await;
            if let Some(ready) = ready.take() {
                let _ = ready.send(());
            }
            let mut stream = match subscribed {
                Ok(stream) => stream,
                Err(e) => {
                    warn!(error = %e, "Bus subscribe failed, retrying");
                    continue;
                }
            };
            debug!(patterns = ?patterns, "Bus subscription established");

            loop {
                tokio::select! {
                    _ = token.cancelled() => return,
                    next = stream.next() => match next {
                        Some(raw) => self.dispatch(raw).await,
                        None => {
                            warn!("Bus stream ended, resubscribing");
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Decode, echo-filter and route a single bus message.
    pub async fn dispatch(&self, raw: BusMessage) {
        metrics::inc(&self.metrics.received);

        let message: SyncMessage = match serde_json::from_str(&raw.payload) {
            Ok(m) => m,
            Err(e) => {
                metrics::inc(&self.metrics.malformed);
                warn!(channel = %raw.channel, error = %e, "Malformed bus payload");
                return;
            }
        };

        if message.origin_instance_id == self.instance_id {
            metrics::inc(&self.metrics.dropped_messages);
            return;
        }

        let routes = self.routes.read().await;
        let mut ran = false;
        for route in routes.iter().filter(|r| channel_matches(&r.pattern, &raw.channel)) {
            for handler in &route.handlers {
                ran = true;
                if let Err(e) = handler.handle(&raw.channel, &message).await {
                    metrics::inc(&self.metrics.handler_errors);
                    warn!(
                        channel = %raw.channel,
                        handler = handler.name(),
                        message_id = %message.id,
                        error = %e,
                        "Handler failed"
                    );
                }
            }
        }
        if ran {
            metrics::inc(&self.metrics.dispatched);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use syncrelay_cache::memory::MemoryMessageBus;
    use syncrelay_core::error::AppError;
    use syncrelay_core::traits::BusStream;
    use syncrelay_core::types::MessageType;
    use tokio::sync::mpsc;

    struct Recorder {
        tx: mpsc::UnboundedSender<(String, String)>,
        fail: bool,
    }

    #[async_trait]
    impl MessageHandler for Recorder {
        async fn handle(&self, channel: &str, message: &SyncMessage) -> AppResult<()> {
            let _ = self.tx.send((channel.to_string(), message.id.clone()));
            if self.fail {
                return Err(AppError::internal("boom"));
            }
            Ok(())
        }

        fn name(&self) -> &'static str {
            "recorder"
        }
    }

    fn raw(channel: &str, origin: &str) -> BusMessage {
        let msg = SyncMessage::new(MessageType::FavoriteAdded, "u1", json!({}))
            .stamped(origin);
        BusMessage {
            channel: channel.to_string(),
            payload: serde_json::to_string(&msg).expect("json"),
        }
    }

    /// Bus whose first subscription yields `first` and then ends.
    #[derive(Debug)]
    struct DroppingBus {
        inner: MemoryMessageBus,
        first: std::sync::Mutex<Option<BusMessage>>,
    }

    #[async_trait]
    impl MessageBus for DroppingBus {
        async fn publish(&self, channel: &str, payload: &str) -> AppResult<()> {
            self.inner.publish(channel, payload).await
        }

        async fn subscribe(&self, patterns: &[String]) -> AppResult<BusStream> {
            let first = self.first.lock().map(|mut slot| slot.take()).unwrap_or(None);
            match first {
                Some(message) => Ok(futures::stream::iter(vec![message]).boxed()),
                None => self.inner.subscribe(patterns).await,
            }
        }

        async fn health_check(&self) -> AppResult<bool> {
            Ok(true)
        }

        fn backend_name(&self) -> &'static str {
            "dropping"
        }
    }

    fn subscriber() -> Subscriber {
        Subscriber::new(
            Arc::new(MemoryMessageBus::new(16)),
            "node-a",
            Duration::from_millis(10),
        )
    }

    #[tokio::test]
    async fn test_own_messages_are_dropped() {
        let sub = subscriber();
        let (tx, mut rx) = mpsc::unbounded_channel();
        sub.subscribe("sync:user:*", Arc::new(Recorder { tx, fail: false }))
            .await;

        sub.dispatch(raw("sync:user:u1", "node-a")).await;
        sub.dispatch(raw("sync:user:u1", "node-b")).await;

        let (channel, _) = rx.try_recv().expect("one delivery");
        assert_eq!(channel, "sync:user:u1");
        assert!(rx.try_recv().is_err());

        let stats = sub.stats();
        assert_eq!(stats.received, 2);
        assert_eq!(stats.dropped_messages, 1);
        assert_eq!(stats.dispatched, 1);
    }

    #[tokio::test]
    async fn test_handler_errors_do_not_stop_dispatch() {
        let sub = subscriber();
        let (tx, mut rx) = mpsc::unbounded_channel();
        sub.subscribe("sync:*", Arc::new(Recorder { tx: tx.clone(), fail: true }))
            .await;
        sub.subscribe("sync:*", Arc::new(Recorder { tx, fail: false }))
            .await;

        sub.dispatch(raw("sync:broadcast", "node-b")).await;

        assert!(rx.try_recv().is_ok());
        assert!(rx.try_recv().is_ok());
        assert_eq!(sub.stats().handler_errors, 1);
    }

    #[tokio::test]
    async fn test_malformed_and_unrouted_payloads() {
        let sub = subscriber();
        sub.dispatch(BusMessage {
            channel: "sync:broadcast".into(),
            payload: "not json".into(),
        })
        .await;
        sub.dispatch(raw("sync:broadcast", "node-b")).await;

        let stats = sub.stats();
        assert_eq!(stats.malformed, 1);
        assert_eq!(stats.received, 2);
        assert_eq!(stats.dispatched, 0);
    }

    #[tokio::test]
    async fn test_consume_loop_delivers_in_order_and_stops() {
        let bus = MemoryMessageBus::new(16);
        let sub = Arc::new(Subscriber::new(
            Arc::new(bus.clone()),
            "node-a",
            Duration::from_millis(10),
        ));
        let (tx, mut rx) = mpsc::unbounded_channel();
        sub.subscribe("sync:user:*", Arc::new(Recorder { tx, fail: false }))
            .await;

        let root = CancellationToken::new();
        sub.start(&root).await;
        assert_eq!(bus.subscriber_count(), 1);

        let first = raw("sync:user:u1", "node-b");
        let second = raw("sync:user:u1", "node-b");
        bus.publish(&first.channel, &first.payload).await.expect("publish");
        bus.publish(&second.channel, &second.payload).await.expect("publish");

        let (_, a) = rx.recv().await.expect("first");
        let (_, b) = rx.recv().await.expect("second");
        let first_id = serde_json::from_str::<SyncMessage>(&first.payload).expect("json").id;
        let second_id = serde_json::from_str::<SyncMessage>(&second.payload).expect("json").id;
        assert_eq!((a, b), (first_id, second_id));

        sub.stop().await;
        assert!(!sub.is_running().await);
    }

    #[tokio::test]
    async fn test_resubscribes_after_stream_ends() {
        let inner = MemoryMessageBus::new(16);
        let first = raw("sync:user:u1", "node-b");
        let bus = Arc::new(DroppingBus {
            inner: inner.clone(),
            first: std::sync::Mutex::new(Some(first.clone())),
        });
        let sub = Arc::new(Subscriber::new(bus, "node-a", Duration::from_millis(10)));
        let (tx, mut rx) = mpsc::unbounded_channel();
        sub.subscribe("sync:user:*", Arc::new(Recorder { tx, fail: false }))
            .await;

        let root = CancellationToken::new();
        sub.start(&root).await;

        let (_, a) = rx.recv().await.expect("first");
        tokio::time::timeout(Duration::from_secs(2), async {
            while inner.subscriber_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("resubscribed");

        let second = raw("sync:user:u1", "node-b");
        inner.publish(&second.channel, &second.payload).await.expect("publish");
        let (_, b) = rx.recv().await.expect("second");

        let id = |m: &BusMessage| serde_json::from_str::<SyncMessage>(&m.payload).expect("json").id;
        assert_eq!((a, b), (id(&first), id(&second)));
        assert_eq!(sub.stats().reconnects, 1);
        assert_eq!(sub.stats().dispatched, 2);

        sub.stop().await;
    }
}
