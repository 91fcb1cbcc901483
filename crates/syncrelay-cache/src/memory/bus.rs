//! In-process message bus.
//!
//! Clones share the same broadcast channel, so several engines built from
//! clones of one bus behave like instances attached to one Redis server.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

use syncrelay_core::result::AppResult;
use syncrelay_core::traits::{BusMessage, BusStream, MessageBus};
use syncrelay_core::types::channel_matches;

/// Single-node bus over a [`tokio::sync::broadcast`] channel.
#[derive(Debug, Clone)]
pub struct MemoryMessageBus {
    /// Shared sender; each subscription holds its own receiver.
    sender: broadcast::Sender<BusMessage>,
}

impl MemoryMessageBus {
    /// Create a bus retaining up to `capacity` undelivered messages per subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    /// Number of open subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[async_trait]
impl MessageBus for MemoryMessageBus {
    async fn publish(&self, channel: &str, payload: &str) -> AppResult<()> {
        // No receivers is not an error, matching PUBLISH returning 0.
        let _ = self.sender.send(BusMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn subscribe(&self, patterns: &[String]) -> AppResult<BusStream> {
        let receiver = self.sender.subscribe();
        let patterns = patterns.to_vec();

        let stream = stream::unfold((receiver, patterns), |(mut receiver, patterns)| async move {
            loop {
                match receiver.recv().await {
                    Ok(msg) => {
                        if patterns.iter().any(|p| channel_matches(p, &msg.channel)) {
                            return Some((msg, (receiver, patterns)));
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "In-memory bus subscriber lagged; messages lost");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        });

        Ok(stream.boxed())
    }

    async fn health_check(&self) -> AppResult<bool> {
        Ok(true)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
