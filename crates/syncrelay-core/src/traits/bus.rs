//! Publish/subscribe transport trait.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::result::AppResult;

/// A raw message observed on the bus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    /// Channel the message was published on.
    pub channel: String,
    /// Serialized payload, as published.
    pub payload: String,
}

/// Stream of bus messages. Ends when the underlying connection is lost.
pub type BusStream = BoxStream<'static, BusMessage>;

/// Trait for cross-instance pub/sub transports (Redis, in-memory).
///
/// Every subscriber observes every message on a matching channel, including
/// messages published by its own instance. Per-channel order is preserved.
#[async_trait]
pub trait MessageBus: Send + Sync + std::fmt::Debug + 'static {
    /// Publish `payload` on `channel`. Returns once the bus accepted it.
    async fn publish(&self, channel: &str, payload: &str) -> AppResult<()>;

    /// Open a subscription for the given glob patterns.
    async fn subscribe(&self, patterns: &[String]) -> AppResult<BusStream>;

    /// Check that the bus is reachable.
    async fn health_check(&self) -> AppResult<bool>;

    /// Short backend name for logs and health output.
    fn backend_name(&self) -> &'static str;
}
