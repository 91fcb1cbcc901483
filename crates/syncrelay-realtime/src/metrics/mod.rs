//! Sync engine counters.
//!
//! All counters are monotonically increasing [`AtomicU64`]s updated with
//! relaxed ordering; snapshots are eventually consistent.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Bump a counter by one.
pub(crate) fn inc(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Bump a counter by `n`.
pub(crate) fn add(counter: &AtomicU64, n: u64) {
    counter.fetch_add(n, Ordering::Relaxed);
}

fn load(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

/// Publisher counters.
#[derive(Debug, Default)]
pub struct PublisherMetrics {
    /// Messages accepted by the bus
    pub total_published: AtomicU64,
    /// User-targeted messages accepted by the bus
    pub user_published: AtomicU64,
    /// Broadcast messages accepted by the bus
    pub broadcast_published: AtomicU64,
    /// Publishes that failed after all retries
    pub failed: AtomicU64,
    /// Retry attempts
    pub retries: AtomicU64,
}

impl PublisherMetrics {
    /// Get a snapshot of all counters
    pub fn snapshot(&self) -> PublisherStatsSnapshot {
        PublisherStatsSnapshot {
            total_published: load(&self.total_published),
            user_published: load(&self.user_published),
            broadcast_published: load(&self.broadcast_published),
            failed: load(&self.failed),
            retries: load(&self.retries),
        }
    }
}

/// Serializable publisher snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublisherStatsSnapshot {
    /// Messages accepted by the bus
    pub total_published: u64,
    /// User-targeted messages accepted by the bus
    pub user_published: u64,
    /// Broadcast messages accepted by the bus
    pub broadcast_published: u64,
    /// Publishes that failed after all retries
    pub failed: u64,
    /// Retry attempts
    pub retries: u64,
}

/// Subscriber counters.
#[derive(Debug, Default)]
pub struct SubscriberMetrics {
    /// Messages read from the bus
    pub received: AtomicU64,
    /// Messages handed to at least one handler
    pub dispatched: AtomicU64,
    /// Messages discarded by echo suppression
    pub dropped_messages: AtomicU64,
    /// Payloads that were not a valid event
    pub malformed: AtomicU64,
    /// Handler invocations that returned an error
    pub handler_errors: AtomicU64,
    /// Bus subscription re-establishments
    pub reconnects: AtomicU64,
}

impl SubscriberMetrics {
    /// Get a snapshot of all counters
    pub fn snapshot(&self) -> SubscriberStatsSnapshot {
        SubscriberStatsSnapshot {
            received: load(&self.received),
            dispatched: load(&self.dispatched),
            dropped_messages: load(&self.dropped_messages),
            malformed: load(&self.malformed),
            handler_errors: load(&self.handler_errors),
            reconnects: load(&self.reconnects),
        }
    }
}

/// Serializable subscriber snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberStatsSnapshot {
    /// Messages read from the bus
    pub received: u64,
    /// Messages handed to at least one handler
    pub dispatched: u64,
    /// Messages discarded by echo suppression
    pub dropped_messages: u64,
    /// Payloads that were not a valid event
    pub malformed: u64,
    /// Handler invocations that returned an error
    pub handler_errors: u64,
    /// Bus subscription re-establishments
    pub reconnects: u64,
}

/// Delivery-path counters kept by the sync manager.
#[derive(Debug, Default)]
pub struct DeliveryMetrics {
    /// Frames pushed to local sessions by the publish path
    pub local_deliveries: AtomicU64,
    /// Frames pushed to local sessions for events from other instances
    pub remote_deliveries: AtomicU64,
    /// Events written to the offline queue
    pub offline_enqueued: AtomicU64,
    /// Offline entries dropped for exceeding the retention window
    pub offline_expired: AtomicU64,
    /// Pending offline entries dropped by the per-user queue cap
    pub offline_trimmed: AtomicU64,
    /// Bus publishes that failed
    pub fanout_failures: AtomicU64,
    /// Offline enqueues that failed
    pub offline_failures: AtomicU64,
    /// Presence lookups or updates that failed
    pub presence_failures: AtomicU64,
    /// Maintenance steps that failed
    pub maintenance_failures: AtomicU64,
    /// Connections accepted
    pub connections_total: AtomicU64,
    /// Connections refused at capacity
    pub connections_rejected: AtomicU64,
}

impl DeliveryMetrics {
    /// Get a snapshot; slow-consumer closes come from the registry.
    pub fn snapshot(&self, slow_consumer_closes: u64) -> DeliveryStatsSnapshot {
        DeliveryStatsSnapshot {
            local_deliveries: load(&self.local_deliveries),
            remote_deliveries: load(&self.remote_deliveries),
            offline_enqueued: load(&self.offline_enqueued),
            offline_expired: load(&self.offline_expired),
            offline_trimmed: load(&self.offline_trimmed),
            fanout_failures: load(&self.fanout_failures),
            offline_failures: load(&self.offline_failures),
            presence_failures: load(&self.presence_failures),
            maintenance_failures: load(&self.maintenance_failures),
            connections_total: load(&self.connections_total),
            connections_rejected: load(&self.connections_rejected),
            slow_consumer_closes,
        }
    }
}

/// Serializable delivery snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryStatsSnapshot {
    /// Frames pushed to local sessions by the publish path
    pub local_deliveries: u64,
    /// Frames pushed to local sessions for events from other instances
    pub remote_deliveries: u64,
    /// Events written to the offline queue
    pub offline_enqueued: u64,
    /// Offline entries dropped for exceeding the retention window
    pub offline_expired: u64,
    /// Pending offline entries dropped by the per-user queue cap
    pub offline_trimmed: u64,
    /// Bus publishes that failed
    pub fanout_failures: u64,
    /// Offline enqueues that failed
    pub offline_failures: u64,
    /// Presence lookups or updates that failed
    pub presence_failures: u64,
    /// Maintenance steps that failed
    pub maintenance_failures: u64,
    /// Connections accepted
    pub connections_total: u64,
    /// Connections refused at capacity
    pub connections_rejected: u64,
    /// Connections closed because their buffer filled up
    pub slow_consumer_closes: u64,
}
