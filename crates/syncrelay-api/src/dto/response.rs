//! Response DTOs.

use serde::{Deserialize, Serialize};

use syncrelay_core::types::AckBatchReport;
use syncrelay_realtime::manager::BackendHealth;
use syncrelay_realtime::metrics::{PublisherStatsSnapshot, SubscriberStatsSnapshot};
use syncrelay_realtime::SyncState;

/// Standard success response wrapper.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T: Serialize> {
    /// Whether the request was successful.
    pub success: bool,
    /// Response data.
    pub data: T,
}

impl<T: Serialize> ApiResponse<T> {
    /// Creates a successful response.
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// `ok` while running, `unavailable` otherwise.
    pub status: &'static str,
    /// Crate version.
    pub version: &'static str,
    /// Serving instance.
    pub instance_id: String,
    /// Lifecycle state.
    pub state: SyncState,
    /// Seconds since the server started.
    pub uptime_seconds: u64,
    /// Open sessions on this instance.
    pub connections: usize,
    /// Backend reachability.
    pub backends: BackendHealth,
}

/// A bare count.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountResponse {
    /// Count.
    pub count: u64,
}

/// Result of a single ack.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckResponse {
    /// `false` when the entry was unknown or already acknowledged.
    pub acknowledged: bool,
}

/// Result of a batch ack. Store failures are listed per ID, not raised.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckBatchResponse {
    /// Entries newly acknowledged.
    pub acknowledged: u64,
    #[serde(flatten)]
    pub report: AckBatchReport,
}

impl From<AckBatchReport> for AckBatchResponse {
    fn from(report: AckBatchReport) -> Self {
        Self {
            acknowledged: report.acked_count(),
            report,
        }
    }
}

/// Users connected to this instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OnlineUsersResponse {
    /// User IDs, sorted.
    pub users: Vec<String>,
    /// Number of users.
    pub count: usize,
}

/// Bus counters.
#[derive(Debug, Clone, Serialize)]
pub struct PubSubStatsResponse {
    /// Publisher counters.
    pub publisher: PublisherStatsSnapshot,
    /// Subscriber counters.
    pub subscriber: SubscriberStatsSnapshot,
}
