//! Real-time sync engine configuration.

use serde::{Deserialize, Serialize};

/// Sync engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Unique ID of this instance; generated at startup when empty.
    #[serde(default)]
    pub instance_id: String,
    /// Maximum concurrent WebSocket connections on this instance.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Bounded outbound buffer per connection.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer_size: usize,
    /// WebSocket ping interval in seconds.
    #[serde(default = "default_ping_interval")]
    pub ping_interval_seconds: u64,
    /// Connections idle for longer than this are closed.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_seconds: u64,
    /// Lifetime of a presence entry without a heartbeat refresh.
    #[serde(default = "default_presence_ttl")]
    pub presence_ttl_seconds: u64,
    /// Interval of the maintenance task (presence refresh, offline trim).
    #[serde(default = "default_maintenance_interval")]
    pub maintenance_interval_seconds: u64,
    /// Offline queue settings.
    #[serde(default)]
    pub offline: OfflineConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            instance_id: String::new(),
            max_connections: default_max_connections(),
            outbound_buffer_size: default_outbound_buffer(),
            ping_interval_seconds: default_ping_interval(),
            idle_timeout_seconds: default_idle_timeout(),
            presence_ttl_seconds: default_presence_ttl(),
            maintenance_interval_seconds: default_maintenance_interval(),
            offline: OfflineConfig::default(),
        }
    }
}

/// Offline-delivery queue settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OfflineConfig {
    /// Unacknowledged entries older than this are expired.
    #[serde(default = "default_message_ttl")]
    pub message_ttl_hours: u64,
    /// Maximum queued entries per user; the oldest are trimmed.
    #[serde(default = "default_max_per_user")]
    pub max_per_user: u64,
    /// Page size when the client does not specify one.
    #[serde(default = "default_page_size")]
    pub default_page_size: usize,
    /// Upper bound on a requested page size.
    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
}

impl Default for OfflineConfig {
    fn default() -> Self {
        Self {
            message_ttl_hours: default_message_ttl(),
            max_per_user: default_max_per_user(),
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
        }
    }
}

fn default_max_connections() -> usize {
    10_000
}

fn default_outbound_buffer() -> usize {
    256
}

fn default_ping_interval() -> u64 {
    30
}

fn default_idle_timeout() -> u64 {
    90
}

fn default_presence_ttl() -> u64 {
    60
}

fn default_maintenance_interval() -> u64 {
    20
}

fn default_message_ttl() -> u64 {
    24 * 7
}

fn default_max_per_user() -> u64 {
    1000
}

fn default_page_size() -> usize {
    50
}

fn default_max_page_size() -> usize {
    500
}
