//! Shared bus backend configuration.

use serde::{Deserialize, Serialize};

/// Bus, presence, and offline-queue backend configuration.
///
/// The same provider backs all three so that a Redis deployment shares
/// one connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusConfig {
    /// Backend type: `"memory"` (single node) or `"redis"`.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// Redis-specific configuration.
    #[serde(default)]
    pub redis: RedisBusConfig,
    /// Attempts after the first failed publish.
    #[serde(default = "default_publish_retries")]
    pub publish_max_retries: u32,
    /// Base delay for exponential publish backoff in milliseconds.
    #[serde(default = "default_retry_backoff")]
    pub retry_backoff_ms: u64,
    /// Delay between subscriber reconnect attempts in milliseconds.
    #[serde(default = "default_reconnect_backoff")]
    pub reconnect_backoff_ms: u64,
    /// Buffer size for the in-memory bus.
    #[serde(default = "default_memory_buffer")]
    pub memory_buffer_size: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            redis: RedisBusConfig::default(),
            publish_max_retries: default_publish_retries(),
            retry_backoff_ms: default_retry_backoff(),
            reconnect_backoff_ms: default_reconnect_backoff(),
            memory_buffer_size: default_memory_buffer(),
        }
    }
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisBusConfig {
    /// Redis connection URL (credentials may be embedded).
    #[serde(default = "default_redis_url")]
    pub url: String,
    /// Key prefix for presence and offline-queue keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisBusConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_provider() -> String {
    "memory".to_string()
}

fn default_publish_retries() -> u32 {
    3
}

fn default_retry_backoff() -> u64 {
    50
}

fn default_reconnect_backoff() -> u64 {
    1000
}

fn default_memory_buffer() -> usize {
    4096
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_key_prefix() -> String {
    "syncrelay:".to_string()
}
