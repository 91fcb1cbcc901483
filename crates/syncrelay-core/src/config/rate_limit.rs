//! Admission-control configuration.

use serde::{Deserialize, Serialize};

/// Rate limits per guarded surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Connection-establishment attempts on `/ws`.
    #[serde(default = "default_ws_rule")]
    pub ws: LimitRule,
    /// REST calls under `/api/v1`.
    #[serde(default = "default_api_rule")]
    pub api: LimitRule,
    /// Interval for reclaiming expired windows.
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_seconds: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            ws: default_ws_rule(),
            api: default_api_rule(),
            cleanup_interval_seconds: default_cleanup_interval(),
        }
    }
}

/// A maximum request count per window.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LimitRule {
    /// Requests admitted per window.
    pub max_requests: u32,
    /// Window length in seconds.
    pub window_seconds: u64,
}

fn default_ws_rule() -> LimitRule {
    LimitRule {
        max_requests: 10,
        window_seconds: 60,
    }
}

fn default_api_rule() -> LimitRule {
    LimitRule {
        max_requests: 100,
        window_seconds: 60,
    }
}

fn default_cleanup_interval() -> u64 {
    60
}
