//! Application state shared across all handlers and middleware.

use std::sync::Arc;
use std::time::Instant;

use syncrelay_auth::JwtDecoder;
use syncrelay_core::config::AppConfig;
use syncrelay_realtime::SyncManager;

use crate::middleware::rate_limit::RateLimiter;

/// Application state containing all shared dependencies.
///
/// Passed to every Axum handler via `State<AppState>`.
/// All fields are `Arc`-wrapped for cheap cloning across tasks.
#[derive(Debug, Clone)]
pub struct AppState {
    // ── Configuration ────────────────────────────────────────
    /// Application configuration
    pub config: Arc<AppConfig>,

    // ── Sync engine ──────────────────────────────────────────
    /// Connection registry, fan-out, and offline delivery
    pub sync: Arc<SyncManager>,

    // ── Auth ─────────────────────────────────────────────────
    /// Bearer token validator
    pub jwt_decoder: Arc<JwtDecoder>,

    // ── Admission control ────────────────────────────────────
    /// Limiter for WebSocket upgrades
    pub ws_limiter: Arc<RateLimiter>,
    /// Limiter for `/api/v1` requests
    pub api_limiter: Arc<RateLimiter>,

    /// Process start, for uptime reporting
    pub started_at: Instant,
}

impl AppState {
    /// Build state around a sync manager, deriving the rest from `config`.
    pub fn new(config: AppConfig, sync: Arc<SyncManager>) -> Self {
        Self {
            jwt_decoder: Arc::new(JwtDecoder::new(&config.auth)),
            ws_limiter: Arc::new(RateLimiter::from_rule(config.rate_limit.ws)),
            api_limiter: Arc::new(RateLimiter::from_rule(config.rate_limit.api)),
            config: Arc::new(config),
            sync,
            started_at: Instant::now(),
        }
    }
}
