//! Fixed-window rate limiter and its middleware.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{ConnectInfo, Request, State};
use axum::http::HeaderValue;
use axum::http::header::RETRY_AFTER;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use syncrelay_core::config::LimitRule;
use syncrelay_core::error::AppError;

use crate::error::ApiError;
use crate::state::AppState;

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Request admitted.
    Allowed,
    /// Window exhausted; retry after the given delay.
    Limited { retry_after: Duration },
}

impl RateDecision {
    /// Whether the request was admitted.
    pub fn is_allowed(self) -> bool {
        matches!(self, Self::Allowed)
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    count: u32,
}

/// In-memory fixed-window limiter keyed by client.
///
/// Windows live in a [`DashMap`], so checks for different keys never
/// contend and a check never awaits.
#[derive(Debug)]
pub struct RateLimiter {
    /// Key → current window.
    windows: DashMap<String, Window>,
    /// Requests admitted per window.
    max_requests: u32,
    /// Window length.
    window: Duration,
}

impl RateLimiter {
    /// Creates a limiter admitting `max_requests` per `window`.
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            max_requests,
            window,
        }
    }

    /// Creates a limiter from a configured rule.
    pub fn from_rule(rule: LimitRule) -> Self {
        Self::new(rule.max_requests, Duration::from_secs(rule.window_seconds.max(1)))
    }

    /// Admit or reject one request for `key`.
    pub fn allow(&self, key: &str) -> bool {
        self.check(key).is_allowed()
    }

    /// Like [`allow`](Self::allow) but reports the retry delay.
    pub fn check(&self, key: &str) -> RateDecision {
        self.check_at(key, Instant::now())
    }

    /// Check against an explicit clock reading.
    pub fn check_at(&self, key: &str, now: Instant) -> RateDecision {
        let mut entry = self.windows.entry(key.to_string()).or_insert(Window {
            started: now,
            count: 0,
        });

        if now.saturating_duration_since(entry.started) >= self.window {
            entry.started = now;
            entry.count = 0;
        }

        if entry.count < self.max_requests {
            entry.count += 1;
            RateDecision::Allowed
        } else {
            let elapsed = now.saturating_duration_since(entry.started);
            RateDecision::Limited {
                retry_after: self.window.saturating_sub(elapsed),
            }
        }
    }

    /// Drop windows that have expired. Returns how many were removed.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    /// [`cleanup`](Self::cleanup) against an explicit clock reading.
    pub fn cleanup_at(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, w| now.saturating_duration_since(w.started) < self.window);
        before.saturating_sub(self.windows.len())
    }

    /// Number of tracked keys.
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}

/// Run [`RateLimiter::cleanup`] on every limiter each `interval` until cancelled.
pub async fn run_cleanup(
    limiters: Vec<Arc<RateLimiter>>,
    interval: Duration,
    token: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = ticker.tick() => {
                let removed: usize = limiters.iter().map(|l| l.cleanup()).sum();
                if removed > 0 {
                    tracing::debug!(removed, "Expired rate-limit windows reclaimed");
                }
            }
        }
    }
}

/// Client key: first `X-Forwarded-For` hop, else the peer address.
pub fn client_key(request: &Request) -> String {
    let forwarded = request
        .headers()
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());

    if let Some(ip) = forwarded {
        return ip.to_string();
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Limits `/api/v1` requests.
pub async fn api_rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    enforce(&state.api_limiter, request, next).await
}

/// Limits WebSocket upgrades.
pub async fn ws_rate_limit(State(state): State<AppState>, request: Request, next: Next) -> Response {
    enforce(&state.ws_limiter, request, next).await
}

async fn enforce(limiter: &RateLimiter, request: Request, next: Next) -> Response {
    let key = client_key(&request);
    match limiter.check(&key) {
        RateDecision::Allowed => next.run(request).await,
        RateDecision::Limited { retry_after } => {
            let secs = retry_after.as_secs().max(1);
            tracing::warn!(
                client = %key,
                path = %request.uri().path(),
                retry_after_secs = secs,
                "Rate limit exceeded"
            );
            let mut response =
                ApiError(AppError::rate_limited("Too many requests")).into_response();
            response
                .headers_mut()
                .insert(RETRY_AFTER, HeaderValue::from(secs));
            response
        }
    }
}
