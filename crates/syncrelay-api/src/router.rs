//! Route definitions for the SyncRelay HTTP API.
//!
//! REST routes are mounted under `/api/v1`, the WebSocket endpoint at `/ws`,
//! and the unauthenticated health check at `/health`.

use std::time::Duration;

use axum::{
    Router,
    extract::DefaultBodyLimit,
    middleware as axum_middleware,
    routing::{get, post},
};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::middleware;
use crate::middleware::cors::build_cors_layer;
use crate::state::AppState;

/// Build the complete Axum router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let config = state.config.clone();
    let server = &config.server;
    let request_timeout = Duration::from_secs(server.request_timeout_seconds.max(1));

    let api_routes = Router::new()
        .merge(event_routes())
        .merge(offline_routes())
        .merge(stats_routes())
        .layer(TimeoutLayer::new(request_timeout))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::rate_limit::api_rate_limit,
        ));

    let ws_routes = Router::new()
        .route("/ws", get(handlers::ws::ws_handler))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::rate_limit::ws_rate_limit,
        ));

    Router::new()
        .nest("/api/v1", api_routes)
        .merge(ws_routes)
        .route("/health", get(handlers::health::health))
        .layer(DefaultBodyLimit::max(server.max_body_bytes))
        .layer(axum_middleware::from_fn(middleware::logging::request_logging))
        .layer(TraceLayer::new_for_http())
        .layer(build_cors_layer(&server.cors))
        .with_state(state)
}

/// Event publishing
fn event_routes() -> Router<AppState> {
    Router::new()
        .route("/events", post(handlers::events::publish_event))
        .route("/events/batch", post(handlers::events::publish_batch))
        .route("/events/broadcast", post(handlers::events::broadcast))
}

/// Offline queue, scoped to the caller
fn offline_routes() -> Router<AppState> {
    Router::new()
        .route("/offline/messages", get(handlers::offline::list_messages))
        .route("/offline/count", get(handlers::offline::count))
        .route("/offline/ack", post(handlers::offline::ack))
        .route("/offline/ack/batch", post(handlers::offline::ack_batch))
}

/// Statistics and presence
fn stats_routes() -> Router<AppState> {
    Router::new()
        .route("/stats", get(handlers::stats::instance_stats))
        .route("/stats/pubsub", get(handlers::stats::pubsub_stats))
        .route("/online-users", get(handlers::stats::online_users))
        .route("/users/{user_id}/online", get(handlers::stats::user_online))
}
