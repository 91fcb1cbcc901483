//! Health check handler.

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;

use syncrelay_realtime::SyncState;

use crate::dto::response::{ApiResponse, HealthResponse};
use crate::state::AppState;

/// GET /health
///
/// Answers 503 once the instance stops accepting work, so load balancers
/// pull it out of rotation during a drain.
pub async fn health(State(state): State<AppState>) -> (StatusCode, Json<ApiResponse<HealthResponse>>) {
    let sync_state = state.sync.state();
    let running = sync_state == SyncState::Running;
    let status = if running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    let body = HealthResponse {
        status: if running { "ok" } else { "unavailable" },
        version: env!("CARGO_PKG_VERSION"),
        instance_id: state.sync.instance_id().to_string(),
        state: sync_state,
        uptime_seconds: state.started_at.elapsed().as_secs(),
        connections: state.sync.registry().count(),
        backends: state.sync.backend_health().await,
    };
    (status, Json(ApiResponse::ok(body)))
}
