//! Instance statistics and presence queries.

use axum::Json;
use axum::extract::{Path, State};

use syncrelay_realtime::manager::{SyncStats, UserPresence};

use crate::dto::response::{ApiResponse, OnlineUsersResponse, PubSubStatsResponse};
use crate::error::ApiResult;
use crate::extractors::AuthUser;
use crate::state::AppState;

/// GET /api/v1/stats
pub async fn instance_stats(
    State(state): State<AppState>,
    _auth: AuthUser,
) -> Json<ApiResponse<SyncStats>> {
    Json(ApiResponse::ok(state.sync.stats()))
}

/// GET /api/v1/stats/pubsub
pub async fn pubsub_stats(
    State(state): State<AppState>,
    _auth: AuthUser,
) -> Json<ApiResponse<PubSubStatsResponse>> {
    let stats = state.sync.stats();
    Json(ApiResponse::ok(PubSubStatsResponse {
        publisher: stats.publisher,
        subscriber: stats.subscriber,
    }))
}

/// GET /api/v1/online-users
pub async fn online_users(
    State(state): State<AppState>,
    _auth: AuthUser,
) -> Json<ApiResponse<OnlineUsersResponse>> {
    let users = state.sync.online_users();
    let count = users.len();
    Json(ApiResponse::ok(OnlineUsersResponse { users, count }))
}

/// GET /api/v1/users/{user_id}/online
pub async fn user_online(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(user_id): Path<String>,
) -> ApiResult<Json<ApiResponse<UserPresence>>> {
    let presence = state.sync.user_presence(&user_id).await?;
    Ok(Json(ApiResponse::ok(presence)))
}
