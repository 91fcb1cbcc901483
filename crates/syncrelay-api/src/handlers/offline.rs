//! Offline queue handlers. Every route is scoped to the caller.

use axum::Json;
use axum::extract::{Query, State};

use syncrelay_core::types::OfflineMessage;

use crate::dto::request::{AckBatchRequest, AckRequest, validate_request};
use crate::dto::response::{AckBatchResponse, AckResponse, ApiResponse, CountResponse};
use crate::error::ApiResult;
use crate::extractors::{AuthUser, OffsetParams};
use crate::state::AppState;

/// GET /api/v1/offline/messages?offset=&limit=
pub async fn list_messages(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(params): Query<OffsetParams>,
) -> ApiResult<Json<ApiResponse<Vec<OfflineMessage>>>> {
    let messages = state
        .sync
        .fetch_offline(&auth.user_id, params.offset, params.limit)
        .await?;
    Ok(Json(ApiResponse::ok(messages)))
}

/// GET /api/v1/offline/count
pub async fn count(
    State(state): State<AppState>,
    auth: AuthUser,
) -> ApiResult<Json<ApiResponse<CountResponse>>> {
    let count = state.sync.offline_count(&auth.user_id).await?;
    Ok(Json(ApiResponse::ok(CountResponse { count })))
}

/// POST /api/v1/offline/ack
pub async fn ack(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<AckRequest>,
) -> ApiResult<Json<ApiResponse<AckResponse>>> {
    let acknowledged = state.sync.ack(&auth.user_id, req.id).await?;
    Ok(Json(ApiResponse::ok(AckResponse { acknowledged })))
}

/// POST /api/v1/offline/ack/batch
pub async fn ack_batch(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<AckBatchRequest>,
) -> ApiResult<Json<ApiResponse<AckBatchResponse>>> {
    validate_request(&req)?;
    let report = state.sync.ack_batch(&auth.user_id, &req.ids).await;
    Ok(Json(ApiResponse::ok(AckBatchResponse::from(report))))
}
