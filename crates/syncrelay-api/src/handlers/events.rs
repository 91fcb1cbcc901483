//! Event publishing handlers.

use axum::Json;
use axum::extract::State;

use syncrelay_realtime::manager::{BatchDeliveryReport, BroadcastReport, DeliveryReport};

use crate::dto::request::{
    BatchEventRequest, BroadcastRequest, PublishEventRequest, validate_request,
};
use crate::dto::response::ApiResponse;
use crate::error::ApiResult;
use crate::extractors::AuthUser;
use crate::state::AppState;

/// POST /api/v1/events
///
/// Targets the caller unless `target_user_id` is given.
pub async fn publish_event(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<PublishEventRequest>,
) -> ApiResult<Json<ApiResponse<DeliveryReport>>> {
    validate_request(&req)?;

    let target = req
        .target_user_id
        .clone()
        .unwrap_or_else(|| auth.user_id.clone());
    let message = req.into_message(&target);

    tracing::debug!(
        sender = %auth.user_id,
        target = %target,
        message_id = %message.id,
        message_type = %message.message_type,
        "Publishing event"
    );

    let report = state.sync.deliver(&target, &message).await?;
    Ok(Json(ApiResponse::ok(report)))
}

/// POST /api/v1/events/batch
pub async fn publish_batch(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<BatchEventRequest>,
) -> ApiResult<Json<ApiResponse<BatchDeliveryReport>>> {
    validate_request(&req)?;

    let message = req.to_message();
    tracing::debug!(
        sender = %auth.user_id,
        targets = req.user_ids.len(),
        message_id = %message.id,
        "Publishing batch event"
    );

    let report = state.sync.deliver_batch(&req.user_ids, &message).await?;
    if report.failed_count() > 0 {
        tracing::warn!(
            message_id = %report.message_id,
            failed = report.failed_count(),
            "Batch event partially undelivered"
        );
    }
    Ok(Json(ApiResponse::ok(report)))
}

/// POST /api/v1/events/broadcast
pub async fn broadcast(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(req): Json<BroadcastRequest>,
) -> ApiResult<Json<ApiResponse<BroadcastReport>>> {
    validate_request(&req)?;

    let message = req.into_message();
    tracing::info!(
        sender = %auth.user_id,
        message_id = %message.id,
        message_type = %message.message_type,
        "Broadcasting event"
    );

    let report = state.sync.broadcast(&message).await?;
    Ok(Json(ApiResponse::ok(report)))
}
