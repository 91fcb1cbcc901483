//! Request DTOs with validation.

use serde::{Deserialize, Serialize};
use validator::{Validate, ValidationError};

use syncrelay_core::error::AppError;
use syncrelay_core::types::{MessageType, OfflineMessageId, SyncMessage};

/// Largest accepted event payload, in serialized bytes.
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024;


/// Run `validator` checks and map failures to a validation error.
pub fn validate_request<T: Validate>(req: &T) -> Result<(), AppError> {
    req.validate()
        .map_err(|e| AppError::validation(e.to_string()))
}

fn validate_payload_size(payload: &serde_json::Value) -> Result<(), ValidationError> {
    let size = serde_json::to_vec(payload).map(|b| b.len()).unwrap_or(usize::MAX);
    if size > MAX_PAYLOAD_BYTES {
        let mut err = ValidationError::new("payload_too_large");
        err.message = Some(format!("Payload is {size} bytes; limit is {MAX_PAYLOAD_BYTES}").into());
        return Err(err);
    }
    Ok(())
}

fn build_message(
    id: Option<String>,
    message_type: &str,
    target_user_id: Option<&str>,
    payload: serde_json::Value,
) -> SyncMessage {
    let mut message = match target_user_id {
        Some(user) => SyncMessage::new(MessageType::from(message_type.to_string()), user, payload),
        None => SyncMessage::broadcast(MessageType::from(message_type.to_string()), payload),
    };
    if let Some(id) = id {
        message.id = id;
    }
    message
}

/// Single-user publish request.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct PublishEventRequest {
    /// Caller-chosen event ID; generated when absent.
    #[validate(length(min = 1, max = 128))]
    pub id: Option<String>,
    /// Event type.
    #[serde(rename = "type")]
    #[validate(length(min = 1, max = 64, message = "Event type is required"))]
    pub message_type: String,
    /// Recipient; defaults to the caller.
    #[validate(length(min = 1, max = 256))]
    pub target_user_id: Option<String>,
    /// Opaque event body.
    #[serde(default)]
    #[validate(custom(function = "validate_payload_size"))]
    pub payload: serde_json::Value,
}

impl PublishEventRequest {
    /// Build the event addressed to `target`.
    pub fn into_message(self, target: &str) -> SyncMessage {
        build_message(self.id, &self.message_type, Some(target), self.payload)
    }
}

/// Multi-user publish request.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BatchEventRequest {
    /// Caller-chosen event ID; generated when absent.
    #[validate(length(min = 1, max = 128))]
    pub id: Option<String>,
    /// Event type.
    #[serde(rename = "type")]
    #[validate(length(min = 1, max = 64, message = "Event type is required"))]
    pub message_type: String,
    /// Recipients.
    #[validate(length(min = 1, max = 1000, message = "Between 1 and 1000 user IDs required"))]
    pub user_ids: Vec<String>,
    /// Opaque event body.
    #[serde(default)]
    #[validate(custom(function = "validate_payload_size"))]
    pub payload: serde_json::Value,
}

impl BatchEventRequest {
    /// Build the shared event. The per-user target is set at delivery.
    pub fn to_message(&self) -> SyncMessage {
        let first = self.user_ids.first().map(String::as_str);
        build_message(self.id.clone(), &self.message_type, first, self.payload.clone())
    }
}

/// Global publish request.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct BroadcastRequest {
    /// Caller-chosen event ID; generated when absent.
    #[validate(length(min = 1, max = 128))]
    pub id: Option<String>,
    /// Event type; `broadcast` when absent.
    #[serde(rename = "type", default = "default_broadcast_type")]
    #[validate(length(min = 1, max = 64))]
    pub message_type: String,
    /// Opaque event body.
    #[serde(default)]
    #[validate(custom(function = "validate_payload_size"))]
    pub payload: serde_json::Value,
}

fn default_broadcast_type() -> String {
    MessageType::Broadcast.as_str().to_string()
}

impl BroadcastRequest {
    /// Build the broadcast event.
    pub fn into_message(self) -> SyncMessage {
        build_message(self.id, &self.message_type, None, self.payload)
    }
}

/// Acknowledge one offline entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AckRequest {
    /// Offline entry ID.
    pub id: OfflineMessageId,
}

/// Acknowledge several offline entries.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct AckBatchRequest {
    /// Offline entry IDs.
    #[validate(length(min = 1, max = 1000))]
    pub ids: Vec<OfflineMessageId>,
}

/// Query parameters for the WebSocket upgrade.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct WsQuery {
    /// Access token, for clients that cannot set headers.
    pub token: Option<String>,
}
