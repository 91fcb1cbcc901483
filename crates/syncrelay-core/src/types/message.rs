//! The event envelope carried between clients, instances, and the offline queue.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of a sync event.
///
/// Known kinds serialize to their snake_case name; any other string is kept
/// verbatim in [`MessageType::Custom`] so producers can add kinds without a
/// relay release.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageType {
    /// A track was added to favorites.
    FavoriteAdded,
    /// A track was removed from favorites.
    FavoriteRemoved,
    /// A play-history entry was recorded.
    PlayHistoryAdded,
    /// A playlist was created.
    PlaylistCreated,
    /// A playlist was renamed or its entries changed.
    PlaylistUpdated,
    /// A playlist was deleted.
    PlaylistDeleted,
    /// A global announcement.
    Broadcast,
    /// Any kind the relay does not know about.
    Custom(String),
}

impl MessageType {
    /// Wire name of this kind.
    pub fn as_str(&self) -> &str {
        match self {
            Self::FavoriteAdded => "favorite_added",
            Self::FavoriteRemoved => "favorite_removed",
            Self::PlayHistoryAdded => "play_history_added",
            Self::PlaylistCreated => "playlist_created",
            Self::PlaylistUpdated => "playlist_updated",
            Self::PlaylistDeleted => "playlist_deleted",
            Self::Broadcast => "broadcast",
            Self::Custom(name) => name,
        }
    }
}

impl From<String> for MessageType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "favorite_added" => Self::FavoriteAdded,
            "favorite_removed" => Self::FavoriteRemoved,
            "play_history_added" => Self::PlayHistoryAdded,
            "playlist_created" => Self::PlaylistCreated,
            "playlist_updated" => Self::PlaylistUpdated,
            "playlist_deleted" => Self::PlaylistDeleted,
            "broadcast" => Self::Broadcast,
            _ => Self::Custom(value),
        }
    }
}

impl From<MessageType> for String {
    fn from(value: MessageType) -> Self {
        match value {
            MessageType::Custom(name) => name,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single sync event.
///
/// Values are never mutated after construction; [`SyncMessage::stamped`]
/// and [`SyncMessage::for_user`] return modified copies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMessage {
    /// Event ID, supplied by the producer or generated.
    pub id: String,
    /// Event kind.
    #[serde(rename = "type")]
    pub message_type: MessageType,
    /// Recipient; `None` for broadcasts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_user_id: Option<String>,
    /// Opaque producer-owned payload.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Creation time.
    pub timestamp: DateTime<Utc>,
    /// Instance that put the event on the bus. Empty until published.
    #[serde(default)]
    pub origin_instance_id: String,
}

impl SyncMessage {
    /// Create a user-targeted event with a generated ID.
    pub fn new(
        message_type: MessageType,
        target_user_id: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type,
            target_user_id: Some(target_user_id.into()),
            payload,
            timestamp: Utc::now(),
            origin_instance_id: String::new(),
        }
    }

    /// Create a broadcast event with a generated ID.
    pub fn broadcast(message_type: MessageType, payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            message_type,
            target_user_id: None,
            payload,
            timestamp: Utc::now(),
            origin_instance_id: String::new(),
        }
    }

    /// Copy of this event carrying the given origin instance.
    pub fn stamped(&self, instance_id: &str) -> Self {
        Self {
            origin_instance_id: instance_id.to_string(),
            ..self.clone()
        }
    }

    /// Copy of this event addressed to `user_id`.
    pub fn for_user(&self, user_id: &str) -> Self {
        Self {
            target_user_id: Some(user_id.to_string()),
            ..self.clone()
        }
    }

    /// Whether the event has no single recipient.
    pub fn is_broadcast(&self) -> bool {
        self.target_user_id.is_none()
    }
}
