//! Inbound and outbound WebSocket frame definitions.

use serde::{Deserialize, Serialize};

use syncrelay_core::types::{
    AckBatchReport, ConnectionId, OfflineMessage, OfflineMessageId, SyncMessage,
};

/// Frames sent by the client to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Pong response to server ping.
    Pong {
        /// Echoed timestamp.
        #[serde(default)]
        timestamp: i64,
    },
    /// Acknowledge offline entries.
    Ack {
        /// Offline entry IDs.
        ids: Vec<OfflineMessageId>,
    },
    /// Request a page of pending offline entries.
    FetchOffline {
        /// Entries to skip.
        #[serde(default)]
        offset: usize,
        /// Page size; the configured default when absent.
        #[serde(default)]
        limit: Option<usize>,
    },
}

/// Frames sent by the server to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Handshake completed.
    Connected {
        /// Session ID.
        connection_id: ConnectionId,
        /// Serving instance.
        instance_id: String,
        /// Unacknowledged offline entries waiting for this user.
        pending_offline: u64,
    },
    /// A sync event.
    Event {
        /// The event.
        message: SyncMessage,
    },
    /// Keepalive ping.
    Ping {
        /// Server time in epoch milliseconds.
        timestamp: i64,
    },
    /// A page of offline entries.
    OfflineMessages {
        /// Entries, oldest first.
        messages: Vec<OfflineMessage>,
    },
    /// Result of an ack request, one list entry per requested ID.
    Acked {
        /// Entries newly acknowledged.
        count: u64,
        #[serde(flatten)]
        report: AckBatchReport,
    },
    /// A non-fatal error.
    Error {
        /// Error code.
        code: String,
        /// Error message.
        message: String,
    },
}

impl ServerFrame {
    /// Wrap an event.
    pub fn event(message: SyncMessage) -> Self {
        Self::Event { message }
    }

    /// Reply to an ack request.
    pub fn acked(report: AckBatchReport) -> Self {
        Self::Acked {
            count: report.acked_count(),
            report,
        }
    }

    /// Build an error frame.
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use syncrelay_core::types::MessageType;

    #[test]
    fn test_event_frame_shape() {
        let msg = SyncMessage::new(MessageType::FavoriteAdded, "u1", json!({"track": 3}));
        let value = serde_json::to_value(ServerFrame::event(msg)).expect("serialize");
        assert_eq!(value["type"], "event");
        assert_eq!(value["message"]["type"], "favorite_added");
        assert_eq!(value["message"]["payload"]["track"], 3);
    }

    #[test]
    fn test_client_frames_parse() {
        let frame: ClientFrame =
            serde_json::from_str(r#"{"type":"fetch_offline"}"#).expect("parse");
        assert!(matches!(
            frame,
            ClientFrame::FetchOffline {
                offset: 0,
                limit: None
            }
        ));

        let id = OfflineMessageId::new();
        let raw = format!(r#"{{"type":"ack","ids":["{id}"]}}"#);
        match serde_json::from_str::<ClientFrame>(&raw).expect("parse") {
            ClientFrame::Ack { ids } => assert_eq!(ids, vec![id]),
            other => panic!("unexpected frame: {other:?}"),
        }

        assert!(serde_json::from_str::<ClientFrame>(r#"{"type":"subscribe"}"#).is_err());
    }

    #[test]
    fn test_acked_frame_lists_each_id() {
        let (acked, noop) = (OfflineMessageId::new(), OfflineMessageId::new());
        let report = AckBatchReport {
            acked: vec![acked],
            noop: vec![noop],
            failed: Vec::new(),
        };
        let value = serde_json::to_value(ServerFrame::acked(report)).expect("serialize");
        assert_eq!(value["type"], "acked");
        assert_eq!(value["count"], 1);
        assert_eq!(value["acked"][0], acked.to_string());
        assert_eq!(value["noop"][0], noop.to_string());
        assert_eq!(value["failed"], json!([]));
    }
}
