//! Individual WebSocket connection handle.

use std::sync::OnceLock;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};

use syncrelay_core::types::ConnectionId;

use crate::message::types::ServerFrame;

/// Why the server closed a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    /// The outbound buffer filled up.
    SlowConsumer,
    /// The instance is shutting down.
    Draining,
    /// No client traffic within the idle timeout.
    IdleTimeout,
    /// The bearer token expired while connected.
    AuthExpired,
}

impl CloseReason {
    /// WebSocket close code sent to the client.
    pub fn code(self) -> u16 {
        match self {
            Self::Draining | Self::IdleTimeout => 1001,
            Self::SlowConsumer | Self::AuthExpired => 1008,
        }
    }

    /// Close-frame reason text.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SlowConsumer => "slow consumer",
            Self::Draining => "server draining",
            Self::IdleTimeout => "idle timeout",
            Self::AuthExpired => "token expired",
        }
    }
}

/// Outcome of pushing a frame into a connection's buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Frame queued.
    Sent,
    /// Buffer was full; the connection has been closed.
    SlowConsumer,
    /// The connection was already closed.
    Closed,
}

/// A handle to a single WebSocket connection.
///
/// Holds the bounded sender for pushing frames to the client's writer task
/// plus metadata about the connected user. Shared as `Arc<ConnectionHandle>`.
#[derive(Debug)]
pub struct ConnectionHandle {
    /// Unique connection ID
    pub id: ConnectionId,
    /// User who owns this connection
    pub user_id: String,
    /// Instance serving this connection
    pub instance_id: String,
    /// When the connection was established
    pub established_at: DateTime<Utc>,
    /// Last client activity, epoch milliseconds
    last_active_ms: AtomicI64,
    /// Sender for outbound frames
    sender: mpsc::Sender<ServerFrame>,
    /// Cancelled when the connection must close
    closed: CancellationToken,
    /// First close reason recorded
    close_reason: OnceLock<CloseReason>,
}

impl ConnectionHandle {
    /// Create a new connection handle
    pub fn new(
        user_id: impl Into<String>,
        instance_id: impl Into<String>,
        sender: mpsc::Sender<ServerFrame>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: ConnectionId::new(),
            user_id: user_id.into(),
            instance_id: instance_id.into(),
            established_at: now,
            last_active_ms: AtomicI64::new(now.timestamp_millis()),
            sender,
            closed: CancellationToken::new(),
            close_reason: OnceLock::new(),
        }
    }

    /// Push a frame without waiting.
    ///
    /// A full buffer closes the connection with [`CloseReason::SlowConsumer`].
    pub fn send(&self, frame: ServerFrame) -> SendOutcome {
        if !self.is_alive() {
            return SendOutcome::Closed;
        }
        match self.sender.try_send(frame) {
            Ok(()) => SendOutcome::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!(
                    conn_id = %self.id,
                    user_id = %self.user_id,
                    "Outbound buffer full, closing slow consumer"
                );
                self.close(CloseReason::SlowConsumer);
                SendOutcome::SlowConsumer
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.closed.cancel();
                SendOutcome::Closed
            }
        }
    }

    /// Check if connection is alive
    pub fn is_alive(&self) -> bool {
        !self.closed.is_cancelled()
    }

    /// Ask the connection to close. Only the first reason is kept.
    pub fn close(&self, reason: CloseReason) {
        let _ = self.close_reason.set(reason);
        self.closed.cancel();
    }

    /// The reason passed to the first [`close`](Self::close) call.
    pub fn close_reason(&self) -> Option<CloseReason> {
        self.close_reason.get().copied()
    }

    /// Resolves once the connection has been closed.
    pub fn closed(&self) -> WaitForCancellationFuture<'_> {
        self.closed.cancelled()
    }

    /// Record client activity.
    pub fn touch(&self) {
        self.last_active_ms
            .store(Utc::now().timestamp_millis(), Ordering::Relaxed);
    }

    /// Last client activity.
    pub fn last_active_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(self.last_active_ms.load(Ordering::Relaxed))
            .unwrap_or(self.established_at)
    }

    /// Time since the last client activity.
    pub fn idle_for(&self) -> Duration {
        (Utc::now() - self.last_active_at())
            .to_std()
            .unwrap_or(Duration::ZERO)
    }

    /// Serializable view of this session.
    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            instance_id: self.instance_id.clone(),
            established_at: self.established_at,
            last_active_at: self.last_active_at(),
            alive: self.is_alive(),
        }
    }
}

/// One live session as reported by the presence endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    /// Instance holding the socket.
    pub instance_id: String,
    pub established_at: DateTime<Utc>,
    pub last_active_at: DateTime<Utc>,
    /// False once the server has closed the session.
    pub alive: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ping() -> ServerFrame {
        ServerFrame::Ping { timestamp: 0 }
    }

    #[tokio::test]
    async fn test_full_buffer_closes_connection() {
        let (tx, mut rx) = mpsc::channel(1);
        let handle = ConnectionHandle::new("u1", "node-a", tx);

        assert_eq!(handle.send(ping()), SendOutcome::Sent);
        assert_eq!(handle.send(ping()), SendOutcome::SlowConsumer);
        assert!(!handle.is_alive());
        assert_eq!(handle.close_reason(), Some(CloseReason::SlowConsumer));

        assert!(rx.recv().await.is_some());
        assert_eq!(handle.send(ping()), SendOutcome::Closed);
    }

    #[tokio::test]
    async fn test_first_close_reason_wins() {
        let (tx, _rx) = mpsc::channel(4);
        let handle = ConnectionHandle::new("u1", "node-a", tx);
        handle.close(CloseReason::Draining);
        handle.close(CloseReason::SlowConsumer);
        handle.closed().await;
        assert_eq!(handle.close_reason(), Some(CloseReason::Draining));
        assert_eq!(CloseReason::Draining.code(), 1001);
    }

    #[test]
    fn test_dropped_receiver_marks_closed() {
        let (tx, rx) = mpsc::channel(4);
        let handle = ConnectionHandle::new("u1", "node-a", tx);
        drop(rx);
        assert_eq!(handle.send(ping()), SendOutcome::Closed);
        assert!(!handle.is_alive());
        assert_eq!(handle.close_reason(), None);
    }
}
