//! Ping/idle heartbeat for WebSocket keepalive.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::time;

use super::handle::{CloseReason, ConnectionHandle, SendOutcome};
use crate::message::types::ServerFrame;

/// Heartbeat configuration
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatConfig {
    /// Interval between pings
    pub ping_interval: Duration,
    /// Client silence after which the connection is closed
    pub idle_timeout: Duration,
}

/// Run heartbeat loop for a connection.
///
/// Sends periodic pings and closes the connection once the client has been
/// silent for longer than the idle timeout. Ends when the connection closes.
pub async fn run_heartbeat(handle: Arc<ConnectionHandle>, config: HeartbeatConfig) {
    let mut interval = time::interval(config.ping_interval);
    interval.set_missed_tick_behavior(time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    interval.tick().await;

    loop {
        tokio::select! {
            _ = handle.closed() => break,
            _ = interval.tick() => {}
        }

        let idle = handle.idle_for();
        if idle > config.idle_timeout {
            tracing::warn!(
                conn_id = %handle.id,
                user_id = %handle.user_id,
                idle_secs = idle.as_secs(),
                "Heartbeat timeout"
            );
            handle.close(CloseReason::IdleTimeout);
            break;
        }

        let ping = ServerFrame::Ping {
            timestamp: Utc::now().timestamp_millis(),
        };
        if handle.send(ping) != SendOutcome::Sent {
            tracing::debug!(conn_id = %handle.id, "Ping send failed");
            break;
        }
    }

    tracing::debug!(conn_id = %handle.id, "Heartbeat loop ended");
}
