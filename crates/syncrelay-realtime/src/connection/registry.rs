//! Connection registry: every live session on this instance, indexed by user.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use dashmap::DashMap;
use tracing::{debug, info, warn};

use syncrelay_core::error::AppError;
use syncrelay_core::result::AppResult;
use syncrelay_core::types::ConnectionId;

use crate::message::types::ServerFrame;

use super::handle::{CloseReason, ConnectionHandle, SendOutcome};

/// Thread-safe registry of all live WebSocket connections on this instance.
///
/// Both maps are [`DashMap`]s, so unrelated users hash to different shards
/// and never contend. The active count is reserved with a compare-and-swap
/// before insertion, which keeps concurrent registrations under the cap.
#[derive(Debug)]
pub struct ConnectionRegistry {
    /// User ID → list of connection handles (one user can have multiple devices).
    by_user: DashMap<String, Vec<Arc<ConnectionHandle>>>,
    /// Connection ID → connection handle for direct lookup.
    by_id: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    /// Registered connections, including reservations in progress.
    active: AtomicUsize,
    /// Maximum concurrent connections.
    max_connections: usize,
    /// Connections closed because their buffer filled up.
    slow_consumer_closes: AtomicU64,
}

impl ConnectionRegistry {
    /// Creates a new empty registry.
    pub fn new(max_connections: usize) -> Self {
        Self {
            by_user: DashMap::new(),
            by_id: DashMap::new(),
            active: AtomicUsize::new(0),
            max_connections,
            slow_consumer_closes: AtomicU64::new(0),
        }
    }

    /// Adds a connection, keyed by the handle's user ID.
    ///
    /// Fails with `CapacityExceeded` when the instance is full; the count is
    /// left unchanged in that case.
    pub fn register(&self, handle: Arc<ConnectionHandle>) -> AppResult<ConnectionId> {
        self.active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < self.max_connections).then_some(current + 1)
            })
            .map_err(|current| {
                warn!(
                    user_id = %handle.user_id,
                    active = current,
                    max = self.max_connections,
                    "Connection rejected: instance at capacity"
                );
                AppError::capacity_exceeded(format!(
                    "Instance at capacity ({} connections)",
                    self.max_connections
                ))
            })?;

        let id = handle.id;
        self.by_id.insert(id, handle.clone());
        self.by_user
            .entry(handle.user_id.clone())
            .or_default()
            .push(handle.clone());

        info!(conn_id = %id, user_id = %handle.user_id, "Connection registered");
        Ok(id)
    }

    /// Removes a connection. Returns the handle if it was registered.
    pub fn unregister(&self, conn_id: &ConnectionId) -> Option<Arc<ConnectionHandle>> {
        let (_, handle) = self.by_id.remove(conn_id)?;
        self.active.fetch_sub(1, Ordering::AcqRel);

        if let Some(mut connections) = self.by_user.get_mut(&handle.user_id) {
            connections.retain(|c| c.id != *conn_id);
        }
        self.by_user
            .remove_if(&handle.user_id, |_, connections| connections.is_empty());

        info!(conn_id = %conn_id, user_id = %handle.user_id, "Connection unregistered");
        Some(handle)
    }

    /// Gets all connections for a user (possibly empty).
    pub fn local_sessions_for(&self, user_id: &str) -> Vec<Arc<ConnectionHandle>> {
        self.by_user
            .get(user_id)
            .map(|entry| entry.value().clone())
            .unwrap_or_default()
    }

    /// Returns total number of live connections.
    pub fn count(&self) -> usize {
        self.active.load(Ordering::Acquire)
    }

    /// Returns number of unique connected users.
    pub fn user_count(&self) -> usize {
        self.by_user.len()
    }

    /// Configured connection cap.
    pub fn max_connections(&self) -> usize {
        self.max_connections
    }

    /// Returns all connected user IDs.
    pub fn all_user_ids(&self) -> Vec<String> {
        self.by_user.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Connections closed as slow consumers so far.
    pub fn slow_consumer_closes(&self) -> u64 {
        self.slow_consumer_closes.load(Ordering::Relaxed)
    }

    /// Push a frame to every session of `user_id`. Returns how many accepted it.
    pub fn send_to_user(&self, user_id: &str, frame: &ServerFrame) -> usize {
        // Clone the handles out so no shard lock is held while sending.
        let sessions = self.local_sessions_for(user_id);
        self.push(&sessions, frame)
    }

    /// Push a frame to every local connection. Returns how many accepted it.
    pub fn send_to_all(&self, frame: &ServerFrame) -> usize {
        let sessions: Vec<Arc<ConnectionHandle>> = self
            .by_id
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.push(&sessions, frame)
    }

    /// Close every connection with the given reason.
    pub fn close_all(&self, reason: CloseReason) -> usize {
        let mut closed = 0;
        for entry in self.by_id.iter() {
            entry.value().close(reason);
            closed += 1;
        }
        info!(closed, reason = reason.as_str(), "Closed all connections");
        closed
    }

    fn push(&self, sessions: &[Arc<ConnectionHandle>], frame: &ServerFrame) -> usize {
        let mut delivered = 0;
        for handle in sessions {
            match handle.send(frame.clone()) {
                SendOutcome::Sent => delivered += 1,
                SendOutcome::SlowConsumer => {
                    self.slow_consumer_closes.fetch_add(1, Ordering::Relaxed);
                }
                SendOutcome::Closed => {
                    debug!(conn_id = %handle.id, "Skipping closed connection");
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use syncrelay_core::error::ErrorKind;
    use tokio::sync::mpsc;

    fn handle(user: &str, buffer: usize) -> (Arc<ConnectionHandle>, mpsc::Receiver<ServerFrame>) {
        let (tx, rx) = mpsc::channel(buffer);
        (Arc::new(ConnectionHandle::new(user, "node-a", tx)), rx)
    }

    fn ping() -> ServerFrame {
        ServerFrame::Ping { timestamp: 1 }
    }

    #[test]
    fn test_capacity_cap_leaves_count_unchanged() {
        let registry = ConnectionRegistry::new(2);
        let (a, _ra) = handle("u1", 4);
        let (b, _rb) = handle("u2", 4);
        let (c, _rc) = handle("u3", 4);

        registry.register(a).expect("first");
        registry.register(b).expect("second");
        let err = registry.register(c).unwrap_err();

        assert_eq!(err.kind, ErrorKind::CapacityExceeded);
        assert_eq!(registry.count(), 2);
        assert!(registry.local_sessions_for("u3").is_empty());
    }

    #[test]
    fn test_multi_device_sessions() {
        let registry = ConnectionRegistry::new(10);
        let (phone, mut phone_rx) = handle("u1", 4);
        let (laptop, mut laptop_rx) = handle("u1", 4);
        let phone_id = registry.register(phone).expect("phone");
        registry.register(laptop).expect("laptop");

        assert_eq!(registry.user_count(), 1);
        assert_eq!(registry.send_to_user("u1", &ping()), 2);
        assert!(phone_rx.try_recv().is_ok());
        assert!(laptop_rx.try_recv().is_ok());

        registry.unregister(&phone_id).expect("registered");
        assert_eq!(registry.local_sessions_for("u1").len(), 1);
        assert_eq!(registry.count(), 1);
        assert!(registry.unregister(&phone_id).is_none());
        assert_eq!(registry.count(), 1);
    }

    #[test]
    fn test_last_session_removes_user() {
        let registry = ConnectionRegistry::new(10);
        let (h, _rx) = handle("u1", 4);
        let id = registry.register(h).expect("register");
        registry.unregister(&id);
        assert!(registry.all_user_ids().is_empty());
        assert_eq!(registry.send_to_user("u1", &ping()), 0);
    }

    #[test]
    fn test_slow_consumer_is_closed_not_blocking() {
        let registry = ConnectionRegistry::new(10);
        let (slow, _slow_rx) = handle("u1", 1);
        let (fast, mut fast_rx) = handle("u2", 8);
        registry.register(slow.clone()).expect("slow");
        registry.register(fast).expect("fast");

        assert_eq!(registry.send_to_all(&ping()), 2);
        assert_eq!(registry.send_to_all(&ping()), 1);

        assert!(!slow.is_alive());
        assert_eq!(slow.close_reason(), Some(CloseReason::SlowConsumer));
        assert_eq!(registry.slow_consumer_closes(), 1);
        assert!(fast_rx.try_recv().is_ok());
        assert!(fast_rx.try_recv().is_ok());
    }

    #[test]
    fn test_close_all() {
        let registry = ConnectionRegistry::new(10);
        let (a, _ra) = handle("u1", 4);
        let (b, _rb) = handle("u2", 4);
        registry.register(a.clone()).expect("a");
        registry.register(b.clone()).expect("b");

        assert_eq!(registry.close_all(CloseReason::Draining), 2);
        assert_eq!(a.close_reason(), Some(CloseReason::Draining));
        assert!(!b.is_alive());
    }

    #[test]
    fn test_concurrent_registration_respects_cap() {
        let registry = Arc::new(ConnectionRegistry::new(50));
        let threads: Vec<_> = (0..8)
            .map(|t| {
                let registry = registry.clone();
                std::thread::spawn(move || {
                    let mut receivers = Vec::new();
                    for i in 0..20 {
                        let (h, rx) = handle(&format!("u{t}-{i}"), 1);
                        if registry.register(h).is_ok() {
                            receivers.push(rx);
                        }
                    }
                    receivers
                })
            })
            .collect();

        let accepted: usize = threads
            .into_iter()
            .map(|t| t.join().expect("thread").len())
            .sum();
        assert_eq!(accepted, 50);
        assert_eq!(registry.count(), 50);
    }
}
