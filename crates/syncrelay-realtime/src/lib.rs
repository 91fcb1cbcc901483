//! # syncrelay-realtime
//!
//! Real-time sync engine for SyncRelay. Provides:
//!
//! - Connection registry with a per-instance capacity cap and slow-consumer
//!   eviction
//! - Bus publisher with bounded retry and in-flight draining
//! - Bus subscriber with echo suppression and ordered handler dispatch
//! - Offline delivery for users with no live session anywhere
//! - Instance lifecycle (`Initializing -> Running -> Draining -> Stopped`)

pub mod bus;
pub mod connection;
pub mod maintenance;
pub mod manager;
pub mod message;
pub mod metrics;

pub use bus::{Publisher, Subscriber};
pub use connection::ConnectionRegistry;
pub use manager::{SyncManager, SyncState};
