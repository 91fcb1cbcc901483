//! # syncrelay-cache
//!
//! Shared-state backends for SyncRelay. Supports two modes:
//!
//! - **memory**: in-process bus, presence, and offline queue for a single
//!   node (and for tests that simulate several instances in one process)
//! - **redis**: Redis pub/sub for fan-out, sorted sets for presence and the
//!   offline queue, using the [redis](https://crates.io/crates/redis) crate
//!
//! The provider is selected at runtime based on configuration.

pub mod keys;
#[cfg(feature = "memory")]
pub mod memory;
pub mod provider;
#[cfg(feature = "redis-backend")]
pub mod redis;

pub use provider::Backends;
