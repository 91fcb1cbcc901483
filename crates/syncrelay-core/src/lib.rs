//! # syncrelay-core
//!
//! Core crate for SyncRelay. Contains configuration schemas, the sync
//! message model, typed identifiers, the backend traits (bus, offline
//! queue, presence), and the unified error system.
//!
//! This crate has **no** internal dependencies on other SyncRelay crates.

pub mod config;
pub mod error;
pub mod result;
pub mod traits;
pub mod types;

pub use error::AppError;
pub use result::AppResult;
