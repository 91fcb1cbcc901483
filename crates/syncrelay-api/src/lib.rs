//! # syncrelay-api
//!
//! HTTP API layer for SyncRelay built on Axum.
//!
//! Provides the event, offline-queue and stats endpoints, the WebSocket
//! upgrade, middleware (rate limiting, CORS, logging), extractors, DTOs, and
//! error mapping.

pub mod app;
pub mod dto;
pub mod error;
pub mod extractors;
pub mod handlers;
pub mod middleware;
pub mod router;
pub mod state;

pub use app::{build_app, run_server};
pub use error::{ApiError, ApiResult};
pub use state::AppState;
