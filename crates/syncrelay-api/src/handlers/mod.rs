//! HTTP and WebSocket handlers.

pub mod events;
pub mod health;
pub mod offline;
pub mod stats;
pub mod ws;
