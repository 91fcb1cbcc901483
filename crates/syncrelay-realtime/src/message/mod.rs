//! WebSocket wire frames.

pub mod types;

pub use types::{ClientFrame, ServerFrame};
