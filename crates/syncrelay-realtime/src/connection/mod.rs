//! Connection lifecycle: handles, the per-instance registry, and heartbeat.

pub mod handle;
pub mod heartbeat;
pub mod registry;

pub use handle::{CloseReason, ConnectionHandle, ConnectionInfo, SendOutcome};
pub use heartbeat::{HeartbeatConfig, run_heartbeat};
pub use registry::ConnectionRegistry;
