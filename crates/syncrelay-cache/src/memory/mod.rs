//! In-memory backends for single-node deployments and tests.

pub mod bus;
pub mod offline;
pub mod presence;

pub use bus::MemoryMessageBus;
pub use offline::MemoryOfflineStore;
pub use presence::MemoryPresenceStore;
