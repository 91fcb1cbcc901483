//! Backend traits defined in `syncrelay-core` and implemented by `syncrelay-cache`.

pub mod bus;
pub mod offline;
pub mod presence;

pub use bus::{BusMessage, BusStream, MessageBus};
pub use offline::OfflineStore;
pub use presence::PresenceStore;
