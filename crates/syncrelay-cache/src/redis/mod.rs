//! Redis backends.

pub mod bus;
pub mod client;
pub mod offline;
pub mod presence;

pub use bus::RedisMessageBus;
pub use client::RedisClient;
pub use offline::RedisOfflineStore;
pub use presence::RedisPresenceStore;
