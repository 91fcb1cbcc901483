//! Cross-instance fan-out over the shared message bus.

pub mod handlers;
pub mod publisher;
pub mod subscriber;

pub use handlers::{BroadcastDeliveryHandler, UserDeliveryHandler};
pub use publisher::{BatchFailure, BatchPublishReport, Publisher};
pub use subscriber::{MessageHandler, Subscriber};
