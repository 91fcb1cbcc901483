//! Core type definitions used across the SyncRelay workspace.

pub mod channel;
pub mod id;
pub mod message;
pub mod offline;

pub use channel::{
    BROADCAST_CHANNEL, USER_CHANNEL_PATTERN, channel_matches, user_channel, user_from_channel,
};
pub use id::*;
pub use message::{MessageType, SyncMessage};
pub use offline::{AckBatchReport, AckFailure, OfflineMessage};
