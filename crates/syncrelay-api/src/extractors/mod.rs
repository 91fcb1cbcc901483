//! Custom Axum extractors.

pub mod auth;
pub mod pagination;

pub use auth::{AuthUser, bearer_token};
pub use pagination::OffsetParams;
