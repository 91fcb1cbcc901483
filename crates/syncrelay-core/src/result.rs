//! Convenience result type alias for SyncRelay.

use crate::error::AppError;

/// A specialized `Result` type for SyncRelay operations.
pub type AppResult<T> = Result<T, AppError>;
