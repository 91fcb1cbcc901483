//! Offset pagination query parameters.

use serde::{Deserialize, Serialize};

/// Query parameters for the offline-message listing.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OffsetParams {
    /// Entries to skip (default: 0).
    #[serde(default)]
    pub offset: usize,
    /// Page size; server default when absent, capped by the server maximum.
    pub limit: Option<usize>,
}
