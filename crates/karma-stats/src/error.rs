//! Stats error types.

use karma_storage::StorageError;
use thiserror::Error;

/// Stats error type.
#[derive(Error, Debug)]
pub enum StatsError {
    /// A value failed structural or range validation
    #[error("Validation error for {entity}: {reason}")]
    Validation { entity: String, reason: String },

    /// Store error
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl StatsError {
    pub fn validation(entity: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            entity: entity.into(),
            reason: reason.into(),
        }
    }
}

/// Result type alias using StatsError.
pub type StatsResult<T> = Result<T, StatsError>;
