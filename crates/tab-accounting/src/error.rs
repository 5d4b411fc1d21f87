//! Accounting error types.

use crate::ResourceId;
use thiserror::Error;

/// Errors from resource lifecycle operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AccountingError {
    /// Tracked-resource limit reached
    #[error("Cannot track resource {id}: limit of {limit} tracked resources reached")]
    CapacityExceeded { id: ResourceId, limit: usize },

    /// Resource was never opened or is already closed
    #[error("Resource not tracked: {0}")]
    NotFound(ResourceId),

    /// Resource is already tracked
    #[error("Resource already tracked: {0}")]
    AlreadyTracked(ResourceId),

    /// Multiplier is negative or not finite
    #[error("Invalid multiplier {multiplier} for resource {id}")]
    InvalidMultiplier { id: ResourceId, multiplier: f64 },
}

/// Result type alias using AccountingError.
pub type AccountingResult<T> = Result<T, AccountingError>;
