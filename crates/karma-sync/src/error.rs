//! Sync error types.

use karma_storage::StorageError;
use std::time::Duration;
use thiserror::Error;

/// Sync error type.
#[derive(Error, Debug)]
pub enum SyncError {
    /// Local store error
    #[error("Local storage error: {0}")]
    Storage(#[from] StorageError),

    /// Remote replica error
    #[error("Remote replica error: {0}")]
    Remote(String),

    /// Remote call did not complete in time
    #[error("Remote {op} timed out after {after:?}")]
    Timeout { op: &'static str, after: Duration },

    /// Remote value failed validation and could not be merged
    #[error("Unresolvable conflict for {key}: {reason}")]
    Unresolvable { key: String, reason: String },

    /// Sync requested while offline
    #[error("Offline")]
    Offline,
}

/// Result type alias using SyncError.
pub type SyncResult<T> = Result<T, SyncError>;
