//! Runtime error types.

use crate::BackupError;
use karma_config_and_utils::CoreError;
use karma_outbox::OutboxError;
use karma_stats::StatsError;
use karma_storage::StorageError;
use karma_sync::SyncError;
use tab_accounting::AccountingError;
use thiserror::Error;

/// Runtime error type.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Accounting(#[from] AccountingError),

    #[error(transparent)]
    Stats(#[from] StatsError),

    #[error(transparent)]
    Outbox(#[from] OutboxError),

    #[error(transparent)]
    Sync(#[from] SyncError),

    /// Backup rejected before any change was made
    #[error("Backup rejected: {0}")]
    Backup(#[from] BackupError),

    /// Engine is shutting down
    #[error("Engine stopped")]
    Stopped,
}

/// Result type alias using RuntimeError.
pub type RuntimeResult<T> = Result<T, RuntimeError>;
