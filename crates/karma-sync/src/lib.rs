//! Local/remote replica reconciliation.
//!
//! This crate provides:
//! - [`reconcile`]: pure, deterministic merge of two key snapshots
//! - [`RemoteReplica`]: the remote side, with [`StoreReplica`] over any store
//! - [`SyncCoordinator`]: force sync, push with local rollback, remote change
//!   intake, first-sync migration and an observable status

mod coordinator;
mod entity;
mod error;
mod merge;
mod replica;

pub use coordinator::{SyncConfig, SyncCoordinator, SyncReport, SyncState, SyncStatus};
pub use entity::{last_modified, Origin, SyncEntity, SyncEnvelope};
pub use error::{SyncError, SyncResult};
pub use merge::{bound_days, merge_values, reconcile, reconcile_detailed, Reconciliation, Resolution};
pub use replica::{RemoteChange, RemoteReplica, StoreReplica};
