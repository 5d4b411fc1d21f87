//! Carbon Karma engine runtime.
//!
//! Wires the accounting, stats, outbox and sync crates into one explicit
//! [`Engine`] state object:
//! - [`Ledger`]: tab sessions, stats, badges and settings behind a single
//!   writer lock
//! - [`Scheduler`]: periodic tick and cleanup tasks with broadcast shutdown
//! - [`backup`]: versioned export/import envelope

pub mod backup;
mod engine;
mod error;
mod ledger;
mod scheduler;

pub use backup::{BackupEnvelope, BackupError, BackupMetadata, BACKUP_TYPE, SUPPORTED_MAX};
pub use engine::{Engine, EngineParts, EngineStatus};
pub use error::{RuntimeError, RuntimeResult};
pub use ledger::{Ledger, ResourceSignal, TickOutcome};
pub use scheduler::Scheduler;
