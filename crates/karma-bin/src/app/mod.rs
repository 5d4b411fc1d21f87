//! Engine wiring and subcommands.

mod commands;
mod init;
mod input;

pub use commands::{export_backup, import_backup, print_status};
pub use init::run_engine;
