//! File system paths for the engine.

use crate::{CoreError, CoreResult};
use std::path::PathBuf;

/// Directory name under the user's home directory.
const BASE_DIR_NAME: &str = ".carbonkarma";

/// Manages file system paths for the engine.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Base directory for all runtime files (~/.carbonkarma)
    base_dir: PathBuf,
}

impl Paths {
    /// Create a new Paths instance rooted at `~/.carbonkarma`.
    pub fn new() -> CoreResult<Self> {
        let home = dirs::home_dir()
            .ok_or_else(|| CoreError::Path("Could not determine home directory".to_string()))?;

        Ok(Self {
            base_dir: home.join(BASE_DIR_NAME),
        })
    }

    /// Create a new Paths instance with a custom base directory.
    pub fn with_base_dir(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Get the base directory (~/.carbonkarma).
    pub fn base_dir(&self) -> &PathBuf {
        &self.base_dir
    }

    /// Get the config file path (~/.carbonkarma/config.json).
    pub fn config_file(&self) -> PathBuf {
        self.base_dir.join("config.json")
    }

    /// Get the local store path (~/.carbonkarma/karma.sqlite).
    pub fn database_file(&self) -> PathBuf {
        self.base_dir.join("karma.sqlite")
    }

    /// Get the file-backed remote replica path (~/.carbonkarma/replica.sqlite).
    pub fn replica_file(&self) -> PathBuf {
        self.base_dir.join("replica.sqlite")
    }

    /// Get the logs directory (~/.carbonkarma/logs).
    pub fn logs_dir(&self) -> PathBuf {
        self.base_dir.join("logs")
    }

    /// Get the structured log file (~/.carbonkarma/logs/karma.jsonl).
    pub fn log_file(&self) -> PathBuf {
        self.logs_dir().join("karma.jsonl")
    }

    /// Get the backups directory (~/.carbonkarma/backups).
    pub fn backups_dir(&self) -> PathBuf {
        self.base_dir.join("backups")
    }

    /// Ensure all required directories exist.
    pub fn ensure_dirs(&self) -> CoreResult<()> {
        std::fs::create_dir_all(&self.base_dir)?;
        std::fs::create_dir_all(self.logs_dir())?;
        std::fs::create_dir_all(self.backups_dir())?;
        Ok(())
    }
}
