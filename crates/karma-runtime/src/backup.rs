//! Versioned backup envelope.
//!
//! ```text
//! { "metadata": { "version", "timestamp", "type" },
//!   "data": { "stats", "dailyStats", "badges", "settings", "history" } }
//! ```
//!
//! Import validates the whole envelope before it touches the store.

use crate::RuntimeResult;
use chrono::{DateTime, Utc};
use karma_stats::{decode_entity, Badge, DailyArchive, HistoryEntry, Settings, StatRecord};
use karma_storage::{PersistentStore, StorageKeys};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::info;

/// `metadata.type` of every backup.
pub const BACKUP_TYPE: &str = "carbonkarma_backup";

/// Newest envelope version this build reads, and the one it writes.
pub const SUPPORTED_MAX: u32 = 1;

/// Reasons an import is rejected.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BackupError {
    #[error("malformed backup: {0}")]
    Malformed(String),

    #[error("not a Carbon Karma backup (type {0:?})")]
    UnsupportedType(String),

    #[error("backup version {found} is newer than supported version {max}")]
    UnsupportedVersion { found: u32, max: u32 },

    #[error("section {section} is invalid: {reason}")]
    InvalidSection { section: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub version: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupEnvelope {
    pub metadata: BackupMetadata,
    pub data: Map<String, Value>,
}

/// Read the backup sections from `store`. Absent sections are omitted.
pub async fn export(store: &dyn PersistentStore, now: DateTime<Utc>) -> RuntimeResult<BackupEnvelope> {
    let mut data = Map::new();
    for section in StorageKeys::BACKUP_SECTIONS {
        if let Some(value) = store.get(section).await? {
            data.insert(section.to_string(), value);
        }
    }

    info!(sections = data.len(), "Exported backup");
    Ok(BackupEnvelope {
        metadata: BackupMetadata {
            version: SUPPORTED_MAX,
            timestamp: now,
            kind: BACKUP_TYPE.to_string(),
        },
        data,
    })
}

/// Check a raw backup and return the entries it would write.
pub fn validate(raw: &Value) -> Result<(BackupMetadata, Vec<(String, Value)>), BackupError> {
    let metadata_raw = raw
        .get("metadata")
        .ok_or_else(|| BackupError::Malformed("missing metadata".to_string()))?;
    let data = raw
        .get("data")
        .and_then(Value::as_object)
        .ok_or_else(|| BackupError::Malformed("missing data".to_string()))?;

    // Type and version are checked before the rest of the metadata so a
    // newer envelope is reported as such even if its shape changed.
    let kind = metadata_raw.get("type").and_then(Value::as_str).unwrap_or_default();
    if kind != BACKUP_TYPE {
        return Err(BackupError::UnsupportedType(kind.to_string()));
    }
    let version = metadata_raw
        .get("version")
        .and_then(Value::as_u64)
        .ok_or_else(|| BackupError::Malformed("metadata.version must be an integer".to_string()))?;
    if version > u64::from(SUPPORTED_MAX) {
        return Err(BackupError::UnsupportedVersion {
            found: u32::try_from(version).unwrap_or(u32::MAX),
            max: SUPPORTED_MAX,
        });
    }
    let metadata: BackupMetadata = serde_json::from_value(metadata_raw.clone())
        .map_err(|e| BackupError::Malformed(format!("metadata: {}", e)))?;

    let mut entries = Vec::with_capacity(StorageKeys::BACKUP_SECTIONS.len());
    for section in StorageKeys::BACKUP_SECTIONS {
        let value = data.get(section).ok_or_else(|| BackupError::InvalidSection {
            section: section.to_string(),
            reason: "missing".to_string(),
        })?;
        check_section(section, value)?;
        entries.push((section.to_string(), value.clone()));
    }

    Ok((metadata, entries))
}

fn check_section(section: &str, value: &Value) -> Result<(), BackupError> {
    let result = match section {
        StorageKeys::STATS => decode_entity::<StatRecord>(section, value.clone()).map(|_| ()),
        StorageKeys::DAILY_STATS => decode_entity::<DailyArchive>(section, value.clone()).map(|_| ()),
        StorageKeys::BADGES => decode_entity::<Vec<Badge>>(section, value.clone()).map(|_| ()),
        StorageKeys::SETTINGS => decode_entity::<Settings>(section, value.clone()).map(|_| ()),
        StorageKeys::HISTORY => decode_entity::<Vec<HistoryEntry>>(section, value.clone()).map(|_| ()),
        _ => Ok(()),
    };
    result.map_err(|e| BackupError::InvalidSection {
        section: section.to_string(),
        reason: e.to_string(),
    })
}

/// Replace the store contents with a validated backup.
///
/// Nothing is written unless the whole envelope validates. Returns the
/// number of sections written.
pub async fn import(store: &dyn PersistentStore, raw: &Value, batch_size: usize) -> RuntimeResult<usize> {
    let (metadata, entries) = validate(raw)?;

    store.clear().await?;
    let written = store.batch_set(entries, batch_size).await?;
    info!(
        version = metadata.version,
        exported_at = %metadata.timestamp,
        sections = written,
        "Imported backup"
    );
    Ok(written)
}
