//! Sync units and per-key entity kinds.

use chrono::{DateTime, TimeZone, Utc};
use karma_storage::StorageKeys;
use serde_json::Value;

/// How a key's values are merged.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncEntity {
    Settings,
    Stats,
    DailyStats,
    History,
    Badges,
    Generic,
}

impl SyncEntity {
    pub fn for_key(key: &str) -> Self {
        match key {
            StorageKeys::SETTINGS => Self::Settings,
            StorageKeys::STATS => Self::Stats,
            StorageKeys::DAILY_STATS => Self::DailyStats,
            StorageKeys::HISTORY => Self::History,
            StorageKeys::BADGES => Self::Badges,
            _ => Self::Generic,
        }
    }
}

/// Which replica a value came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

/// One side's value for a key.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncEnvelope {
    pub key: String,
    pub value: Value,
    pub last_modified: Option<DateTime<Utc>>,
    pub origin: Origin,
}

impl SyncEnvelope {
    pub fn new(key: &str, value: Value, origin: Origin) -> Self {
        Self {
            key: key.to_string(),
            last_modified: last_modified(&value),
            value,
            origin,
        }
    }
}

/// Read `lastModified` from an object value.
///
/// Accepts an RFC 3339 string or epoch milliseconds. Anything else counts
/// as no timestamp.
pub fn last_modified(value: &Value) -> Option<DateTime<Utc>> {
    match value.get("lastModified")? {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().map(|f| f as i64))
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}
