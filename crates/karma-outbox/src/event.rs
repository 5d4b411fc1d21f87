//! Queued analytics event.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One outbound event. Persisted from enqueue until sent or dropped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsEvent {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
    /// Failed send attempts so far. Only ever increases.
    #[serde(default)]
    pub retry_count: u32,
}

impl AnalyticsEvent {
    pub fn new(name: impl Into<String>, payload: Value, enqueued_at: DateTime<Utc>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            payload,
            enqueued_at,
            retry_count: 0,
        }
    }
}
