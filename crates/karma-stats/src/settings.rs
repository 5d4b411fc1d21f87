//! User settings.
//!
//! Only the daily goal and the retention window are interpreted by the
//! engine. Everything else round-trips untouched through `extra`.

use crate::Validate;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::ops::RangeInclusive;

/// Accepted daily goal, in grams.
pub const GOAL_RANGE: RangeInclusive<f64> = 100.0..=5000.0;

/// Accepted data retention, in days.
pub const RETENTION_RANGE: RangeInclusive<u32> = 7..=365;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    Light,
    Dark,
    #[default]
    Auto,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Settings {
    #[serde(default = "default_goal", alias = "dailyEmissionGoal")]
    pub daily_goal: f64,
    #[serde(default = "default_region")]
    pub selected_region: String,
    #[serde(default)]
    pub theme: Theme,
    #[serde(default = "default_retention")]
    pub data_retention_days: u32,
    /// Uninterpreted settings, preserved as-is.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_goal() -> f64 {
    1000.0
}

fn default_region() -> String {
    "IN-NO".to_string()
}

fn default_retention() -> u32 {
    90
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            daily_goal: default_goal(),
            selected_region: default_region(),
            theme: Theme::default(),
            data_retention_days: default_retention(),
            extra: Map::new(),
        }
    }
}

impl Validate for Settings {
    fn validate(&self) -> Result<(), String> {
        if !GOAL_RANGE.contains(&self.daily_goal) {
            return Err(format!(
                "dailyGoal {} outside {}..={}",
                self.daily_goal,
                GOAL_RANGE.start(),
                GOAL_RANGE.end()
            ));
        }
        if !RETENTION_RANGE.contains(&self.data_retention_days) {
            return Err(format!(
                "dataRetentionDays {} outside {}..={}",
                self.data_retention_days,
                RETENTION_RANGE.start(),
                RETENTION_RANGE.end()
            ));
        }
        if self.selected_region.trim().is_empty() {
            return Err("selectedRegion must not be empty".to_string());
        }
        Ok(())
    }
}
