//! Running totals, daily rollover, streaks, and badges.
//!
//! - [`StatsAggregator`]: owns the live [`StatRecord`] plus the bounded daily
//!   archive and history; streaks change only at rollover
//! - [`BadgeEngine`]: pure derivation of newly earned badges
//! - [`Settings`]: user settings with the validated daily goal
//! - [`load_or_reset`]: load a persisted entity, resetting it when malformed

mod aggregator;
mod badges;
mod error;
mod persisted;
mod record;
mod settings;

pub use aggregator::{StatsAggregator, StatsConfig};
pub use badges::{Badge, BadgeDefinition, BadgeEngine, BadgeInputs, Requirement};
pub use error::{StatsError, StatsResult};
pub use persisted::{decode_entity, load_or_reset, Loaded, Validate};
pub use record::{DailyArchive, DailyStat, HistoryEntry, StatRecord};
pub use settings::{Settings, Theme, GOAL_RANGE, RETENTION_RANGE};
