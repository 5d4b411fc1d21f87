//! Badge derivation.
//!
//! [`BadgeEngine::evaluate`] is pure: it never reads the store or the clock.
//! The caller stamps `earned_at` and merges the result into what it already
//! holds, which makes repeated evaluation idempotent.

use crate::Validate;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Condition a badge is earned on.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Requirement {
    /// Current streak of goal-met days.
    Streak { days: u32 },
    /// Best streak ever reached.
    LongestStreak { days: u32 },
    /// Archived days on which the goal was met.
    GoalsMet { days: usize },
    /// At most `max` tracked resources, with at least one open.
    MaxTabs { max: usize },
    /// Week-over-week emission reduction, in percent.
    Reduction { percent: f64 },
}

/// Facts the requirements are tested against.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BadgeInputs {
    pub streak_count: u32,
    pub longest_streak: u32,
    pub goals_met: usize,
    /// Resources tracked right now. `None` when unknown.
    pub tracked_resources: Option<usize>,
    /// Week-over-week reduction percentage. `None` without two weeks of data.
    pub weekly_reduction: Option<f64>,
}

impl Requirement {
    pub fn is_met(&self, inputs: &BadgeInputs) -> bool {
        match *self {
            Self::Streak { days } => inputs.streak_count >= days,
            Self::LongestStreak { days } => inputs.longest_streak >= days,
            Self::GoalsMet { days } => inputs.goals_met >= days,
            Self::MaxTabs { max } => {
                matches!(inputs.tracked_resources, Some(n) if n > 0 && n <= max)
            }
            Self::Reduction { percent } => {
                matches!(inputs.weekly_reduction, Some(r) if r >= percent)
            }
        }
    }
}

/// A badge that can be earned.
#[derive(Debug, Clone, PartialEq)]
pub struct BadgeDefinition {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    pub requirement: Requirement,
}

impl BadgeDefinition {
    /// Record this badge as earned at `at`.
    pub fn earn(&self, at: DateTime<Utc>) -> Badge {
        Badge {
            id: self.id.to_string(),
            requirement: self.requirement.clone(),
            earned_at: at,
        }
    }
}

/// An earned badge. Never changed once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Badge {
    pub id: String,
    pub requirement: Requirement,
    pub earned_at: DateTime<Utc>,
}

impl Validate for Vec<Badge> {
    fn validate(&self) -> Result<(), String> {
        let mut seen = HashSet::new();
        for badge in self {
            if badge.id.is_empty() {
                return Err("badge id must not be empty".to_string());
            }
            if !seen.insert(badge.id.as_str()) {
                return Err(format!("duplicate badge {}", badge.id));
            }
        }
        Ok(())
    }
}

/// Evaluates badge definitions against stats.
#[derive(Debug, Clone)]
pub struct BadgeEngine {
    definitions: Vec<BadgeDefinition>,
}

impl Default for BadgeEngine {
    fn default() -> Self {
        Self::new(default_definitions())
    }
}

impl BadgeEngine {
    pub fn new(definitions: Vec<BadgeDefinition>) -> Self {
        Self { definitions }
    }

    pub fn definitions(&self) -> &[BadgeDefinition] {
        &self.definitions
    }

    /// Definitions satisfied by `inputs` that are not in `already_earned`.
    pub fn evaluate(&self, inputs: &BadgeInputs, already_earned: &[Badge]) -> Vec<BadgeDefinition> {
        let earned: HashSet<&str> = already_earned.iter().map(|b| b.id.as_str()).collect();
        self.definitions
            .iter()
            .filter(|def| !earned.contains(def.id))
            .filter(|def| def.requirement.is_met(inputs))
            .cloned()
            .collect()
    }
}

fn default_definitions() -> Vec<BadgeDefinition> {
    vec![
        BadgeDefinition {
            id: "eco_warrior",
            name: "Eco Warrior",
            description: "Maintained a 7-day low-carbon streak",
            requirement: Requirement::Streak { days: 7 },
        },
        BadgeDefinition {
            id: "green_surfer",
            name: "Green Surfer",
            description: "Met the daily goal on 5 days",
            requirement: Requirement::GoalsMet { days: 5 },
        },
        BadgeDefinition {
            id: "streak_master",
            name: "Streak Master",
            description: "Reached a 14-day streak",
            requirement: Requirement::LongestStreak { days: 14 },
        },
        BadgeDefinition {
            id: "tab_master",
            name: "Tab Master",
            description: "Kept 5 or fewer tabs open",
            requirement: Requirement::MaxTabs { max: 5 },
        },
        BadgeDefinition {
            id: "carbon_saver",
            name: "Carbon Saver",
            description: "Reduced weekly emissions by 50%",
            requirement: Requirement::Reduction { percent: 50.0 },
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ids(defs: &[BadgeDefinition]) -> Vec<&'static str> {
        defs.iter().map(|d| d.id).collect()
    }

    #[test]
    fn streak_badge_awarded_at_threshold() {
        let engine = BadgeEngine::default();
        let six = BadgeInputs {
            streak_count: 6,
            longest_streak: 6,
            ..Default::default()
        };
        assert!(engine.evaluate(&six, &[]).is_empty());

        let seven = BadgeInputs {
            streak_count: 7,
            longest_streak: 7,
            ..Default::default()
        };
        assert_eq!(ids(&engine.evaluate(&seven, &[])), vec!["eco_warrior"]);
    }

    #[test]
    fn already_earned_badges_are_skipped() {
        let engine = BadgeEngine::default();
        let inputs = BadgeInputs {
            streak_count: 20,
            longest_streak: 20,
            goals_met: 10,
            ..Default::default()
        };
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();

        let first = engine.evaluate(&inputs, &[]);
        assert_eq!(
            ids(&first),
            vec!["eco_warrior", "green_surfer", "streak_master"]
        );

        let earned: Vec<Badge> = first.iter().map(|d| d.earn(at)).collect();
        assert!(engine.evaluate(&inputs, &earned).is_empty());
    }

    #[test]
    fn tab_master_needs_open_resources() {
        let engine = BadgeEngine::default();
        let none_open = BadgeInputs {
            tracked_resources: Some(0),
            ..Default::default()
        };
        assert!(engine.evaluate(&none_open, &[]).is_empty());

        let few_open = BadgeInputs {
            tracked_resources: Some(3),
            ..Default::default()
        };
        assert_eq!(ids(&engine.evaluate(&few_open, &[])), vec!["tab_master"]);

        let many_open = BadgeInputs {
            tracked_resources: Some(12),
            ..Default::default()
        };
        assert!(engine.evaluate(&many_open, &[]).is_empty());
    }

    #[test]
    fn reduction_badge_requires_data() {
        let engine = BadgeEngine::default();
        assert!(engine.evaluate(&BadgeInputs::default(), &[]).is_empty());

        let halved = BadgeInputs {
            weekly_reduction: Some(55.0),
            ..Default::default()
        };
        assert_eq!(ids(&engine.evaluate(&halved, &[])), vec!["carbon_saver"]);
    }

    #[test]
    fn badge_list_rejects_duplicates() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let engine = BadgeEngine::default();
        let def = &engine.definitions()[0];
        let badges = vec![def.earn(at), def.earn(at)];
        assert!(badges.validate().is_err());
    }

    #[test]
    fn badge_serializes_with_tagged_requirement() {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let badge = BadgeEngine::default().definitions()[0].earn(at);
        let json = serde_json::to_value(&badge).unwrap();
        assert_eq!(json["id"], "eco_warrior");
        assert_eq!(json["requirement"]["type"], "streak");
        assert_eq!(json["requirement"]["days"], 7);
    }
}
