//! One-shot subcommands.

use super::init::open_engine;
use anyhow::Context;
use karma_config_and_utils::{Config, Paths};
use karma_runtime::EngineStatus;
use std::path::Path;
use tab_accounting::format_emissions;

/// One-line human summary printed ahead of the full status.
pub fn status_summary(status: &EngineStatus) -> String {
    let mut line = format!(
        "Today: {} of {} goal",
        format_emissions(status.total_accrued),
        format_emissions(status.goal)
    );
    if let Some(progress) = status.progress {
        line.push_str(&format!(" ({:.0}%)", progress * 100.0));
    }
    line.push_str(&format!(
        ", streak {}, {} tabs tracked",
        status.streak_count, status.tabs.tracked
    ));
    line
}

pub async fn export_backup(config: Config, paths: &Paths, file: &Path) -> anyhow::Result<()> {
    let engine = open_engine(config, paths).await?;
    let result = async {
        let envelope = engine.export_backup().await?;
        let json = serde_json::to_string_pretty(&envelope)?;
        std::fs::write(file, json).with_context(|| format!("writing {}", file.display()))?;
        println!("Exported {} sections to {}", envelope.data.len(), file.display());
        anyhow::Ok(())
    }
    .await;
    engine.shutdown().await?;
    result
}

pub async fn import_backup(config: Config, paths: &Paths, file: &Path) -> anyhow::Result<()> {
    let content =
        std::fs::read_to_string(file).with_context(|| format!("reading {}", file.display()))?;
    let raw: serde_json::Value =
        serde_json::from_str(&content).with_context(|| format!("parsing {}", file.display()))?;

    let engine = open_engine(config, paths).await?;
    let result = engine.import_backup(&raw).await;
    engine.shutdown().await?;

    let written = result?;
    println!("Imported {} sections from {}", written, file.display());
    Ok(())
}

pub async fn print_status(config: Config, paths: &Paths) -> anyhow::Result<()> {
    let engine = open_engine(config, paths).await?;
    let status = engine.status().await;
    engine.shutdown().await?;

    println!("{}", status_summary(&status));
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use karma_sync::SyncState;
    use tab_accounting::TabStats;

    fn status(total_accrued: f64, goal: f64, progress: Option<f64>) -> EngineStatus {
        EngineStatus {
            total_accrued,
            goal,
            progress,
            streak_count: 3,
            longest_streak: 5,
            weekly_change: None,
            tabs: TabStats {
                tracked: 2,
                ..TabStats::default()
            },
            badges: Vec::new(),
            queue_depth: 0,
            sync: SyncState::default(),
        }
    }

    #[test]
    fn summary_formats_grams_and_kilograms() {
        assert_eq!(
            status_summary(&status(250.4, 1000.0, Some(0.2504))),
            "Today: 250 g CO₂ of 1.00 kg CO₂ goal (25%), streak 3, 2 tabs tracked"
        );
    }

    #[test]
    fn summary_omits_progress_without_goal() {
        assert_eq!(
            status_summary(&status(1500.0, 0.0, None)),
            "Today: 1.50 kg CO₂ of 0 g CO₂ goal, streak 3, 2 tabs tracked"
        );
    }
}
