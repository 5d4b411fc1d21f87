//! Carbon Karma - local-first emission accounting engine.

mod app;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use karma_config_and_utils::{init_logging, Config, Paths};

/// Carbon Karma command-line interface.
#[derive(Parser)]
#[command(name = "karma")]
#[command(about = "Local-first emission accounting and sync engine")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info", global = true)]
    log_level: String,

    /// Base directory for data, config and logs. Defaults to ~/.carbonkarma
    #[arg(long, global = true)]
    base_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the engine in the foreground, reading resource signals from stdin
    Run,
    /// Write a backup of all user data to a file
    Export {
        /// Destination file
        file: PathBuf,
    },
    /// Replace all user data with a backup file
    Import {
        /// Backup file to read
        file: PathBuf,
    },
    /// Print current totals, tabs, badges and sync state
    Status,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let paths = match cli.base_dir {
        Some(base) => Paths::with_base_dir(base),
        None => Paths::new()?,
    };
    paths.ensure_dirs()?;

    // Initialize logging
    init_logging(&cli.log_level, Some(paths.log_file()));

    // Load configuration
    let config = Config::load(&paths)?;

    match cli.command {
        Some(Commands::Run) | None => {
            app::run_engine(config, paths).await?;
        }
        Some(Commands::Export { file }) => {
            app::export_backup(config, &paths, &file).await?;
        }
        Some(Commands::Import { file }) => {
            app::import_backup(config, &paths, &file).await?;
        }
        Some(Commands::Status) => {
            app::print_status(config, &paths).await?;
        }
    }

    Ok(())
}
