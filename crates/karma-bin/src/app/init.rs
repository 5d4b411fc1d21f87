//! Engine construction and the foreground run loop.

use super::commands::status_summary;
use super::input::{parse_line, InputCommand};
use anyhow::Context;
use karma_config_and_utils::{Config, Paths, SystemClock};
use karma_outbox::{EventSender, HttpEventSender, SenderConfig, TracingSender};
use karma_runtime::{Engine, EngineParts};
use karma_storage::SqliteStore;
use karma_sync::StoreReplica;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};

/// Open both stores and start the engine.
pub(super) async fn open_engine(config: Config, paths: &Paths) -> anyhow::Result<Arc<Engine>> {
    let store = SqliteStore::open(&paths.database_file())
        .await
        .context("opening local store")?;
    let replica_store = SqliteStore::open(&paths.replica_file())
        .await
        .context("opening remote replica")?;

    let sender: Arc<dyn EventSender> = match config.analytics_endpoint()? {
        Some(endpoint) => {
            info!(endpoint = %endpoint, "Analytics delivery enabled");
            Arc::new(HttpEventSender::new(SenderConfig {
                endpoint,
                auth_token: config.analytics_token.clone(),
                timeout_secs: config.io_timeout_secs,
            })?)
        }
        None => Arc::new(TracingSender),
    };

    let engine = Engine::start(EngineParts {
        config,
        store: Arc::new(store),
        remote: Arc::new(StoreReplica::new(Arc::new(replica_store))),
        sender,
        clock: SystemClock::shared(),
    })
    .await?;
    Ok(engine)
}

/// Run until Ctrl-C. Each stdin line is one command; see [`parse_line`].
pub async fn run_engine(config: Config, paths: Paths) -> anyhow::Result<()> {
    let engine = open_engine(config, &paths).await?;
    info!(base_dir = %paths.base_dir().display(), "Carbon Karma engine running");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut input_open = true;
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                info!("Received shutdown signal, exiting...");
                break;
            }
            line = lines.next_line(), if input_open => match line {
                Ok(Some(line)) => handle_line(&engine, &line).await,
                Ok(None) => {
                    info!("Input closed, running until interrupted");
                    input_open = false;
                }
                Err(err) => {
                    warn!(error = %err, "Failed to read input");
                    input_open = false;
                }
            },
        }
    }

    engine.shutdown().await?;
    Ok(())
}

async fn handle_line(engine: &Engine, line: &str) {
    let command = match parse_line(line) {
        Ok(Some(command)) => command,
        Ok(None) => return,
        Err(reason) => {
            eprintln!("{}", reason);
            return;
        }
    };

    match command {
        InputCommand::Signal(signal) => {
            if let Err(err) = engine.send_signal(signal).await {
                warn!(error = %err, "Engine is not accepting signals");
            }
        }
        InputCommand::Online(online) => engine.set_online(online).await,
        InputCommand::Sync => {
            if let Err(err) = engine.force_sync().await {
                eprintln!("sync failed: {}", err);
            }
        }
        InputCommand::Status => {
            let status = engine.status().await;
            println!("{}", status_summary(&status));
            match serde_json::to_string_pretty(&status) {
                Ok(json) => println!("{}", json),
                Err(err) => warn!(error = %err, "Failed to render status"),
            }
        }
    }
}
