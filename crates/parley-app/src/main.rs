//! Parley - HTTP front end for a conversational agent.
//!
//! Composition root: parses CLI args, installs tracing, loads config, opens
//! the log database, wires the agent registry into the API, and serves until
//! Ctrl-C.

mod cli;
mod logging;

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use parley_agent::{AgentRegistry, EchoAgent};
use parley_api::{routes, AppState};
use parley_core::ParleyConfig;
use parley_storage::{Database, LogStore, QueuedLogSink};

use cli::CliArgs;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = CliArgs::parse();

    // Tracing starts before the config so load warnings are visible.
    let level = logging::init(
        &args
            .resolve_log_level(cli::env_var)
            .unwrap_or_else(|| "info".to_string()),
    );

    let config_path = args.resolve_config_path();
    let mut config = ParleyConfig::load_or_default(&config_path);
    args.apply(&mut config);
    config.validate()?;

    if let Err(e) = level.set_directive(&config.logging.level) {
        warn!(error = %e, "Keeping startup log level");
    }

    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %config_path.display(),
        "Starting Parley"
    );

    let store = open_log_store(&config)?;
    if config.logging.retention_days > 0 {
        match store.clear_older_than(config.logging.retention_days) {
            Ok(0) => {}
            Ok(purged) => info!(purged, "Purged expired log records"),
            Err(e) => warn!(error = %e, "Log retention purge failed"),
        }
    }
    let sink = Arc::new(QueuedLogSink::spawn(
        Arc::new(store.clone()),
        config.logging.queue_size,
    )?);

    let registry = AgentRegistry::new(Arc::new(EchoAgent::new()));
    let shutdown = CancellationToken::new();

    let state = AppState::new(config.clone(), registry, sink.clone())
        .with_log_store(store)
        .with_level_control(Arc::new(level))
        .with_shutdown(shutdown.clone());
    let supervisors = state.coordinator.supervisors().clone();

    let signal = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("Shutdown signal received"),
            Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
        }
        signal.cancel();
    });

    let served = routes::start_server(&config, state, shutdown).await;

    // Streams cut off by shutdown still write their completion records.
    supervisors.close();
    supervisors.wait().await;
    sink.shutdown();
    if let Err(ref e) = served {
        error!(error = %e, "Server exited with an error");
    }
    served?;

    info!("Parley shut down");
    Ok(())
}

/// Open the log database, or an in-memory one when `logging.db_path` is empty.
fn open_log_store(config: &ParleyConfig) -> Result<LogStore, Box<dyn std::error::Error>> {
    let db = if config.logging.db_path.trim().is_empty() {
        warn!("logging.db_path is empty, log records will not survive a restart");
        Database::in_memory()?
    } else {
        Database::new(Path::new(&config.logging.db_path))?
    };
    Ok(LogStore::new(Arc::new(db)))
}
