//! ferryd — daemon wrapper around the transfer engine.
//!
//! Loads configuration, starts the engine, logs every task update, and runs
//! until SIGINT/SIGTERM. Exit codes: 0 clean shutdown, 2 configuration
//! error, 3 store error.

use std::path::PathBuf;
use std::process::ExitCode;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use ferry::{Engine, EngineConfig, TaskUpdate};

const EXIT_CONFIG_ERROR: u8 = 2;
const EXIT_STORE_ERROR: u8 = 3;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "ferry=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("starting ferryd v{}", env!("CARGO_PKG_VERSION"));

    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let config = match EngineConfig::load(config_path.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("configuration error: {e}");
            return ExitCode::from(EXIT_CONFIG_ERROR);
        }
    };
    tracing::info!("store at {}", config.store_dir.display());

    let engine = match Engine::new(config) {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!("cannot open store: {e}");
            return ExitCode::from(EXIT_STORE_ERROR);
        }
    };

    // subscribe before start so buffered updates from the previous run drain
    let mut updates = engine.subscribe();
    tokio::spawn(async move {
        while let Ok(update) = updates.recv().await {
            match update {
                TaskUpdate::Status(u) => {
                    tracing::info!(task = %u.task.task_id, status = ?u.status, "status");
                }
                TaskUpdate::Progress(u) => {
                    tracing::debug!(task = %u.task.task_id, progress = u.progress, "progress");
                }
            }
        }
    });

    if let Err(e) = engine.start().await {
        tracing::error!("cannot restore persisted tasks: {e}");
        return ExitCode::from(EXIT_STORE_ERROR);
    }

    wait_for_signal().await;
    tracing::info!("shutting down");
    engine.shutdown().await;
    ExitCode::SUCCESS
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("signal handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
