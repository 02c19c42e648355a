//! Worker process entrypoint: boots the platform (queue consumer, timeout
//! checker, recovery manager, telemetry server) and runs until signaled.
//! Grounded in the teacher's `src/bin/agent.rs` (`clap` args, `dotenvy`,
//! `tracing_subscriber` init, then hand off to the platform).

use std::sync::Arc;

use clap::Parser;
use dotenvy::dotenv;
use taskqueue_core::collaborators::{CsvFileSource, PassthroughCleaner, TabularSource};
use taskqueue_core::config::AppConfig;
use taskqueue_platform::Platform;
use tracing::{error, info};

#[derive(Parser)]
#[command(author, version, about = "Task queue worker process", long_about = None)]
struct Args {
    /// Configuration file path; falls back to config/taskqueue.toml + env vars.
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();
    let args = Args::parse();

    let config = AppConfig::load_from_path(args.config)?;
    if let Err(errors) = config.validate() {
        for error in &errors {
            eprintln!("invalid configuration: {error}");
        }
        return Err("configuration validation failed".into());
    }

    info!("starting taskqueue worker");

    // The row-cleaning rule engine and the relational file-record store are
    // external collaborators outside this system's scope (spec.md's "OUT OF
    // SCOPE" list); the worker wires the narrow defaults described there.
    let source_factory: Arc<dyn Fn(&str) -> Box<dyn TabularSource> + Send + Sync> = Arc::new(|path: &str| Box::new(CsvFileSource::new(path)) as Box<dyn TabularSource>);
    let cleaner = Arc::new(PassthroughCleaner);
    let repository = Arc::new(taskqueue_agent::stub::LoggingFileRecordRepository);

    let platform = Platform::new(config, source_factory, cleaner, repository);
    let runtime = platform.start().await?;

    shutdown_signal().await;
    info!("shutdown signal received, draining in-flight work");
    runtime.shutdown().await.map_err(|err| {
        error!(%err, "error while shutting down platform");
        err
    })?;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
