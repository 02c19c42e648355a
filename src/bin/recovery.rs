//! Standalone recovery-pass entrypoint: connects to the queue, runs one
//! `RecoveryManager::run_once`, prints the stats, and exits. Useful for an
//! operator to trigger recovery out-of-band (cron, manual invocation)
//! without booting the full worker process.

use std::sync::Arc;

use clap::Parser;
use dotenvy::dotenv;
use redis::aio::ConnectionManager;
use taskqueue_core::config::AppConfig;
use taskqueue_queue::{QueueManager, RecoveryManager};
use tokio::sync::Mutex as AsyncMutex;
use tracing::info;

#[derive(Parser)]
#[command(author, version, about = "Run one task queue recovery pass", long_about = None)]
struct Args {
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

    let _ = tracing_subscriber::fmt().with_env_filter(config.observability.log_level.as_str()).try_init();

    let queue = Arc::new(AsyncMutex::new(QueueManager::<ConnectionManager>::connect(&config.queue.redis_url, config.queue.name.clone(), config.queue.task_ttl_seconds).await?));
    let recovery = RecoveryManager::new(queue, config.recovery.abandoned_task_threshold_ms, config.recovery.recovery_batch_size, config.retry.max_retries);

    let stats = recovery.run_once().await?;
    info!(?stats, "recovery pass complete");
    println!("{stats:?}");

    Ok(())
}
