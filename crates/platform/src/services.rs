//! Concrete `ServiceRegistration`s wiring the queue and processing crates
//! into the platform's background task set.

use std::sync::Arc;
use std::time::Duration;

use redis::aio::ConnectionManager;
use taskqueue_processing::ParallelProcessingManager;
use taskqueue_queue::{RecoveryManager, TaskConsumer, TimeoutManager};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::context::PlatformContext;
use crate::service::ServiceRegistration;

pub fn consumer_service(consumer: Arc<TaskConsumer<ConnectionManager, ParallelProcessingManager>>) -> ServiceRegistration {
    ServiceRegistration::new(
        "task-consumer",
        Arc::new(move |_ctx, token: CancellationToken| {
            let consumer = consumer.clone();
            tokio::spawn(async move {
                let stopper = consumer.clone();
                tokio::spawn(async move {
                    token.cancelled().await;
                    stopper.stop();
                });
                consumer.start().await;
                Ok(())
            })
        }),
    )
}

pub fn timeout_service(timeout_manager: Arc<TimeoutManager<ConnectionManager>>, interval_ms: u64) -> ServiceRegistration {
    ServiceRegistration::new(
        "timeout-checker",
        Arc::new(move |_ctx, token: CancellationToken| {
            let timeout_manager = timeout_manager.clone();
            tokio::spawn(async move {
                timeout_manager.spawn_background_checker(interval_ms, token);
                Ok(())
            })
        }),
    )
}

pub fn recovery_service(recovery_manager: Arc<RecoveryManager<ConnectionManager>>, interval_ms: u64) -> ServiceRegistration {
    ServiceRegistration::new(
        "recovery-manager",
        Arc::new(move |_ctx, token: CancellationToken| {
            let recovery_manager = recovery_manager.clone();
            tokio::spawn(async move {
                recovery_manager.spawn_periodic(interval_ms, token);
                Ok(())
            })
        }),
    )
}

/// Periodically mirrors `queue:stats` into the process-wide `metrics`
/// recorder so the Prometheus endpoint reflects live queue depth, not just
/// request-scoped counters.
pub fn metrics_reporter_service() -> ServiceRegistration {
    ServiceRegistration::new(
        "metrics-reporter",
        Arc::new(move |ctx: PlatformContext, token: CancellationToken| {
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(5));
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            let queue = ctx.queue();
                            let stats = {
                                let mut guard = queue.lock().await;
                                guard.get_queue_stats().await
                            };
                            match stats {
                                Ok(stats) => {
                                    metrics::gauge!("taskqueue_queue_length").set(stats.queue_length as f64);
                                    metrics::gauge!("taskqueue_active_workers").set(stats.active_workers as f64);
                                    metrics::counter!("taskqueue_total_processed").absolute(stats.total_processed);
                                    metrics::counter!("taskqueue_total_failed").absolute(stats.total_failed);
                                }
                                Err(err) => warn!(%err, "failed to read queue stats for metrics reporter"),
                            }
                        }
                    }
                }
                Ok(())
            })
        }),
    )
}
