//! `Platform`/`PlatformRuntime`: composition root lifecycle. Grounded in
//! the teacher's `platform::runtime::Platform`/`PlatformRuntime` —
//! `Platform::new` registers services, `start()` builds the shared context
//! under a root `CancellationToken` and spawns every service, and
//! `shutdown()` cancels the token then awaits each service's `JoinHandle`.

use std::sync::Arc;

use anyhow::Result;
use redis::aio::ConnectionManager;
use taskqueue_core::collaborators::{CleanRow, FileRecordRepository, TabularSource};
use taskqueue_core::config::AppConfig;
use taskqueue_processing::{ParallelProcessingManager, ParallelProcessingManagerConfig};
use taskqueue_queue::{ConsumerConfig, QueueManager, RecoveryManager, TaskConsumer, TimeoutManager};
use tokio::sync::Mutex as AsyncMutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::context::PlatformContext;
use crate::service::ServiceRegistration;
use crate::services::{consumer_service, metrics_reporter_service, recovery_service, timeout_service};
use crate::telemetry::{install_recorder, telemetry_service};

pub struct Platform {
    config: AppConfig,
    source_factory: Arc<dyn Fn(&str) -> Box<dyn TabularSource> + Send + Sync>,
    cleaner: Arc<dyn CleanRow>,
    repository: Arc<dyn FileRecordRepository>,
    extra_services: Vec<ServiceRegistration>,
}

impl Platform {
    pub fn new(
        config: AppConfig,
        source_factory: Arc<dyn Fn(&str) -> Box<dyn TabularSource> + Send + Sync>,
        cleaner: Arc<dyn CleanRow>,
        repository: Arc<dyn FileRecordRepository>,
    ) -> Self {
        Self { config, source_factory, cleaner, repository, extra_services: Vec::new() }
    }

    pub fn register_service(&mut self, service: ServiceRegistration) {
        self.extra_services.push(service);
    }

    pub async fn start(self) -> Result<PlatformRuntime> {
        initialize_logging(&self.config);

        let queue = Arc::new(AsyncMutex::new(QueueManager::<ConnectionManager>::connect(&self.config.queue.redis_url, self.config.queue.name.clone(), self.config.queue.task_ttl_seconds).await?));

        let root_token = CancellationToken::new();
        let context = PlatformContext::new(self.config.clone(), queue.clone(), root_token.child_token());

        let processing_manager = Arc::new(ParallelProcessingManager::new(
            ParallelProcessingManagerConfig::from(&self.config),
            self.source_factory.clone(),
            self.cleaner.clone(),
            self.repository.clone(),
        ));

        let timeout_manager = Arc::new(TimeoutManager::new(queue.clone(), self.config.timeout.max_processing_time_ms));

        let consumer_config = ConsumerConfig {
            max_retries: self.config.retry.max_retries,
            base_retry_delay_ms: self.config.retry.base_retry_delay_ms,
            max_processing_time_ms: self.config.timeout.max_processing_time_ms,
            worker_count: self.config.processing.worker_count,
            graceful_shutdown_ms: 5 * 60 * 1000,
            dequeue_timeout_secs: 30,
        };
        let consumer = Arc::new(TaskConsumer::new(queue.clone(), processing_manager, timeout_manager.clone(), consumer_config));

        let recovery_manager = Arc::new(RecoveryManager::new(
            queue.clone(),
            self.config.recovery.abandoned_task_threshold_ms,
            self.config.recovery.recovery_batch_size,
            self.config.retry.max_retries,
        ));

        let metrics_handle = install_recorder()?;

        let mut services = vec![
            telemetry_service(self.config.observability.clone(), metrics_handle),
            consumer_service(consumer),
            timeout_service(timeout_manager, self.config.timeout.timeout_check_interval_ms),
            metrics_reporter_service(),
        ];
        if self.config.recovery.enable_auto_recovery {
            services.push(recovery_service(recovery_manager, self.config.recovery.recovery_check_interval_ms));
        }
        services.extend(self.extra_services);

        let mut tasks = Vec::new();
        for service in services {
            let handle = service.spawn(context.clone(), root_token.child_token());
            tasks.push((service.name().to_string(), handle));
        }

        info!("platform boot completed");

        Ok(PlatformRuntime { context, cancel_token: root_token, tasks })
    }
}

pub struct PlatformRuntime {
    context: PlatformContext,
    cancel_token: CancellationToken,
    tasks: Vec<(String, JoinHandle<Result<()>>)>,
}

impl PlatformRuntime {
    pub fn context(&self) -> PlatformContext {
        self.context.clone()
    }

    pub async fn shutdown(self) -> Result<()> {
        self.cancel_token.cancel();

        for (name, handle) in self.tasks {
            match handle.await {
                Ok(Ok(())) => info!(service = %name, "service shutdown cleanly"),
                Ok(Err(err)) => return Err(err),
                Err(err) => return Err(err.into()),
            }
        }

        Ok(())
    }
}

fn initialize_logging(config: &AppConfig) {
    let _ = tracing_subscriber::fmt().with_env_filter(config.observability.log_level.as_str()).try_init();
}
