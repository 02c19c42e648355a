//! `ParallelProcessingManager`: orchestrates one file's cleaning across the
//! chunk splitter, worker pool, progress tracker, performance monitor and
//! resource monitor. Implements `taskqueue_core::collaborators::FileProcessor`
//! so the queue crate can drive it without depending on this crate.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use async_trait::async_trait;
use futures::future::join_all;
use taskqueue_core::collaborators::{CleanRow, FileProcessor, FileRecordRepository, ProcessingOutcome, TabularSource};
use taskqueue_core::config::AppConfig;
use taskqueue_core::domain::TaskId;
use tracing::{info, warn};

use crate::chunk_splitter::split_file;
use crate::messages::WorkerEvent;
use crate::performance_monitor::PerformanceMonitor;
use crate::progress_tracker::ProgressTracker;
use crate::resource_monitor::{ResourceLimits, ResourceMonitor};
use crate::result_collector::ResultCollector;
use crate::worker_pool::WorkerPool;

#[derive(Debug, Clone, Copy)]
pub struct ParallelProcessingManagerConfig {
    pub worker_count: u32,
    pub batch_size: u32,
    pub chunk_timeout_ms: u64,
    pub sample_interval_ms: u64,
    pub resource_limits: ResourceLimits,
}

impl Default for ParallelProcessingManagerConfig {
    fn default() -> Self {
        Self { worker_count: 4, batch_size: 10_000, chunk_timeout_ms: 300_000, sample_interval_ms: 1_000, resource_limits: ResourceLimits::default() }
    }
}

impl From<&AppConfig> for ParallelProcessingManagerConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            worker_count: config.processing.worker_count,
            batch_size: config.processing.batch_size,
            chunk_timeout_ms: config.processing.chunk_timeout_ms,
            sample_interval_ms: config.processing.performance_sample_interval_ms,
            resource_limits: ResourceLimits {
                max_memory_mb: config.resources.max_memory_mb,
                max_cpu_usage: config.resources.max_cpu_usage,
                memory_warning_threshold_mb: config.resources.memory_warning_threshold_mb,
                consecutive_exceeded_threshold: config.resources.consecutive_exceeded_threshold,
            },
        }
    }
}

pub struct ParallelProcessingManager {
    config: ParallelProcessingManagerConfig,
    source_factory: Arc<dyn Fn(&str) -> Box<dyn TabularSource> + Send + Sync>,
    cleaner: Arc<dyn CleanRow>,
    repository: Arc<dyn FileRecordRepository>,
    busy: AtomicBool,
}

impl ParallelProcessingManager {
    pub fn new(
        config: ParallelProcessingManagerConfig,
        source_factory: Arc<dyn Fn(&str) -> Box<dyn TabularSource> + Send + Sync>,
        cleaner: Arc<dyn CleanRow>,
        repository: Arc<dyn FileRecordRepository>,
    ) -> Self {
        Self { config, source_factory, cleaner, repository, busy: AtomicBool::new(false) }
    }
}

#[async_trait]
impl FileProcessor for ParallelProcessingManager {
    async fn process_file(&self, task_id: TaskId, file_path: &str, worker_count: u32) -> anyhow::Result<ProcessingOutcome> {
        if self.busy.swap(true, Ordering::SeqCst) {
            anyhow::bail!("processing manager is already handling a file");
        }
        let outcome = self.process_file_inner(task_id, file_path, worker_count).await;
        self.busy.store(false, Ordering::SeqCst);
        outcome
    }
}

impl ParallelProcessingManager {
    async fn process_file_inner(&self, task_id: TaskId, file_path: &str, worker_count: u32) -> anyhow::Result<ProcessingOutcome> {
        let source = (self.source_factory)(file_path);
        let chunks = split_file(source.as_ref(), worker_count.max(1))?;
        let total_rows = source.row_count()?;

        if chunks.is_empty() {
            return Ok(ProcessingOutcome { total_rows: 0, success_count: 0, error_count: 0 });
        }

        let resource_monitor = Arc::new(ResourceMonitor::new(self.config.resource_limits));
        resource_monitor.start().await;
        let performance_monitor = Arc::new(PerformanceMonitor::new(self.config.sample_interval_ms));
        performance_monitor.start().await;
        let progress_tracker = Arc::new(ProgressTracker::new());
        let collector = Arc::new(Mutex::new(ResultCollector::new()));
        collector.lock().await.initialize(chunks.len() as u32, total_rows);

        let mut pool = WorkerPool::new(self.source_factory.clone(), self.cleaner.clone(), self.repository.clone());
        pool.initialize(chunks.len() as u32);
        let pool = Arc::new(pool);

        info!(task_id = %task_id, chunk_count = chunks.len(), total_rows, "starting parallel file processing");

        if resource_monitor.should_pause_worker_creation().await {
            warn!(task_id = %task_id, "resource pressure detected before dispatch, waiting for memory to release");
            if !resource_monitor.wait_for_memory_release(30_000).await {
                pool.terminate(5_000).await;
                performance_monitor.stop().await;
                resource_monitor.stop().await;
                anyhow::bail!("resource quota exceeded: memory did not drop below max_memory_mb before dispatch could begin");
            }
        }

        // Chunk count equals executor count, so each chunk is dispatched to
        // its own dedicated executor; all chunks run concurrently.
        let file_path_owned = file_path.to_string();
        let tasks = chunks.into_iter().enumerate().map(|(idx, chunk)| {
            let pool = pool.clone();
            let progress_tracker = progress_tracker.clone();
            let performance_monitor = performance_monitor.clone();
            let file_path = file_path_owned.clone();
            let chunk_id = chunk.chunk_id;
            let total_for_chunk = chunk.row_count();
            let batch_size = self.config.batch_size;
            let timeout_ms = self.config.chunk_timeout_ms;

            async move {
                let outcome = pool
                    .execute_task(idx, task_id, &file_path, chunk, batch_size, timeout_ms, |event| match event {
                        WorkerEvent::Progress { processed_rows, .. } => {
                            let tracker = progress_tracker.clone();
                            let processed_rows = *processed_rows;
                            tokio::spawn(async move {
                                tracker.update_progress(chunk_id, processed_rows, total_for_chunk).await;
                            });
                        }
                        WorkerEvent::Metrics(metrics) => {
                            let monitor = performance_monitor.clone();
                            let metrics = metrics.clone();
                            tokio::spawn(async move {
                                monitor.record_worker_metrics(metrics).await;
                            });
                        }
                        _ => {}
                    })
                    .await;

                if let Ok(result) = &outcome {
                    progress_tracker.update_progress(chunk_id, result.success_count + result.error_count, total_for_chunk).await;
                }
                outcome
            }
        });

        let results = join_all(tasks).await;
        let mut first_error = None;
        {
            let mut guard = collector.lock().await;
            for result in results {
                match result {
                    Ok(result) => guard.add_result(result),
                    Err(err) => {
                        warn!(task_id = %task_id, error = %err, "chunk execution failed, task will not complete");
                        if first_error.is_none() {
                            first_error = Some(err);
                        }
                    }
                }
            }
        }

        if !pool.is_healthy().await {
            warn!(task_id = %task_id, "worker pool finished with more than half its executors failed");
        }
        pool.terminate(5_000).await;
        let performance_report = performance_monitor.stop().await;
        resource_monitor.stop().await;

        info!(
            task_id = %task_id,
            avg_cpu = performance_report.avg_cpu_percent,
            peak_rss_mb = performance_report.peak_rss_mb,
            "finished parallel file processing"
        );

        // A failed chunk must surface as an error so the consumer can
        // classify and retry it, rather than being absorbed into the
        // integrity sum as synthetic error rows (spec §4.13 step 7 / §7).
        if let Some(err) = first_error {
            return Err(anyhow::Error::from(err).context(format!("task {task_id} failed: one or more chunks did not complete")));
        }

        let final_result = collector.lock().await.get_final_result()?;

        if let Err(err) = self.repository.mark_completed(task_id, chrono::Utc::now()).await {
            warn!(task_id = %task_id, error = %err, "failed to mark file record completed");
        }

        Ok(ProcessingOutcome { total_rows: final_result.total_rows, success_count: final_result.success_count, error_count: final_result.error_count })
    }
}
