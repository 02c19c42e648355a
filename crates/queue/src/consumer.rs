//! `TaskConsumer`: the long-running dequeue/process/finalize loop.
//!
//! Grounded in the teacher's `layer4::executor::Executor` background-task
//! loop (`tokio::select!` over a channel plus a shutdown flag) and
//! `platform::runtime`'s `CancellationToken`-driven graceful shutdown.
//! Generic over `FileProcessor` so this crate never depends on
//! `taskqueue-processing` directly — the two subsystems are wired together
//! only at the composition root.

use chrono::Utc;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use taskqueue_core::collaborators::FileProcessor;
use taskqueue_core::domain::{ProcessingTask, TaskState, TaskStatistics, TaskStatusPatch};
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::classifier::{classify_and_decide, RetryDecision};
use crate::queue_manager::{QueueManager, RedisConnectionLike};
use crate::timeout_manager::TimeoutManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Stopped,
    Running,
    ShuttingDown,
}

#[derive(Debug, Clone, Copy)]
pub struct ConsumerConfig {
    pub max_retries: u32,
    pub base_retry_delay_ms: u64,
    pub max_processing_time_ms: u64,
    pub worker_count: u32,
    pub graceful_shutdown_ms: u64,
    pub dequeue_timeout_secs: u64,
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_retry_delay_ms: 1000,
            max_processing_time_ms: 1_800_000,
            worker_count: 4,
            graceful_shutdown_ms: 5 * 60 * 1000,
            dequeue_timeout_secs: 30,
        }
    }
}

pub struct TaskConsumer<C: RedisConnectionLike + 'static, P: FileProcessor + 'static> {
    queue: Arc<AsyncMutex<QueueManager<C>>>,
    processor: Arc<P>,
    timeout_manager: Arc<TimeoutManager<C>>,
    state: StdMutex<ConsumerState>,
    shutdown: CancellationToken,
    config: ConsumerConfig,
}

impl<C: RedisConnectionLike + 'static, P: FileProcessor + 'static> TaskConsumer<C, P> {
    pub fn new(queue: Arc<AsyncMutex<QueueManager<C>>>, processor: Arc<P>, timeout_manager: Arc<TimeoutManager<C>>, config: ConsumerConfig) -> Self {
        Self { queue, processor, timeout_manager, state: StdMutex::new(ConsumerState::Stopped), shutdown: CancellationToken::new(), config }
    }

    pub fn status(&self) -> ConsumerState {
        *self.state.lock().unwrap()
    }

    pub fn stop(&self) {
        self.shutdown.cancel();
    }

    /// The main loop. Runs until `stop()` is called; waits up to
    /// `graceful_shutdown_ms` for an in-flight task before re-enqueuing it
    /// and returning.
    pub async fn start(self: Arc<Self>) {
        *self.state.lock().unwrap() = ConsumerState::Running;
        info!("task consumer started");

        loop {
            if self.shutdown.is_cancelled() {
                *self.state.lock().unwrap() = ConsumerState::ShuttingDown;
                break;
            }

            match self.dequeue_with_backoff().await {
                Some(task) => {
                    let in_flight = self.process_one(task.clone());
                    tokio::select! {
                        _ = in_flight => {}
                        _ = tokio::time::sleep(Duration::from_millis(self.config.graceful_shutdown_ms)), if self.shutdown.is_cancelled() => {
                            warn!(task_id = %task.task_id, "graceful shutdown deadline hit, re-enqueuing in-flight task");
                            let retried = task.with_incremented_retry();
                            if let Err(err) = self.queue.lock().await.enqueue_task(&retried).await {
                                error!(%err, "failed to re-enqueue in-flight task during shutdown");
                            }
                        }
                    }
                }
                None => continue,
            }
        }

        *self.state.lock().unwrap() = ConsumerState::Stopped;
        info!("task consumer stopped");
    }

    async fn dequeue_with_backoff(&self) -> Option<ProcessingTask> {
        let result = {
            let mut queue = self.queue.lock().await;
            queue.dequeue_task(self.config.dequeue_timeout_secs).await
        };

        match result {
            Ok(task) => task,
            Err(err) => {
                let is_transport_error = matches!(err, taskqueue_core::errors::QueueError::Redis(_) | taskqueue_core::errors::QueueError::Unavailable(_));
                let delay = if is_transport_error { Duration::from_secs(5) } else { Duration::from_secs(1) };
                warn!(%err, "dequeue failed, backing off");
                tokio::time::sleep(delay).await;
                None
            }
        }
    }

    async fn process_one(&self, task: ProcessingTask) {
        let task_id = task.task_id;
        self.timeout_manager.start_timeout(task_id, Some(self.config.max_processing_time_ms));

        if let Err(err) = self
            .queue
            .lock()
            .await
            .set_task_status(task_id, TaskState::Processing, Some(TaskStatusPatch { started_at: Some(Utc::now()), ..Default::default() }))
            .await
        {
            error!(%task_id, %err, "failed to transition task to PROCESSING");
            self.timeout_manager.clear_timeout(task_id);
            return;
        }

        if !std::path::Path::new(&task.file_path).exists() {
            self.timeout_manager.clear_timeout(task_id);
            self.finalize_permanent_failure(&task, "FileNotFound: input file does not exist".to_string()).await;
            return;
        }

        let outcome = self.processor.process_file(task_id, &task.file_path, self.config.worker_count).await;

        if self.timeout_manager.is_task_timed_out(task_id) {
            // The watchdog already transitioned this task to TIMEOUT; it is
            // terminal and must not be overwritten.
            return;
        }
        self.timeout_manager.clear_timeout(task_id);

        match outcome {
            Ok(result) => self.finalize_success(&task, result.total_rows, result.success_count, result.error_count).await,
            Err(err) => self.finalize_failure_or_retry(&task, err.to_string()).await,
        }
    }

    async fn finalize_success(&self, task: &ProcessingTask, total_rows: u64, success_count: u64, error_count: u64) {
        let statistics = TaskStatistics { total_rows, success_count, error_count };
        let mut queue = self.queue.lock().await;
        if let Err(err) = queue
            .set_task_status(
                task.task_id,
                TaskState::Completed,
                Some(TaskStatusPatch { completed_at: Some(Utc::now()), statistics: Some(statistics), ..Default::default() }),
            )
            .await
        {
            error!(task_id = %task.task_id, %err, "failed to transition task to COMPLETED");
            return;
        }
        if let Err(err) = queue.increment_total_processed().await {
            error!(%err, "failed to increment totalProcessed");
        }
    }

    async fn finalize_permanent_failure(&self, task: &ProcessingTask, error_message: String) {
        let mut queue = self.queue.lock().await;
        if let Err(err) = queue
            .set_task_status(task.task_id, TaskState::Failed, Some(TaskStatusPatch { completed_at: Some(Utc::now()), error_message: Some(error_message), ..Default::default() }))
            .await
        {
            error!(task_id = %task.task_id, %err, "failed to transition task to FAILED");
            return;
        }
        if let Err(err) = queue.increment_total_failed().await {
            error!(%err, "failed to increment totalFailed");
        }
    }

    async fn finalize_failure_or_retry(&self, task: &ProcessingTask, error_message: String) {
        let (_, decision) = classify_and_decide(&error_message, task.retry_count, self.config.max_retries, self.config.base_retry_delay_ms);
        match decision {
            RetryDecision::Retry { delay_ms } => {
                let retried = task.with_incremented_retry();
                let queue = self.queue.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    if let Err(err) = queue.lock().await.enqueue_task(&retried).await {
                        error!(%err, "failed to re-enqueue retried task");
                    }
                });
            }
            RetryDecision::Fail => {
                self.finalize_permanent_failure(task, error_message).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue_manager::fake::new_fake_manager;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use taskqueue_core::collaborators::ProcessingOutcome;
    use taskqueue_core::domain::TaskId;

    struct AlwaysSucceeds;

    #[async_trait]
    impl FileProcessor for AlwaysSucceeds {
        async fn process_file(&self, _task_id: TaskId, _file_path: &str, _worker_count: u32) -> anyhow::Result<ProcessingOutcome> {
            Ok(ProcessingOutcome { total_rows: 1000, success_count: 1000, error_count: 0 })
        }
    }

    struct FailsNTimesThenSucceeds {
        remaining_failures: AtomicUsize,
        message: String,
    }

    #[async_trait]
    impl FileProcessor for FailsNTimesThenSucceeds {
        async fn process_file(&self, _task_id: TaskId, _file_path: &str, _worker_count: u32) -> anyhow::Result<ProcessingOutcome> {
            if self.remaining_failures.fetch_sub(1, Ordering::SeqCst) > 0 {
                anyhow::bail!(self.message.clone());
            }
            Ok(ProcessingOutcome { total_rows: 10, success_count: 10, error_count: 0 })
        }
    }

    fn touch_temp_file() -> tempfile::NamedTempFile {
        tempfile::NamedTempFile::new().unwrap()
    }

    #[tokio::test]
    async fn happy_path_completes_and_increments_processed_counter() {
        let queue = Arc::new(AsyncMutex::new(new_fake_manager("file-processing", 604_800)));
        let timeout_manager = Arc::new(TimeoutManager::new(queue.clone(), 1_800_000));
        let consumer = TaskConsumer::new(queue.clone(), Arc::new(AlwaysSucceeds), timeout_manager, ConsumerConfig::default());

        let file = touch_temp_file();
        let task = ProcessingTask::new(uuid::Uuid::new_v4(), "f1".into(), file.path().to_string_lossy().to_string(), "f1.csv".into(), 100);

        consumer.process_one(task.clone()).await;

        let mut q = queue.lock().await;
        let status = q.get_task_status(task.task_id).await.unwrap();
        assert_eq!(status.state, TaskState::Completed);
        assert_eq!(status.statistics.unwrap().success_count, 1000);
        assert_eq!(q.get_queue_stats().await.unwrap().total_processed, 1);
    }

    #[tokio::test]
    async fn missing_file_fails_permanently_without_touching_processor() {
        let queue = Arc::new(AsyncMutex::new(new_fake_manager("file-processing", 604_800)));
        let timeout_manager = Arc::new(TimeoutManager::new(queue.clone(), 1_800_000));
        let consumer = TaskConsumer::new(queue.clone(), Arc::new(AlwaysSucceeds), timeout_manager, ConsumerConfig::default());

        let task = ProcessingTask::new(uuid::Uuid::new_v4(), "f1".into(), "/nonexistent/path.csv".into(), "f1.csv".into(), 100);
        consumer.process_one(task.clone()).await;

        let mut q = queue.lock().await;
        let status = q.get_task_status(task.task_id).await.unwrap();
        assert_eq!(status.state, TaskState::Failed);
        assert!(status.error_message.unwrap().contains("FileNotFound"));
    }

    #[tokio::test]
    async fn retryable_network_failure_schedules_reenqueue_with_incremented_retry_count() {
        let queue = Arc::new(AsyncMutex::new(new_fake_manager("file-processing", 604_800)));
        let timeout_manager = Arc::new(TimeoutManager::new(queue.clone(), 1_800_000));
        let processor = Arc::new(FailsNTimesThenSucceeds { remaining_failures: AtomicUsize::new(1), message: "ECONNRESET".to_string() });
        let mut config = ConsumerConfig::default();
        config.base_retry_delay_ms = 5;
        let consumer = TaskConsumer::new(queue.clone(), processor, timeout_manager, config);

        let file = touch_temp_file();
        let task = ProcessingTask::new(uuid::Uuid::new_v4(), "f1".into(), file.path().to_string_lossy().to_string(), "f1.csv".into(), 100);
        consumer.process_one(task.clone()).await;

        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut q = queue.lock().await;
        let requeued = q.dequeue_task(1).await.unwrap().unwrap();
        assert_eq!(requeued.task_id, task.task_id);
        assert_eq!(requeued.retry_count, 1);
    }

    #[tokio::test]
    async fn permanent_format_failure_does_not_reenqueue() {
        let queue = Arc::new(AsyncMutex::new(new_fake_manager("file-processing", 604_800)));
        let timeout_manager = Arc::new(TimeoutManager::new(queue.clone(), 1_800_000));
        let processor = Arc::new(FailsNTimesThenSucceeds { remaining_failures: AtomicUsize::new(100), message: "unsupported file format".to_string() });
        let consumer = TaskConsumer::new(queue.clone(), processor, timeout_manager, ConsumerConfig::default());

        let file = touch_temp_file();
        let task = ProcessingTask::new(uuid::Uuid::new_v4(), "f1".into(), file.path().to_string_lossy().to_string(), "f1.csv".into(), 100);
        consumer.process_one(task.clone()).await;

        let mut q = queue.lock().await;
        let status = q.get_task_status(task.task_id).await.unwrap();
        assert_eq!(status.state, TaskState::Failed);
        assert!(status.error_message.unwrap().contains("unsupported file format"));
        assert!(q.dequeue_task(1).await.unwrap().is_none());
        assert_eq!(q.get_queue_stats().await.unwrap().total_failed, 1);
    }
}
