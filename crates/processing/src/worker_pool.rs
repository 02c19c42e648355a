//! Owns `N` worker executors and dispatches chunk tasks to them
//! concurrently.
//!
//! Grounded in the teacher's `layer4::executor::Executor` (agent registry +
//! channel-based task dispatch) and `layer4::scheduler::Scheduler`
//! (dispatch, await response, enforce a deadline). Workers here are OS
//! threads rather than WASM sandboxes — the teacher's channel-based
//! lifecycle management is kept, the execution substrate is generalized.
//! Each executor's state lives behind its own `tokio::sync::Mutex` so
//! `execute_task` can be called on distinct executors concurrently from
//! multiple spawned tasks, not just sequentially against `&mut self`.

use std::sync::Arc;
use std::time::{Duration, Instant};
use taskqueue_core::collaborators::{CleanRow, FileRecordRepository, RowBatch, RowOutcome, TabularSource};
use taskqueue_core::domain::{ChunkDescriptor, RowError, TaskId, WorkerResult};
use taskqueue_core::errors::{QueueError, QueueResult};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::messages::{WorkerCommand, WorkerEvent, WorkerMetrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutorState {
    Idle,
    Busy,
    Failed,
    Terminated,
}

struct ExecutorHandle {
    state: ExecutorState,
    cmd_tx: async_channel::Sender<WorkerCommand>,
    event_rx: async_channel::Receiver<WorkerEvent>,
}

pub struct WorkerPool {
    executors: Vec<Arc<AsyncMutex<ExecutorHandle>>>,
    source_factory: Arc<dyn Fn(&str) -> Box<dyn TabularSource> + Send + Sync>,
    cleaner: Arc<dyn CleanRow>,
    repository: Arc<dyn FileRecordRepository>,
    runtime: tokio::runtime::Handle,
}

fn spawn_executor(
    cleaner: Arc<dyn CleanRow>,
    repository: Arc<dyn FileRecordRepository>,
    source_factory: Arc<dyn Fn(&str) -> Box<dyn TabularSource> + Send + Sync>,
    rt: tokio::runtime::Handle,
) -> Arc<AsyncMutex<ExecutorHandle>> {
    let (cmd_tx, cmd_rx) = async_channel::unbounded::<WorkerCommand>();
    let (event_tx, event_rx) = async_channel::unbounded::<WorkerEvent>();
    std::thread::spawn(move || executor_loop(cmd_rx, event_tx, cleaner, repository, source_factory, rt));
    Arc::new(AsyncMutex::new(ExecutorHandle { state: ExecutorState::Idle, cmd_tx, event_rx }))
}

impl WorkerPool {
    pub fn new(
        source_factory: Arc<dyn Fn(&str) -> Box<dyn TabularSource> + Send + Sync>,
        cleaner: Arc<dyn CleanRow>,
        repository: Arc<dyn FileRecordRepository>,
    ) -> Self {
        Self { executors: Vec::new(), source_factory, cleaner, repository, runtime: tokio::runtime::Handle::current() }
    }

    /// Spawns `count` executor threads; idempotent if already initialized
    /// with the same count.
    pub fn initialize(&mut self, count: u32) {
        if self.executors.len() == count as usize {
            return;
        }
        self.executors.clear();
        for _ in 0..count {
            self.executors.push(spawn_executor(self.cleaner.clone(), self.repository.clone(), self.source_factory.clone(), self.runtime.clone()));
        }
    }

    pub fn executor_count(&self) -> usize {
        self.executors.len()
    }

    /// Scans for an idle executor and atomically marks it `Busy`, returning
    /// its index. Safe to call concurrently from multiple tasks.
    pub async fn claim_idle_executor(&self) -> Option<usize> {
        for (idx, executor) in self.executors.iter().enumerate() {
            let mut guard = executor.lock().await;
            if guard.state == ExecutorState::Idle {
                guard.state = ExecutorState::Busy;
                return Some(idx);
            }
        }
        None
    }

    pub async fn is_idle(&self, idx: usize) -> bool {
        self.executors[idx].lock().await.state == ExecutorState::Idle
    }

    /// Runs one chunk on the executor at `idx`, which must already be
    /// claimed (`Busy`). Waits for `COMPLETE`/`ERROR` up to `timeout_ms`,
    /// forwarding intermediate `PROGRESS`/`METRICS` events to `on_event`.
    /// On timeout the executor is terminated and marked `Failed`.
    pub async fn execute_task(
        &self,
        idx: usize,
        task_id: TaskId,
        file_path: &str,
        chunk: ChunkDescriptor,
        batch_size: u32,
        timeout_ms: u64,
        mut on_event: impl FnMut(&WorkerEvent),
    ) -> QueueResult<WorkerResult> {
        let executor = self.executors.get(idx).ok_or_else(|| QueueError::Internal(format!("no executor at index {idx}")))?;
        let (cmd_tx, event_rx) = {
            let guard = executor.lock().await;
            (guard.cmd_tx.clone(), guard.event_rx.clone())
        };

        cmd_tx
            .send(WorkerCommand::Start { task_id, file_path: file_path.to_string(), chunk, batch_size })
            .await
            .map_err(|_| QueueError::Internal("executor command channel closed".to_string()))?;

        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let recv = tokio::time::timeout(remaining, event_rx.recv()).await;

            match recv {
                Err(_elapsed) => {
                    warn!(worker_id = idx, "chunk execution timed out, terminating executor");
                    self.terminate_one(idx).await;
                    return Err(QueueError::Timeout(format!("worker {idx} exceeded chunk timeout of {timeout_ms}ms")));
                }
                Ok(Err(_closed)) => {
                    executor.lock().await.state = ExecutorState::Failed;
                    return Err(QueueError::Internal(format!("executor {idx} event channel closed unexpectedly")));
                }
                Ok(Ok(event)) => match event {
                    WorkerEvent::Complete(result) => {
                        executor.lock().await.state = ExecutorState::Idle;
                        return Ok(result);
                    }
                    WorkerEvent::Error { message, .. } => {
                        executor.lock().await.state = ExecutorState::Idle;
                        return Err(QueueError::Internal(message));
                    }
                    other => on_event(&other),
                },
            }
        }
    }

    async fn terminate_one(&self, idx: usize) {
        if let Some(executor) = self.executors.get(idx) {
            let mut guard = executor.lock().await;
            let _ = guard.cmd_tx.send(WorkerCommand::Terminate).await;
            guard.state = ExecutorState::Failed;
        }
    }

    /// Posts TERMINATE to all executors; does not wait beyond `timeout_ms`
    /// for the OS threads to actually exit since they are detached.
    pub async fn terminate(&self, timeout_ms: u64) {
        for executor in &self.executors {
            let mut guard = executor.lock().await;
            let _ = tokio::time::timeout(Duration::from_millis(timeout_ms), guard.cmd_tx.send(WorkerCommand::Terminate)).await;
            guard.state = ExecutorState::Terminated;
        }
    }

    /// Re-spawns every executor currently `Failed`. Returns the count
    /// restarted.
    pub async fn restart_failed_workers(&mut self) -> u32 {
        let mut restarted = 0;
        for i in 0..self.executors.len() {
            let is_failed = self.executors[i].lock().await.state == ExecutorState::Failed;
            if !is_failed {
                continue;
            }
            self.executors[i] = spawn_executor(self.cleaner.clone(), self.repository.clone(), self.source_factory.clone(), self.runtime.clone());
            restarted += 1;
        }
        debug!(restarted, "restarted failed workers");
        restarted
    }

    /// True when fewer than half the executors are `Failed`.
    pub async fn is_healthy(&self) -> bool {
        let mut failed = 0;
        for executor in &self.executors {
            if executor.lock().await.state == ExecutorState::Failed {
                failed += 1;
            }
        }
        failed * 2 < self.executors.len().max(1)
    }
}

/// The executor contract (§4.13): read `[start_row, end_row)`, clean each
/// row, batch-insert every `batch_size` rows, emit PROGRESS every 1,000
/// rows and METRICS every 1,000ms, flush on STOP/TERMINATE.
fn executor_loop(
    cmd_rx: async_channel::Receiver<WorkerCommand>,
    event_tx: async_channel::Sender<WorkerEvent>,
    cleaner: Arc<dyn CleanRow>,
    repository: Arc<dyn FileRecordRepository>,
    source_factory: Arc<dyn Fn(&str) -> Box<dyn TabularSource> + Send + Sync>,
    rt: tokio::runtime::Handle,
) {
    while let Ok(command) = cmd_rx.recv_blocking() {
        match command {
            WorkerCommand::Terminate => break,
            WorkerCommand::Start { task_id, file_path, chunk, batch_size } => {
                let worker_id = chunk.chunk_id;
                let result = run_chunk(&cmd_rx, &event_tx, &cleaner, &repository, &source_factory, &rt, task_id, &file_path, chunk, batch_size);
                let event = match result {
                    Ok(result) => WorkerEvent::Complete(result),
                    Err(err) => WorkerEvent::Error { worker_id, message: err.to_string() },
                };
                if event_tx.send_blocking(event).is_err() {
                    break;
                }
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn run_chunk(
    cmd_rx: &async_channel::Receiver<WorkerCommand>,
    event_tx: &async_channel::Sender<WorkerEvent>,
    cleaner: &Arc<dyn CleanRow>,
    repository: &Arc<dyn FileRecordRepository>,
    source_factory: &Arc<dyn Fn(&str) -> Box<dyn TabularSource> + Send + Sync>,
    rt: &tokio::runtime::Handle,
    task_id: TaskId,
    file_path: &str,
    chunk: ChunkDescriptor,
    batch_size: u32,
) -> anyhow::Result<WorkerResult> {
    let started = Instant::now();
    let source = source_factory(file_path);
    let rows = source.read_range(chunk.start_row, chunk.end_row)?;

    let mut batch = RowBatch::default();
    let mut success_count = 0u64;
    let mut error_count = 0u64;
    let mut errors = Vec::new();
    let mut processed = 0u64;
    let mut last_metrics_report = Instant::now();

    for row in rows {
        // TERMINATE may arrive mid-chunk; flush what we have and stop.
        if let Ok(WorkerCommand::Terminate) = cmd_rx.try_recv() {
            flush_batch(rt, repository, task_id, chunk.chunk_id, std::mem::take(&mut batch))?;
            anyhow::bail!("terminated mid-chunk after {processed} rows");
        }

        match cleaner.clean(row.row_number, &row.fields) {
            RowOutcome::Clean(cleaned) => {
                batch.clean_rows.push((row.row_number, cleaned));
                success_count += 1;
            }
            RowOutcome::Error(message) => {
                batch.errors.push((row.row_number, message.clone()));
                errors.push(RowError { row_number: row.row_number, message });
                error_count += 1;
            }
        }
        processed += 1;

        if batch.clean_rows.len() as u32 + batch.errors.len() as u32 >= batch_size {
            flush_batch(rt, repository, task_id, chunk.chunk_id, std::mem::take(&mut batch))?;
        }

        if processed % 1000 == 0 {
            let _ = event_tx.send_blocking(WorkerEvent::Progress { worker_id: chunk.chunk_id, processed_rows: processed, total_rows: chunk.row_count() });
        }

        if last_metrics_report.elapsed() >= Duration::from_millis(1000) {
            let elapsed_secs = started.elapsed().as_secs_f64().max(0.001);
            let _ = event_tx.send_blocking(WorkerEvent::Metrics(WorkerMetrics {
                worker_id: chunk.chunk_id,
                cpu_percent: 0.0,
                rss_mb: 0,
                processed_rows: processed,
                throughput_rows_per_sec: processed as f64 / elapsed_secs,
            }));
            last_metrics_report = Instant::now();
        }
    }

    flush_batch(rt, repository, task_id, chunk.chunk_id, batch)?;

    Ok(WorkerResult { worker_id: chunk.chunk_id, success_count, error_count, processing_time_ms: started.elapsed().as_millis() as u64, errors })
}

fn flush_batch(rt: &tokio::runtime::Handle, repository: &Arc<dyn FileRecordRepository>, task_id: TaskId, chunk_id: u32, batch: RowBatch) -> anyhow::Result<()> {
    if batch.clean_rows.is_empty() && batch.errors.is_empty() {
        return Ok(());
    }
    rt.block_on(repository.insert_batch(task_id, chunk_id, batch))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::Mutex;
    use taskqueue_core::collaborators::{PassthroughCleaner, TabularRow};

    struct InMemorySource(Vec<Vec<String>>);

    impl TabularSource for InMemorySource {
        fn row_count(&self) -> anyhow::Result<u64> {
            Ok(self.0.len() as u64)
        }

        fn read_range(&self, start_row: u64, end_row: u64) -> anyhow::Result<Vec<TabularRow>> {
            Ok((start_row..end_row).map(|i| TabularRow { row_number: i, fields: self.0[i as usize].clone() }).collect())
        }

        fn size_bytes(&self) -> anyhow::Result<u64> {
            Ok(0)
        }
    }

    #[derive(Default)]
    struct RecordingRepository {
        inserted_rows: Mutex<u64>,
    }

    #[async_trait]
    impl FileRecordRepository for RecordingRepository {
        async fn insert_batch(&self, _task_id: TaskId, _chunk_id: u32, batch: RowBatch) -> anyhow::Result<()> {
            *self.inserted_rows.lock().unwrap() += (batch.clean_rows.len() + batch.errors.len()) as u64;
            Ok(())
        }

        async fn mark_enqueued(&self, _task_id: TaskId, _enqueued_at: DateTime<Utc>) -> anyhow::Result<()> {
            Ok(())
        }

        async fn mark_completed(&self, _task_id: TaskId, _completed_at: DateTime<Utc>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn executes_one_chunk_and_returns_to_idle() {
        let rows: Vec<Vec<String>> = (0..10).map(|i| vec![i.to_string()]).collect();
        let repository = Arc::new(RecordingRepository::default());
        let mut pool = WorkerPool::new(
            Arc::new(move |_path: &str| Box::new(InMemorySource(rows.clone())) as Box<dyn TabularSource>),
            Arc::new(PassthroughCleaner),
            repository.clone(),
        );
        pool.initialize(2);

        let idx = pool.claim_idle_executor().await.unwrap();
        let chunk = ChunkDescriptor { chunk_id: 0, start_row: 0, end_row: 10, estimated_size_bytes: 0 };
        let result = pool.execute_task(idx, uuid::Uuid::new_v4(), "ignored.csv", chunk, 1000, 5000, |_| {}).await.unwrap();

        assert_eq!(result.success_count, 10);
        assert_eq!(result.error_count, 0);
        assert_eq!(*repository.inserted_rows.lock().unwrap(), 10);
        assert!(pool.is_idle(idx).await);
    }

    #[tokio::test]
    async fn two_chunks_execute_concurrently_across_distinct_executors() {
        let rows: Vec<Vec<String>> = (0..10).map(|i| vec![i.to_string()]).collect();
        let repository = Arc::new(RecordingRepository::default());
        let pool = Arc::new({
            let mut pool = WorkerPool::new(
                Arc::new(move |_path: &str| Box::new(InMemorySource(rows.clone())) as Box<dyn TabularSource>),
                Arc::new(PassthroughCleaner),
                repository.clone(),
            );
            pool.initialize(2);
            pool
        });

        let idx_a = pool.claim_idle_executor().await.unwrap();
        let idx_b = pool.claim_idle_executor().await.unwrap();
        assert_ne!(idx_a, idx_b);

        let chunk_a = ChunkDescriptor { chunk_id: 0, start_row: 0, end_row: 5, estimated_size_bytes: 0 };
        let chunk_b = ChunkDescriptor { chunk_id: 1, start_row: 5, end_row: 10, estimated_size_bytes: 0 };

        let pool_a = pool.clone();
        let pool_b = pool.clone();
        let (result_a, result_b) = tokio::join!(
            pool_a.execute_task(idx_a, uuid::Uuid::new_v4(), "ignored.csv", chunk_a, 1000, 5000, |_| {}),
            pool_b.execute_task(idx_b, uuid::Uuid::new_v4(), "ignored.csv", chunk_b, 1000, 5000, |_| {}),
        );

        assert_eq!(result_a.unwrap().success_count, 5);
        assert_eq!(result_b.unwrap().success_count, 5);
    }

    #[tokio::test]
    async fn pool_reports_unhealthy_once_half_the_executors_fail() {
        let repository = Arc::new(RecordingRepository::default());
        let mut pool = WorkerPool::new(Arc::new(|_: &str| Box::new(InMemorySource(Vec::new())) as Box<dyn TabularSource>), Arc::new(PassthroughCleaner), repository);
        pool.initialize(2);
        assert!(pool.is_healthy().await);
        pool.terminate_one(0).await;
        assert!(!pool.is_healthy().await);
    }
}
