//! Finds tasks stuck in `PROCESSING` beyond the abandonment threshold and
//! re-enqueues them. Runs once at startup and then on a periodic interval,
//! following the same background-loop shape as `TimeoutManager`.

use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use taskqueue_core::domain::{ProgressInfo, TaskId, TaskState, TaskStatusPatch};
use taskqueue_core::errors::QueueResult;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::queue_manager::{QueueManager, RedisConnectionLike};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryStats {
    pub checked: u64,
    pub abandoned: u64,
    pub recovered: u64,
    pub failed_to_recover: u64,
    pub duration_ms: u64,
}

pub struct RecoveryManager<C: RedisConnectionLike + 'static> {
    queue: Arc<AsyncMutex<QueueManager<C>>>,
    abandoned_task_threshold_ms: i64,
    recovery_batch_size: usize,
    max_retries: u32,
}

impl<C: RedisConnectionLike + 'static> RecoveryManager<C> {
    pub fn new(queue: Arc<AsyncMutex<QueueManager<C>>>, abandoned_task_threshold_ms: u64, recovery_batch_size: u32, max_retries: u32) -> Self {
        Self { queue, abandoned_task_threshold_ms: abandoned_task_threshold_ms as i64, recovery_batch_size: recovery_batch_size as usize, max_retries }
    }

    /// Scans `task:status:*` in batches, recovers anything abandoned, and
    /// sets a TTL on any status/progress record missing one.
    pub async fn run_once(&self) -> QueueResult<RecoveryStats> {
        let start = Instant::now();
        let mut stats = RecoveryStats::default();

        let keys = {
            let mut queue = self.queue.lock().await;
            queue.scan_status_keys().await?
        };

        for batch in keys.chunks(self.recovery_batch_size) {
            for key in batch {
                stats.checked += 1;
                let task_id = match key.rsplit(':').next().and_then(|s| s.parse::<TaskId>().ok()) {
                    Some(id) => id,
                    None => continue,
                };

                let status = {
                    let mut queue = self.queue.lock().await;
                    match queue.get_task_status(task_id).await {
                        Ok(s) => s,
                        Err(_) => continue,
                    }
                };

                if status.state != TaskState::Processing {
                    self.ensure_ttl_hygiene(task_id).await?;
                    continue;
                }

                let Some(started_at) = status.started_at else { continue };
                let age_ms = Utc::now().signed_duration_since(started_at).num_milliseconds();
                if age_ms <= self.abandoned_task_threshold_ms {
                    continue;
                }

                stats.abandoned += 1;
                match self.recover_task(task_id).await {
                    Ok(()) => stats.recovered += 1,
                    Err(err) => {
                        warn!(%task_id, %err, "failed to recover abandoned task");
                        stats.failed_to_recover += 1;
                    }
                }
            }
        }

        stats.duration_ms = start.elapsed().as_millis() as u64;
        info!(?stats, "recovery pass complete");
        Ok(stats)
    }

    async fn recover_task(&self, task_id: TaskId) -> QueueResult<()> {
        let mut queue = self.queue.lock().await;
        let task_data = queue.get_task_data(task_id).await?;

        let Some(task) = task_data else {
            queue
                .set_task_status(
                    task_id,
                    TaskState::Failed,
                    Some(TaskStatusPatch { error_message: Some("reconstruction_failed".to_string()), ..Default::default() }),
                )
                .await?;
            return Ok(());
        };

        // An abandoned task with no retries left must not be re-enqueued
        // (invariant 2: retryCount > maxRetries is never requeued; P3).
        if task.retry_count >= self.max_retries {
            queue
                .set_task_status(
                    task_id,
                    TaskState::Failed,
                    Some(TaskStatusPatch { completed_at: Some(Utc::now()), error_message: Some("abandoned: max retries exceeded".to_string()), ..Default::default() }),
                )
                .await?;
            queue.increment_total_failed().await?;
            return Ok(());
        }

        queue.set_task_status(task_id, TaskState::Pending, None).await?;
        queue.update_progress(&ProgressInfo::reset_for_recovery(task_id)).await?;
        let retried = task.with_incremented_retry();
        queue.enqueue_task(&retried).await?;
        Ok(())
    }

    async fn ensure_ttl_hygiene(&self, task_id: TaskId) -> QueueResult<()> {
        let mut queue = self.queue.lock().await;
        queue.ensure_ttl(&format!("task:status:{task_id}")).await?;
        queue.ensure_ttl(&format!("task:progress:{task_id}")).await?;
        Ok(())
    }

    pub fn spawn_periodic(self: Arc<Self>, interval_ms: u64, token: CancellationToken) {
        tokio::spawn(async move {
            if let Err(err) = self.run_once().await {
                warn!(%err, "initial recovery pass failed");
            }
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("recovery manager shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = self.run_once().await {
                            warn!(%err, "periodic recovery pass failed");
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue_manager::fake::new_fake_manager;
    use taskqueue_core::domain::ProcessingTask;

    #[tokio::test]
    async fn abandoned_processing_task_is_reset_and_reenqueued() {
        let queue = Arc::new(AsyncMutex::new(new_fake_manager("file-processing", 604_800)));
        let recovery = RecoveryManager::new(queue.clone(), 3_600_000, 50, 3);

        let task_id = uuid::Uuid::new_v4();
        let task = ProcessingTask::new(task_id, "f1".into(), "/tmp/f1.csv".into(), "f1.csv".into(), 100);
        {
            let mut q = queue.lock().await;
            q.enqueue_task(&task).await.unwrap();
            let _ = q.dequeue_task(1).await.unwrap();
            q.set_task_status(
                task_id,
                TaskState::Processing,
                Some(TaskStatusPatch { started_at: Some(Utc::now() - chrono::Duration::hours(2)), ..Default::default() }),
            )
            .await
            .unwrap();
        }

        let stats = recovery.run_once().await.unwrap();
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.recovered, 1);

        let mut q = queue.lock().await;
        let status = q.get_task_status(task_id).await.unwrap();
        assert_eq!(status.state, TaskState::Pending);
        let progress = q.get_progress(task_id).await.unwrap();
        assert_eq!(progress.current_phase, "recovered");
        assert_eq!(progress.progress, 0.0);

        let requeued = q.dequeue_task(1).await.unwrap().unwrap();
        assert_eq!(requeued.retry_count, 1);
    }

    #[tokio::test]
    async fn recently_started_processing_task_is_not_touched() {
        let queue = Arc::new(AsyncMutex::new(new_fake_manager("file-processing", 604_800)));
        let recovery = RecoveryManager::new(queue.clone(), 3_600_000, 50, 3);

        let task_id = uuid::Uuid::new_v4();
        let task = ProcessingTask::new(task_id, "f1".into(), "/tmp/f1.csv".into(), "f1.csv".into(), 100);
        {
            let mut q = queue.lock().await;
            q.enqueue_task(&task).await.unwrap();
            q.set_task_status(task_id, TaskState::Processing, Some(TaskStatusPatch { started_at: Some(Utc::now()), ..Default::default() }))
                .await
                .unwrap();
        }

        let stats = recovery.run_once().await.unwrap();
        assert_eq!(stats.abandoned, 0);
        assert_eq!(stats.recovered, 0);
    }

    #[tokio::test]
    async fn abandoned_task_at_max_retries_fails_instead_of_reenqueuing() {
        let queue = Arc::new(AsyncMutex::new(new_fake_manager("file-processing", 604_800)));
        let recovery = RecoveryManager::new(queue.clone(), 3_600_000, 50, 3);

        let task_id = uuid::Uuid::new_v4();
        let mut task = ProcessingTask::new(task_id, "f1".into(), "/tmp/f1.csv".into(), "f1.csv".into(), 100);
        task.retry_count = 3;
        {
            let mut q = queue.lock().await;
            q.enqueue_task(&task).await.unwrap();
            let _ = q.dequeue_task(1).await.unwrap();
            q.set_task_status(
                task_id,
                TaskState::Processing,
                Some(TaskStatusPatch { started_at: Some(Utc::now() - chrono::Duration::hours(2)), ..Default::default() }),
            )
            .await
            .unwrap();
        }

        let stats = recovery.run_once().await.unwrap();
        assert_eq!(stats.abandoned, 1);
        assert_eq!(stats.recovered, 1);

        let mut q = queue.lock().await;
        let status = q.get_task_status(task_id).await.unwrap();
        assert_eq!(status.state, TaskState::Failed);
        assert!(q.dequeue_task(1).await.unwrap().is_none());
    }
}
