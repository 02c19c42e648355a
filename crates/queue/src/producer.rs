//! `TaskProducer`: the enqueue-side API used by upload handlers.
//!
//! File validation, temp-copy persistence, and the relational file-record
//! collaborator are all out of scope collaborators reached through
//! `taskqueue_core::collaborators`; this module only owns the queue
//! interaction and the partial-failure rule in step 4.

use chrono::Utc;
use std::sync::Arc;
use taskqueue_core::collaborators::FileRecordRepository;
use taskqueue_core::domain::{ProcessingTask, TaskId};
use taskqueue_core::errors::QueueResult;
use tokio::sync::Mutex as AsyncMutex;
use tracing::warn;

use crate::queue_manager::{QueueManager, RedisConnectionLike};

pub struct TaskProducer<C: RedisConnectionLike + 'static> {
    queue: Arc<AsyncMutex<QueueManager<C>>>,
    file_records: Arc<dyn FileRecordRepository>,
}

impl<C: RedisConnectionLike + 'static> TaskProducer<C> {
    pub fn new(queue: Arc<AsyncMutex<QueueManager<C>>>, file_records: Arc<dyn FileRecordRepository>) -> Self {
        Self { queue, file_records }
    }

    /// Enqueues `task` and updates the external file-record collaborator.
    /// If the file-record update fails after a successful enqueue, the task
    /// is still processed — the update is left for the consumer to retry on
    /// start, per the documented partial-failure rule.
    pub async fn create_processing_task(&self, task: ProcessingTask) -> QueueResult<TaskId> {
        let task_id = {
            let mut queue = self.queue.lock().await;
            queue.enqueue_task(&task).await?
        };

        if let Err(err) = self.file_records.mark_enqueued(task_id, Utc::now()).await {
            warn!(%task_id, %err, "file-record enqueue update failed, will be retried by the consumer");
        }

        Ok(task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue_manager::fake::new_fake_manager;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use taskqueue_core::collaborators::RowBatch;

    struct CountingRepository {
        mark_enqueued_calls: AtomicUsize,
    }

    #[async_trait]
    impl FileRecordRepository for CountingRepository {
        async fn insert_batch(&self, _task_id: TaskId, _chunk_id: u32, _batch: RowBatch) -> anyhow::Result<()> {
            Ok(())
        }

        async fn mark_enqueued(&self, _task_id: TaskId, _enqueued_at: chrono::DateTime<Utc>) -> anyhow::Result<()> {
            self.mark_enqueued_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn mark_completed(&self, _task_id: TaskId, _completed_at: chrono::DateTime<Utc>) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn create_processing_task_enqueues_and_updates_file_record() {
        let queue = Arc::new(AsyncMutex::new(new_fake_manager("file-processing", 604_800)));
        let repo = Arc::new(CountingRepository { mark_enqueued_calls: AtomicUsize::new(0) });
        let producer = TaskProducer::new(queue.clone(), repo.clone());

        let task = ProcessingTask::new(uuid::Uuid::new_v4(), "f1".into(), "/tmp/f1.csv".into(), "f1.csv".into(), 10);
        let task_id = producer.create_processing_task(task.clone()).await.unwrap();

        assert_eq!(task_id, task.task_id);
        assert_eq!(repo.mark_enqueued_calls.load(Ordering::SeqCst), 1);

        let dequeued = queue.lock().await.dequeue_task(1).await.unwrap().unwrap();
        assert_eq!(dequeued.task_id, task.task_id);
    }
}
