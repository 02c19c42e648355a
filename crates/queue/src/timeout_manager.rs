//! Tracks per-task wall-clock deadlines and marks overruns as `TIMEOUT`.
//!
//! Grounded in the teacher's `layer1::system_monitor::SystemMonitor`
//! background-loop shape: a `tokio::spawn`ed task wakes on a
//! `tokio::time::interval` and polls shared state held behind a mutex,
//! responding to a `CancellationToken` for shutdown.

use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use taskqueue_core::domain::{TaskId, TaskState, TaskStatusPatch};
use taskqueue_core::errors::QueueResult;
use tokio::sync::Mutex as AsyncMutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::queue_manager::{QueueManager, RedisConnectionLike};

#[derive(Debug, Clone, Copy)]
struct TimeoutEntry {
    started_at: chrono::DateTime<Utc>,
    timeout_ms: u64,
}

pub struct TimeoutManager<C: RedisConnectionLike + 'static> {
    entries: Arc<StdMutex<HashMap<TaskId, TimeoutEntry>>>,
    queue: Arc<AsyncMutex<QueueManager<C>>>,
    default_timeout_ms: u64,
}

impl<C: RedisConnectionLike + 'static> Clone for TimeoutManager<C> {
    fn clone(&self) -> Self {
        Self { entries: self.entries.clone(), queue: self.queue.clone(), default_timeout_ms: self.default_timeout_ms }
    }
}

impl<C: RedisConnectionLike + 'static> TimeoutManager<C> {
    pub fn new(queue: Arc<AsyncMutex<QueueManager<C>>>, default_timeout_ms: u64) -> Self {
        Self { entries: Arc::new(StdMutex::new(HashMap::new())), queue, default_timeout_ms }
    }

    /// Starting a new timeout for an id replaces any existing one.
    pub fn start_timeout(&self, task_id: TaskId, timeout_ms: Option<u64>) {
        let entry = TimeoutEntry { started_at: Utc::now(), timeout_ms: timeout_ms.unwrap_or(self.default_timeout_ms) };
        self.entries.lock().unwrap().insert(task_id, entry);
    }

    pub fn clear_timeout(&self, task_id: TaskId) {
        self.entries.lock().unwrap().remove(&task_id);
    }

    pub fn extend_timeout(&self, task_id: TaskId, delta_ms: u64) {
        if let Some(entry) = self.entries.lock().unwrap().get_mut(&task_id) {
            entry.timeout_ms += delta_ms;
        }
    }

    pub fn is_task_timed_out(&self, task_id: TaskId) -> bool {
        match self.entries.lock().unwrap().get(&task_id) {
            Some(entry) => Self::has_expired(entry),
            None => false,
        }
    }

    fn has_expired(entry: &TimeoutEntry) -> bool {
        let elapsed = Utc::now().signed_duration_since(entry.started_at);
        elapsed.num_milliseconds() >= entry.timeout_ms as i64
    }

    /// Scans all tracked entries, transitions expired ones to `TIMEOUT`, and
    /// clears them. Returns the task ids that were just expired.
    pub async fn check_timeouts(&self) -> QueueResult<Vec<TaskId>> {
        let expired: Vec<TaskId> = {
            let entries = self.entries.lock().unwrap();
            entries.iter().filter(|(_, entry)| Self::has_expired(entry)).map(|(id, _)| *id).collect()
        };

        for task_id in &expired {
            let mut queue = self.queue.lock().await;
            queue
                .set_task_status(
                    *task_id,
                    TaskState::Timeout,
                    Some(TaskStatusPatch { error_message: Some("Task timed out".to_string()), ..Default::default() }),
                )
                .await?;
            self.entries.lock().unwrap().remove(task_id);
            warn!(%task_id, "task timed out");
        }
        Ok(expired)
    }

    /// Spawns the periodic `checkTimeouts` scheduler; cancel via `token`.
    pub fn spawn_background_checker(self: Arc<Self>, interval_ms: u64, token: CancellationToken) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                tokio::select! {
                    _ = token.cancelled() => {
                        info!("timeout manager shutting down");
                        break;
                    }
                    _ = ticker.tick() => {
                        if let Err(err) = self.check_timeouts().await {
                            warn!(%err, "timeout check failed");
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

    fn manager_with_fake_queue() -> TimeoutManager<std::sync::Arc<crate::queue_manager::fake::FakeRedis>> {
        let queue = new_fake_manager("file-processing", 604_800);
        TimeoutManager::new(Arc::new(AsyncMutex::new(queue)), 30_000)
    }

    #[test]
    fn starting_timeout_twice_keeps_only_most_recent() {
        let tm = manager_with_fake_queue();
        let task_id = uuid::Uuid::new_v4();
        tm.start_timeout(task_id, Some(10));
        std::thread::sleep(std::time::Duration::from_millis(20));
        tm.start_timeout(task_id, Some(10_000));
        assert!(!tm.is_task_timed_out(task_id));
    }

    #[tokio::test]
    async fn check_timeouts_transitions_expired_task() {
        let tm = manager_with_fake_queue();
        let task_id = uuid::Uuid::new_v4();
        tm.start_timeout(task_id, Some(0));
        tokio::time::sleep(Duration::from_millis(5)).await;

        let expired = tm.check_timeouts().await.unwrap();
        assert_eq!(expired, vec![task_id]);

        let status = tm.queue.lock().await.get_task_status(task_id).await.unwrap();
        assert_eq!(status.state, TaskState::Timeout);
        assert_eq!(status.error_message.as_deref(), Some("Task timed out"));
    }

    #[tokio::test]
    async fn clearing_a_timeout_prevents_later_expiry() {
        let tm = manager_with_fake_queue();
        let task_id = uuid::Uuid::new_v4();
        tm.start_timeout(task_id, Some(0));
        tm.clear_timeout(task_id);
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert!(tm.check_timeouts().await.unwrap().is_empty());
    }
}
