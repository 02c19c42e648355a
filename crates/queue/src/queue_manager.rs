//! Primitive operations over the task queue, status map, progress map, and
//! counters. Built on `redis::aio::ConnectionManager`, grounded in the
//! teacher's `IntegrationManager::new` (`redis::Client::open(...).get_connection_manager()`)
//! and its `AsyncCommands`-based Redis calls.
//!
//! All Redis access goes through `RedisConnectionLike` rather than the
//! concrete `ConnectionManager` so tests can substitute an in-memory double
//! instead of a live Redis instance.

use async_trait::async_trait;
use chrono::Utc;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::collections::HashMap;
use std::time::Duration;
use taskqueue_core::domain::{ProcessingTask, ProgressInfo, QueueStats, TaskId, TaskState, TaskStatusInfo, TaskStatusPatch};
use taskqueue_core::errors::{QueueError, QueueResult};
use tracing::{error, warn};

/// The subset of Redis commands `QueueManager` needs, narrow enough that a
/// deterministic in-memory fake can implement it for tests.
#[async_trait]
pub trait RedisConnectionLike: Send + Sync {
    async fn lpush(&mut self, key: &str, value: String) -> QueueResult<()>;
    async fn brpop(&mut self, key: &str, timeout_secs: f64) -> QueueResult<Option<String>>;
    async fn llen(&mut self, key: &str) -> QueueResult<u64>;
    async fn hset_all(&mut self, key: &str, fields: Vec<(String, String)>) -> QueueResult<()>;
    async fn hgetall(&mut self, key: &str) -> QueueResult<HashMap<String, String>>;
    async fn expire(&mut self, key: &str, ttl_secs: i64) -> QueueResult<()>;
    async fn ttl(&mut self, key: &str) -> QueueResult<i64>;
    async fn hincrby(&mut self, key: &str, field: &str, delta: i64) -> QueueResult<i64>;
    async fn del(&mut self, key: &str) -> QueueResult<()>;
    async fn scan_keys(&mut self, pattern: &str) -> QueueResult<Vec<String>>;
    async fn ping(&mut self) -> QueueResult<()>;
}

#[async_trait]
impl RedisConnectionLike for ConnectionManager {
    async fn lpush(&mut self, key: &str, value: String) -> QueueResult<()> {
        self.lpush(key, value).await.map_err(QueueError::from)
    }

    async fn brpop(&mut self, key: &str, timeout_secs: f64) -> QueueResult<Option<String>> {
        let result: Option<(String, String)> = self.brpop(key, timeout_secs).await.map_err(QueueError::from)?;
        Ok(result.map(|(_, value)| value))
    }

    async fn llen(&mut self, key: &str) -> QueueResult<u64> {
        self.llen(key).await.map_err(QueueError::from)
    }

    async fn hset_all(&mut self, key: &str, fields: Vec<(String, String)>) -> QueueResult<()> {
        let _: () = self.hset_multiple(key, &fields).await.map_err(QueueError::from)?;
        Ok(())
    }

    async fn hgetall(&mut self, key: &str) -> QueueResult<HashMap<String, String>> {
        self.hgetall(key).await.map_err(QueueError::from)
    }

    async fn expire(&mut self, key: &str, ttl_secs: i64) -> QueueResult<()> {
        let _: () = self.expire(key, ttl_secs).await.map_err(QueueError::from)?;
        Ok(())
    }

    async fn ttl(&mut self, key: &str) -> QueueResult<i64> {
        self.ttl(key).await.map_err(QueueError::from)
    }

    async fn hincrby(&mut self, key: &str, field: &str, delta: i64) -> QueueResult<i64> {
        self.hincr(key, field, delta).await.map_err(QueueError::from)
    }

    async fn del(&mut self, key: &str) -> QueueResult<()> {
        let _: () = self.del(key).await.map_err(QueueError::from)?;
        Ok(())
    }

    async fn scan_keys(&mut self, pattern: &str) -> QueueResult<Vec<String>> {
        let mut conn = self.clone();
        let iter: redis::AsyncIter<'_, String> = conn.scan_match(pattern).await.map_err(QueueError::from)?;
        use futures::StreamExt;
        Ok(iter.collect().await)
    }

    async fn ping(&mut self) -> QueueResult<()> {
        redis::cmd("PING").query_async(self).await.map_err(QueueError::from)
    }
}

const TASK_STATUS_PREFIX: &str = "task:status:";
const TASK_PROGRESS_PREFIX: &str = "task:progress:";
const TASK_DATA_PREFIX: &str = "task:data:";
const QUEUE_STATS_KEY: &str = "queue:stats";

/// Reconnection policy applied on connection failure: exponential backoff,
/// base 1s, factor 2, capped at 5 attempts. Commands issued while
/// disconnected fail fast with `Unavailable` rather than buffering, per the
/// deliberately simplified single reconnection policy (see DESIGN.md).
const RECONNECT_BASE_DELAY_MS: u64 = 1000;
const RECONNECT_MAX_ATTEMPTS: u32 = 5;

pub struct QueueManager<C: RedisConnectionLike> {
    conn: C,
    queue_name: String,
    task_ttl_seconds: u64,
}

impl QueueManager<ConnectionManager> {
    pub async fn connect(redis_url: &str, queue_name: impl Into<String>, task_ttl_seconds: u64) -> QueueResult<Self> {
        let conn = Self::connect_with_retry(redis_url).await?;
        Ok(Self { conn, queue_name: queue_name.into(), task_ttl_seconds })
    }

    async fn connect_with_retry(redis_url: &str) -> QueueResult<ConnectionManager> {
        let mut attempt = 0;
        loop {
            let client = redis::Client::open(redis_url).map_err(QueueError::from)?;
            match client.get_connection_manager().await {
                Ok(conn) => return Ok(conn),
                Err(err) if attempt + 1 >= RECONNECT_MAX_ATTEMPTS => {
                    error!(attempt, "redis connection failed after max attempts");
                    return Err(QueueError::Unavailable(err.to_string()));
                }
                Err(err) => {
                    let delay_ms = RECONNECT_BASE_DELAY_MS * (1u64 << attempt);
                    warn!(attempt, %err, delay_ms, "redis connection failed, retrying");
                    tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                    attempt += 1;
                }
            }
        }
    }
}

impl<C: RedisConnectionLike> QueueManager<C> {
    pub fn with_connection(conn: C, queue_name: impl Into<String>, task_ttl_seconds: u64) -> Self {
        Self { conn, queue_name: queue_name.into(), task_ttl_seconds }
    }

    fn status_key(task_id: TaskId) -> String {
        format!("{TASK_STATUS_PREFIX}{task_id}")
    }

    fn progress_key(task_id: TaskId) -> String {
        format!("{TASK_PROGRESS_PREFIX}{task_id}")
    }

    fn data_key(task_id: TaskId) -> String {
        format!("{TASK_DATA_PREFIX}{task_id}")
    }

    /// Pushes `task` to the left of the queue list, writes the initial
    /// status (`PENDING`) and progress records, and increments
    /// `totalEnqueued`. All writes get a TTL of `task_ttl_seconds`.
    pub async fn enqueue_task(&mut self, task: &ProcessingTask) -> QueueResult<TaskId> {
        let payload = serde_json::to_string(task)?;
        self.conn.lpush(&self.queue_name, payload.clone()).await?;

        let created_at = Utc::now();
        let status = TaskStatusInfo::pending(task.task_id, created_at);
        self.write_status(task.task_id, &status).await?;

        let progress = ProgressInfo::initial(task.task_id);
        self.write_progress(task.task_id, &progress).await?;

        self.conn.hset_all(&self.data_key(task.task_id), vec![("payload".to_string(), payload)]).await?;
        self.conn.expire(&self.data_key(task.task_id), self.task_ttl_seconds as i64).await?;

        self.conn.hincrby(QUEUE_STATS_KEY, "totalEnqueued", 1).await?;
        Ok(task.task_id)
    }

    /// Blocking right-pop: LPUSH + BRPOP gives FIFO. Returns `None` on
    /// timeout.
    pub async fn dequeue_task(&mut self, timeout_seconds: u64) -> QueueResult<Option<ProcessingTask>> {
        let raw = self.conn.brpop(&self.queue_name, timeout_seconds as f64).await?;
        match raw {
            Some(payload) => Ok(Some(serde_json::from_str(&payload)?)),
            None => Ok(None),
        }
    }

    async fn write_status(&mut self, task_id: TaskId, status: &TaskStatusInfo) -> QueueResult<()> {
        let key = Self::status_key(task_id);
        let mut fields = vec![
            ("taskId".to_string(), task_id.to_string()),
            ("status".to_string(), status.state.to_string()),
            ("createdAt".to_string(), status.created_at.to_rfc3339()),
        ];
        if let Some(started_at) = status.started_at {
            fields.push(("startedAt".to_string(), started_at.to_rfc3339()));
        }
        if let Some(completed_at) = status.completed_at {
            fields.push(("completedAt".to_string(), completed_at.to_rfc3339()));
        }
        if let Some(ref message) = status.error_message {
            fields.push(("errorMessage".to_string(), message.clone()));
        }
        if let Some(ref statistics) = status.statistics {
            fields.push(("statistics".to_string(), serde_json::to_string(statistics)?));
        }
        self.conn.hset_all(&key, fields).await?;
        self.conn.expire(&key, self.task_ttl_seconds as i64).await?;
        Ok(())
    }

    /// Upserts the status record, applying a sparse `patch` over whatever is
    /// already stored, then refreshes the TTL.
    pub async fn set_task_status(&mut self, task_id: TaskId, state: TaskState, patch: Option<TaskStatusPatch>) -> QueueResult<()> {
        let mut status = self.get_task_status(task_id).await.unwrap_or_else(|_| TaskStatusInfo::pending(task_id, Utc::now()));
        status.state = state;
        if let Some(patch) = patch {
            if patch.started_at.is_some() {
                status.started_at = patch.started_at;
            }
            if patch.completed_at.is_some() {
                status.completed_at = patch.completed_at;
            }
            if patch.error_message.is_some() {
                status.error_message = patch.error_message;
            }
            if patch.statistics.is_some() {
                status.statistics = patch.statistics;
            }
        }
        self.write_status(task_id, &status).await
    }

    pub async fn get_task_status(&mut self, task_id: TaskId) -> QueueResult<TaskStatusInfo> {
        let fields = self.conn.hgetall(&Self::status_key(task_id)).await?;
        if fields.is_empty() {
            return Err(QueueError::NotFound(task_id));
        }
        let state: TaskState = fields.get("status").ok_or(QueueError::NotFound(task_id))?.parse().map_err(QueueError::Internal)?;
        let created_at = fields
            .get("createdAt")
            .and_then(|v| chrono::DateTime::parse_from_rfc3339(v).ok())
            .map(|d| d.with_timezone(&Utc))
            .unwrap_or_else(Utc::now);
        let started_at = fields.get("startedAt").and_then(|v| chrono::DateTime::parse_from_rfc3339(v).ok()).map(|d| d.with_timezone(&Utc));
        let completed_at = fields.get("completedAt").and_then(|v| chrono::DateTime::parse_from_rfc3339(v).ok()).map(|d| d.with_timezone(&Utc));
        let error_message = fields.get("errorMessage").cloned();
        let statistics = match fields.get("statistics") {
            Some(raw) => Some(serde_json::from_str(raw)?),
            None => None,
        };
        Ok(TaskStatusInfo { task_id, state, created_at, started_at, completed_at, error_message, statistics })
    }

    async fn write_progress(&mut self, task_id: TaskId, progress: &ProgressInfo) -> QueueResult<()> {
        let key = Self::progress_key(task_id);
        let fields = vec![
            ("taskId".to_string(), task_id.to_string()),
            ("progress".to_string(), progress.progress.to_string()),
            ("processedRows".to_string(), progress.processed_rows.to_string()),
            ("totalRows".to_string(), progress.total_rows.to_string()),
            ("currentPhase".to_string(), progress.current_phase.clone()),
            ("estimatedTimeRemaining".to_string(), progress.eta_ms.map(|v| v.to_string()).unwrap_or_default()),
            ("lastUpdated".to_string(), progress.last_updated.to_rfc3339()),
        ];
        self.conn.hset_all(&key, fields).await?;
        self.conn.expire(&key, self.task_ttl_seconds as i64).await?;
        Ok(())
    }

    pub async fn update_progress(&mut self, progress: &ProgressInfo) -> QueueResult<()> {
        self.write_progress(progress.task_id, progress).await
    }

    pub async fn get_progress(&mut self, task_id: TaskId) -> QueueResult<ProgressInfo> {
        let fields = self.conn.hgetall(&Self::progress_key(task_id)).await?;
        if fields.is_empty() {
            return Err(QueueError::NotFound(task_id));
        }
        Ok(ProgressInfo {
            task_id,
            progress: fields.get("progress").and_then(|v| v.parse().ok()).unwrap_or(0.0),
            processed_rows: fields.get("processedRows").and_then(|v| v.parse().ok()).unwrap_or(0),
            total_rows: fields.get("totalRows").and_then(|v| v.parse().ok()).unwrap_or(0),
            current_phase: fields.get("currentPhase").cloned().unwrap_or_default(),
            eta_ms: fields.get("estimatedTimeRemaining").and_then(|v| v.parse().ok()),
            last_updated: fields
                .get("lastUpdated")
                .and_then(|v| chrono::DateTime::parse_from_rfc3339(v).ok())
                .map(|d| d.with_timezone(&Utc))
                .unwrap_or_else(Utc::now),
        })
    }

    pub async fn get_queue_stats(&mut self) -> QueueResult<QueueStats> {
        let queue_length = self.conn.llen(&self.queue_name).await?;
        let fields = self.conn.hgetall(QUEUE_STATS_KEY).await?;
        Ok(QueueStats {
            queue_length,
            total_enqueued: fields.get("totalEnqueued").and_then(|v| v.parse().ok()).unwrap_or(0),
            total_processed: fields.get("totalProcessed").and_then(|v| v.parse().ok()).unwrap_or(0),
            total_failed: fields.get("totalFailed").and_then(|v| v.parse().ok()).unwrap_or(0),
            active_workers: fields.get("activeWorkers").and_then(|v| v.parse().ok()).unwrap_or(0),
        })
    }

    pub async fn increment_total_processed(&mut self) -> QueueResult<()> {
        self.conn.hincrby(QUEUE_STATS_KEY, "totalProcessed", 1).await?;
        Ok(())
    }

    pub async fn increment_total_failed(&mut self) -> QueueResult<()> {
        self.conn.hincrby(QUEUE_STATS_KEY, "totalFailed", 1).await?;
        Ok(())
    }

    pub async fn is_healthy(&mut self) -> bool {
        self.conn.ping().await.is_ok()
    }

    pub async fn clear_queue(&mut self) -> QueueResult<()> {
        self.conn.del(&self.queue_name).await
    }

    /// Reads back the `task:data:<taskId>` payload snapshot used by recovery
    /// to reconstruct a `ProcessingTask` for a task stuck in `PROCESSING`.
    pub async fn get_task_data(&mut self, task_id: TaskId) -> QueueResult<Option<ProcessingTask>> {
        let fields = self.conn.hgetall(&Self::data_key(task_id)).await?;
        match fields.get("payload") {
            Some(payload) => Ok(Some(serde_json::from_str(payload)?)),
            None => Ok(None),
        }
    }

    pub async fn scan_status_keys(&mut self) -> QueueResult<Vec<String>> {
        self.conn.scan_keys(&format!("{TASK_STATUS_PREFIX}*")).await
    }

    pub async fn ensure_ttl(&mut self, key: &str) -> QueueResult<()> {
        let ttl = self.conn.ttl(key).await?;
        if ttl < 0 {
            self.conn.expire(key, self.task_ttl_seconds as i64).await?;
        }
        Ok(())
    }
}
