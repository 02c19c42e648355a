//! Core domain records shared by the queue and processing subsystems.
//!
//! Every type here round-trips through Redis (as a JSON blob or a hash of
//! stringified fields) so all derive `Serialize`/`Deserialize`. Field names
//! intentionally mirror the Redis hash field names in `spec.md` §6 so the
//! mapping between a `TaskStatusInfo` and its `task:status:<taskId>` hash is
//! mechanical.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for a processing task. Producers set this to the
/// upstream file record's job id so the two systems share one key.
pub type TaskId = Uuid;

/// A unit of work describing one file to clean.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingTask {
    pub task_id: TaskId,
    pub file_id: String,
    pub file_path: String,
    pub original_file_name: String,
    pub file_size: u64,
    pub created_at: DateTime<Utc>,
    pub retry_count: u32,
}

impl ProcessingTask {
    pub fn new(task_id: TaskId, file_id: String, file_path: String, original_file_name: String, file_size: u64) -> Self {
        Self {
            task_id,
            file_id,
            file_path,
            original_file_name,
            file_size,
            created_at: Utc::now(),
            retry_count: 0,
        }
    }

    /// Builds the task that should be re-enqueued after a retryable
    /// failure or a recovery reset: same identity, `retry_count` bumped.
    pub fn with_incremented_retry(&self) -> Self {
        let mut next = self.clone();
        next.retry_count += 1;
        next
    }
}

/// Lifecycle state of a `ProcessingTask`. See spec.md §3/§7 for the
/// transition table: PENDING -> PROCESSING -> {COMPLETED, FAILED, TIMEOUT}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskState {
    Pending,
    Processing,
    Completed,
    Failed,
    Timeout,
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TaskState::Pending => "PENDING",
            TaskState::Processing => "PROCESSING",
            TaskState::Completed => "COMPLETED",
            TaskState::Failed => "FAILED",
            TaskState::Timeout => "TIMEOUT",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(TaskState::Pending),
            "PROCESSING" => Ok(TaskState::Processing),
            "COMPLETED" => Ok(TaskState::Completed),
            "FAILED" => Ok(TaskState::Failed),
            "TIMEOUT" => Ok(TaskState::Timeout),
            other => Err(format!("unknown task state: {other}")),
        }
    }
}

/// Aggregate statistics recorded once a task reaches a terminal state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatistics {
    pub total_rows: u64,
    pub success_count: u64,
    pub error_count: u64,
}

impl TaskStatistics {
    /// Invariant P1 / spec.md §3 invariant 3.
    pub fn is_data_integrity_sound(&self) -> bool {
        self.success_count + self.error_count == self.total_rows
    }
}

/// The `task:status:<taskId>` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatusInfo {
    pub task_id: TaskId,
    pub state: TaskState,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub statistics: Option<TaskStatistics>,
}

impl TaskStatusInfo {
    pub fn pending(task_id: TaskId, created_at: DateTime<Utc>) -> Self {
        Self {
            task_id,
            state: TaskState::Pending,
            created_at,
            started_at: None,
            completed_at: None,
            error_message: None,
            statistics: None,
        }
    }
}

/// A sparse update applied to a `TaskStatusInfo`; `None` fields are left
/// untouched by `QueueManager::set_task_status`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskStatusPatch {
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub statistics: Option<TaskStatistics>,
}

/// The `task:progress:<taskId>` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressInfo {
    pub task_id: TaskId,
    pub progress: f64,
    pub processed_rows: u64,
    pub total_rows: u64,
    pub current_phase: String,
    pub eta_ms: Option<u64>,
    pub last_updated: DateTime<Utc>,
}

impl ProgressInfo {
    pub fn initial(task_id: TaskId) -> Self {
        Self {
            task_id,
            progress: 0.0,
            processed_rows: 0,
            total_rows: 0,
            current_phase: "queued".to_string(),
            eta_ms: None,
            last_updated: Utc::now(),
        }
    }

    /// Resets progress to zero with the `recovered` phase, per spec.md §4.6
    /// step 3 and invariant 4's documented exception to monotonicity.
    pub fn reset_for_recovery(task_id: TaskId) -> Self {
        Self {
            task_id,
            progress: 0.0,
            processed_rows: 0,
            total_rows: 0,
            current_phase: "recovered".to_string(),
            eta_ms: None,
            last_updated: Utc::now(),
        }
    }
}

/// A contiguous, immutable row range assigned to one worker executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDescriptor {
    pub chunk_id: u32,
    pub start_row: u64,
    pub end_row: u64,
    pub estimated_size_bytes: u64,
}

impl ChunkDescriptor {
    pub fn row_count(&self) -> u64 {
        self.end_row - self.start_row
    }
}

/// A single row-cleaning error surfaced by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowError {
    pub row_number: u64,
    pub message: String,
}

/// The outcome of one worker executor finishing its assigned chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResult {
    pub worker_id: u32,
    pub success_count: u64,
    pub error_count: u64,
    pub processing_time_ms: u64,
    pub errors: Vec<RowError>,
}

/// The `queue:stats` hash — monotonic counters plus a live queue length.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub queue_length: u64,
    pub total_enqueued: u64,
    pub total_processed: u64,
    pub total_failed: u64,
    pub active_workers: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statistics_integrity_holds_only_when_counts_sum_to_total() {
        let good = TaskStatistics { total_rows: 1000, success_count: 950, error_count: 50 };
        assert!(good.is_data_integrity_sound());

        let bad = TaskStatistics { total_rows: 1000, success_count: 950, error_count: 49 };
        assert!(!bad.is_data_integrity_sound());
    }

    #[test]
    fn task_state_round_trips_through_display_and_from_str() {
        for state in [
            TaskState::Pending,
            TaskState::Processing,
            TaskState::Completed,
            TaskState::Failed,
            TaskState::Timeout,
        ] {
            let s = state.to_string();
            assert_eq!(s.parse::<TaskState>().unwrap(), state);
        }
    }

    #[test]
    fn retry_increment_preserves_identity() {
        let task = ProcessingTask::new(Uuid::new_v4(), "f1".into(), "/tmp/f1.csv".into(), "f1.csv".into(), 10);
        let retried = task.with_incremented_retry();
        assert_eq!(retried.task_id, task.task_id);
        assert_eq!(retried.retry_count, task.retry_count + 1);
    }

    #[test]
    fn chunk_row_count_is_exclusive_end() {
        let c = ChunkDescriptor { chunk_id: 0, start_row: 10, end_row: 20, estimated_size_bytes: 0 };
        assert_eq!(c.row_count(), 10);
    }
}
