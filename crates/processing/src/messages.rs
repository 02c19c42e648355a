//! The typed message protocol between `WorkerPool` and its worker
//! executors: `START`/`TERMINATE` flow in, `PROGRESS`/`METRICS`/`COMPLETE`/
//! `ERROR` flow out. Carried over `async_channel`, matching the teacher's
//! `layer4::executor`/`layer4::scheduler` dispatch-and-await-response shape.

use taskqueue_core::domain::{ChunkDescriptor, TaskId, WorkerResult};

#[derive(Debug, Clone)]
pub enum WorkerCommand {
    Start { task_id: TaskId, file_path: String, chunk: ChunkDescriptor, batch_size: u32 },
    Terminate,
}

#[derive(Debug, Clone)]
pub struct WorkerMetrics {
    pub worker_id: u32,
    pub cpu_percent: f32,
    pub rss_mb: u64,
    pub processed_rows: u64,
    pub throughput_rows_per_sec: f64,
}

#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Progress { worker_id: u32, processed_rows: u64, total_rows: u64 },
    Metrics(WorkerMetrics),
    Complete(WorkerResult),
    Error { worker_id: u32, message: String },
}
