//! Accumulates per-chunk `WorkerResult`s into the task-level totals,
//! enforcing the data-integrity invariant that `success + error == total`.

use taskqueue_core::domain::{RowError, WorkerResult};
use taskqueue_core::errors::{QueueError, QueueResult};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectedResult {
    pub total_rows: u64,
    pub success_count: u64,
    pub error_count: u64,
    pub errors: Vec<RowError>,
}

pub struct ResultCollector {
    expected_worker_count: u32,
    total_input_rows: u64,
    received: Vec<WorkerResult>,
}

impl ResultCollector {
    pub fn new() -> Self {
        Self { expected_worker_count: 0, total_input_rows: 0, received: Vec::new() }
    }

    pub fn initialize(&mut self, expected_worker_count: u32, total_input_rows: u64) {
        self.expected_worker_count = expected_worker_count;
        self.total_input_rows = total_input_rows;
        self.received.clear();
    }

    pub fn add_result(&mut self, result: WorkerResult) {
        self.received.push(result);
    }

    pub fn is_complete(&self) -> bool {
        self.received.len() as u32 >= self.expected_worker_count
    }

    pub fn get_partial_result(&self) -> CollectedResult {
        let success_count = self.received.iter().map(|r| r.success_count).sum();
        let error_count = self.received.iter().map(|r| r.error_count).sum();
        let errors = self.received.iter().flat_map(|r| r.errors.clone()).collect();
        CollectedResult { total_rows: self.total_input_rows, success_count, error_count, errors }
    }

    /// Returns the combined result, or `QueueError::Integrity` if the
    /// counts don't sum to the expected total row count (invariant 3).
    pub fn get_final_result(&self) -> QueueResult<CollectedResult> {
        let result = self.get_partial_result();
        if result.success_count + result.error_count != self.total_input_rows {
            return Err(QueueError::Integrity(format!(
                "worker results cover {} rows, expected {}",
                result.success_count + result.error_count,
                self.total_input_rows
            )));
        }
        Ok(result)
    }
}

impl Default for ResultCollector {
    fn default() -> Self {
        Self::new()
    }
}
