//! Tracks per-worker and overall progress for one in-flight file, enforcing
//! overall-progress monotonicity. Grounded in the teacher's
//! `layer2::progress_tracker::ProgressTracker` (`Arc<RwLock<HashMap<...>>>`
//! state plus a recomputed aggregate), generalized from per-task percentage
//! to per-worker row counts.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WorkerProgress {
    pub processed_rows: u64,
    pub total_rows: u64,
    pub last_updated: DateTime<Utc>,
}

impl WorkerProgress {
    fn percentage(&self) -> f64 {
        if self.total_rows == 0 {
            0.0
        } else {
            (self.processed_rows as f64 / self.total_rows as f64 * 100.0).min(100.0)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProgressStats {
    pub overall_progress: f64,
    pub workers_complete: u32,
    pub workers_total: u32,
}

const MILESTONES: [u64; 4] = [25, 50, 75, 100];

/// Milestone crossings recorded so a caller can log/emit each one exactly
/// once; `update_progress` returns any milestones newly crossed.
struct State {
    workers: HashMap<u32, WorkerProgress>,
    overall_progress: f64,
    crossed_milestones: Vec<u64>,
}

#[derive(Clone)]
pub struct ProgressTracker {
    state: Arc<RwLock<State>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self { state: Arc::new(RwLock::new(State { workers: HashMap::new(), overall_progress: 0.0, crossed_milestones: Vec::new() })) }
    }

    pub async fn reset(&self) {
        let mut state = self.state.write().await;
        state.workers.clear();
        state.overall_progress = 0.0;
        state.crossed_milestones.clear();
    }

    /// Records a worker's progress and recomputes the overall percentage as
    /// the row-weighted mean across all reporting workers. Invariant 4: the
    /// overall figure never decreases except immediately after `reset`.
    /// Returns the newly crossed milestones (25/50/75/100), if any.
    pub async fn update_progress(&self, worker_id: u32, processed_rows: u64, total_rows_for_worker: u64) -> Vec<u64> {
        let mut state = self.state.write().await;
        state.workers.insert(worker_id, WorkerProgress { processed_rows, total_rows: total_rows_for_worker, last_updated: Utc::now() });

        let (processed_sum, total_sum): (u64, u64) = state.workers.values().fold((0, 0), |(p, t), w| (p + w.processed_rows, t + w.total_rows));
        let computed = if total_sum == 0 { 0.0 } else { (processed_sum as f64 / total_sum as f64 * 100.0).min(100.0) };

        if computed < state.overall_progress {
            warn!(worker_id, computed, previous = state.overall_progress, "overall progress would regress, holding previous value");
        } else {
            state.overall_progress = computed;
        }

        let mut newly_crossed = Vec::new();
        for milestone in MILESTONES {
            if state.overall_progress >= milestone as f64 && !state.crossed_milestones.contains(&milestone) {
                state.crossed_milestones.push(milestone);
                newly_crossed.push(milestone);
            }
        }
        newly_crossed
    }

    pub async fn get_overall_progress(&self) -> f64 {
        self.state.read().await.overall_progress
    }

    pub async fn get_worker_progress(&self, worker_id: u32) -> Option<WorkerProgress> {
        self.state.read().await.workers.get(&worker_id).copied()
    }

    pub async fn is_all_workers_complete(&self, expected_workers: u32) -> bool {
        let state = self.state.read().await;
        state.workers.len() as u32 >= expected_workers && state.workers.values().all(|w| w.percentage() >= 100.0)
    }

    pub async fn get_progress_stats(&self) -> ProgressStats {
        let state = self.state.read().await;
        let workers_complete = state.workers.values().filter(|w| w.percentage() >= 100.0).count() as u32;
        ProgressStats { overall_progress: state.overall_progress, workers_complete, workers_total: state.workers.len() as u32 }
    }
}

impl Default for ProgressTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn overall_progress_is_row_weighted_mean() {
        let tracker = ProgressTracker::new();
        tracker.update_progress(0, 50, 100).await;
        tracker.update_progress(1, 100, 100).await;
        let overall = tracker.get_overall_progress().await;
        assert!((overall - 75.0).abs() < 0.001);
    }

    #[tokio::test]
    async fn overall_progress_never_regresses() {
        let tracker = ProgressTracker::new();
        tracker.update_progress(0, 90, 100).await;
        let before = tracker.get_overall_progress().await;
        tracker.update_progress(0, 10, 100).await;
        let after = tracker.get_overall_progress().await;
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn reset_clears_state_allowing_progress_to_drop() {
        let tracker = ProgressTracker::new();
        tracker.update_progress(0, 90, 100).await;
        tracker.reset().await;
        tracker.update_progress(0, 10, 100).await;
        assert_eq!(tracker.get_overall_progress().await, 10.0);
    }

    #[tokio::test]
    async fn milestones_are_reported_exactly_once() {
        let tracker = ProgressTracker::new();
        let crossed_first = tracker.update_progress(0, 30, 100).await;
        assert_eq!(crossed_first, vec![25]);
        let crossed_second = tracker.update_progress(0, 31, 100).await;
        assert!(crossed_second.is_empty());
    }

    #[tokio::test]
    async fn all_workers_complete_requires_every_expected_worker_to_report() {
        let tracker = ProgressTracker::new();
        tracker.update_progress(0, 100, 100).await;
        assert!(!tracker.is_all_workers_complete(2).await);
        tracker.update_progress(1, 100, 100).await;
        assert!(tracker.is_all_workers_complete(2).await);
    }
}
