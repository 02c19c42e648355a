//! Periodic CPU/memory/throughput sampling plus a merge of the workers'
//! self-reported `WorkerMetrics`. Grounded in the teacher's
//! `layer1::system_monitor::SystemMonitor` (`Arc<Mutex<...>>` state driven
//! by a `tokio::spawn` + `tokio::time::interval` loop), swapping the
//! discovery-alert domain for throughput/CPU/RSS sampling via `sysinfo`.

use std::sync::Arc;
use sysinfo::{Pid, System};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::messages::WorkerMetrics;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerformanceReport {
    pub avg_cpu_percent: f32,
    pub peak_cpu_percent: f32,
    pub avg_rss_mb: u64,
    pub peak_rss_mb: u64,
    pub avg_throughput_rows_per_sec: f64,
    pub peak_throughput_rows_per_sec: f64,
    pub sample_count: usize,
}

#[derive(Default)]
struct Samples {
    cpu: Vec<f32>,
    rss: Vec<u64>,
    throughput: Vec<f64>,
    worker_metrics: Vec<WorkerMetrics>,
}

pub struct PerformanceMonitor {
    samples: Arc<Mutex<Samples>>,
    cancel: Mutex<Option<CancellationToken>>,
    sample_interval_ms: u64,
}

impl PerformanceMonitor {
    pub fn new(sample_interval_ms: u64) -> Self {
        Self { samples: Arc::new(Mutex::new(Samples::default())), cancel: Mutex::new(None), sample_interval_ms }
    }

    /// Records a worker-reported sample (CPU/RSS taken from the worker's own
    /// process view, throughput computed by the worker).
    pub async fn record_worker_metrics(&self, metrics: WorkerMetrics) {
        let mut samples = self.samples.lock().await;
        samples.cpu.push(metrics.cpu_percent);
        samples.rss.push(metrics.rss_mb);
        samples.throughput.push(metrics.throughput_rows_per_sec);
        samples.worker_metrics.push(metrics);
    }

    /// Starts a background loop sampling this process's own CPU/RSS via
    /// `sysinfo`, as a process-wide complement to per-worker self-reports.
    pub async fn start(&self) {
        let mut guard = self.cancel.lock().await;
        if guard.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *guard = Some(token.clone());
        drop(guard);

        let samples = self.samples.clone();
        let interval_ms = self.sample_interval_ms;
        let pid = Pid::from_u32(std::process::id());

        tokio::spawn(async move {
            let mut sys = System::new();
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        sys.refresh_process(pid);
                        if let Some(process) = sys.process(pid) {
                            let mut s = samples.lock().await;
                            s.cpu.push(process.cpu_usage());
                            s.rss.push(process.memory() / 1024 / 1024);
                        }
                    }
                }
            }
        });
    }

    pub async fn stop(&self) -> PerformanceReport {
        if let Some(token) = self.cancel.lock().await.take() {
            token.cancel();
        }
        self.report().await
    }

    pub async fn report(&self) -> PerformanceReport {
        let samples = self.samples.lock().await;
        let avg = |v: &[f32]| if v.is_empty() { 0.0 } else { v.iter().sum::<f32>() / v.len() as f32 };
        let avg_u64 = |v: &[u64]| if v.is_empty() { 0 } else { v.iter().sum::<u64>() / v.len() as u64 };
        let avg_f64 = |v: &[f64]| if v.is_empty() { 0.0 } else { v.iter().sum::<f64>() / v.len() as f64 };

        debug!(samples = samples.cpu.len(), "building performance report");

        PerformanceReport {
            avg_cpu_percent: avg(&samples.cpu),
            peak_cpu_percent: samples.cpu.iter().copied().fold(0.0, f32::max),
            avg_rss_mb: avg_u64(&samples.rss),
            peak_rss_mb: samples.rss.iter().copied().max().unwrap_or(0),
            avg_throughput_rows_per_sec: avg_f64(&samples.throughput),
            peak_throughput_rows_per_sec: samples.throughput.iter().copied().fold(0.0, f64::max),
            sample_count: samples.cpu.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn merges_worker_metrics_into_peak_and_average() {
        let monitor = PerformanceMonitor::new(1000);
        monitor.record_worker_metrics(WorkerMetrics { worker_id: 0, cpu_percent: 10.0, rss_mb: 100, processed_rows: 100, throughput_rows_per_sec: 500.0 }).await;
        monitor.record_worker_metrics(WorkerMetrics { worker_id: 1, cpu_percent: 30.0, rss_mb: 200, processed_rows: 200, throughput_rows_per_sec: 900.0 }).await;

        let report = monitor.report().await;
        assert_eq!(report.sample_count, 2);
        assert_eq!(report.peak_cpu_percent, 30.0);
        assert_eq!(report.peak_rss_mb, 200);
        assert!((report.avg_throughput_rows_per_sec - 700.0).abs() < 0.001);
    }

    #[tokio::test]
    async fn stop_without_start_returns_empty_report() {
        let monitor = PerformanceMonitor::new(1000);
        let report = monitor.stop().await;
        assert_eq!(report.sample_count, 0);
    }
}
