//! Guards memory/CPU pressure during a file's processing, gating new worker
//! creation once usage has exceeded its limit for several consecutive
//! checks. Grounded in the teacher's `layer1::system_monitor::SystemMonitor`
//! threshold-and-alert shape, narrowed to the two resources spec'd here.

use std::sync::Arc;
use std::time::{Duration, Instant};
use sysinfo::{Pid, System};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResourceLimits {
    pub max_memory_mb: u64,
    pub max_cpu_usage: f32,
    pub memory_warning_threshold_mb: u64,
    pub consecutive_exceeded_threshold: u32,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self { max_memory_mb: 1800, max_cpu_usage: 95.0, memory_warning_threshold_mb: 1500, consecutive_exceeded_threshold: 3 }
    }
}

struct State {
    consecutive_exceeded: u32,
    last_rss_mb: u64,
    last_cpu_percent: f32,
    last_warning_at: Option<Instant>,
}

pub struct ResourceMonitor {
    limits: ResourceLimits,
    state: Arc<Mutex<State>>,
    cancel: Mutex<Option<CancellationToken>>,
}

const WARNING_COOLDOWN: Duration = Duration::from_secs(5);
const CHECK_INTERVAL: Duration = Duration::from_secs(1);
const POLL_INTERVAL: Duration = Duration::from_secs(1);

impl ResourceMonitor {
    pub fn new(limits: ResourceLimits) -> Self {
        Self { limits, state: Arc::new(Mutex::new(State { consecutive_exceeded: 0, last_rss_mb: 0, last_cpu_percent: 0.0, last_warning_at: None })), cancel: Mutex::new(None) }
    }

    pub async fn start(&self) {
        let mut guard = self.cancel.lock().await;
        if guard.is_some() {
            return;
        }
        let token = CancellationToken::new();
        *guard = Some(token.clone());
        drop(guard);

        let state = self.state.clone();
        let limits = self.limits;
        let pid = Pid::from_u32(std::process::id());

        tokio::spawn(async move {
            let mut sys = System::new();
            let mut ticker = tokio::time::interval(CHECK_INTERVAL);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        sys.refresh_process(pid);
                        if let Some(process) = sys.process(pid) {
                            let rss_mb = process.memory() / 1024 / 1024;
                            let cpu_percent = process.cpu_usage();
                            Self::observe(&state, &limits, rss_mb, cpu_percent).await;
                        }
                    }
                }
            }
        });
    }

    pub async fn stop(&self) {
        if let Some(token) = self.cancel.lock().await.take() {
            token.cancel();
        }
    }

    async fn observe(state: &Arc<Mutex<State>>, limits: &ResourceLimits, rss_mb: u64, cpu_percent: f32) {
        let mut s = state.lock().await;
        s.last_rss_mb = rss_mb;
        s.last_cpu_percent = cpu_percent;

        let exceeded = rss_mb > limits.max_memory_mb || cpu_percent > limits.max_cpu_usage;
        if exceeded {
            s.consecutive_exceeded += 1;
        } else {
            s.consecutive_exceeded = 0;
        }

        if rss_mb > limits.memory_warning_threshold_mb {
            let should_warn = s.last_warning_at.map(|at| at.elapsed() >= WARNING_COOLDOWN).unwrap_or(true);
            if should_warn {
                warn!(rss_mb, threshold = limits.memory_warning_threshold_mb, "memory usage above warning threshold");
                s.last_warning_at = Some(Instant::now());
            }
        }
    }

    pub async fn should_pause_worker_creation(&self) -> bool {
        self.state.lock().await.consecutive_exceeded >= self.limits.consecutive_exceeded_threshold
    }

    pub async fn current_rss_mb(&self) -> u64 {
        self.state.lock().await.last_rss_mb
    }

    pub async fn current_cpu_percent(&self) -> f32 {
        self.state.lock().await.last_cpu_percent
    }

    /// Polls until memory drops back under `max_memory_mb` or `timeout_ms`
    /// elapses (default 30,000ms per caller).
    pub async fn wait_for_memory_release(&self, timeout_ms: u64) -> bool {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        loop {
            if self.current_rss_mb().await <= self.limits.max_memory_mb {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn pauses_worker_creation_after_consecutive_exceedances() {
        let monitor = ResourceMonitor::new(ResourceLimits { max_memory_mb: 100, max_cpu_usage: 90.0, memory_warning_threshold_mb: 80, consecutive_exceeded_threshold: 3 });

        ResourceMonitor::observe(&monitor.state, &monitor.limits, 150, 10.0).await;
        assert!(!monitor.should_pause_worker_creation().await);
        ResourceMonitor::observe(&monitor.state, &monitor.limits, 150, 10.0).await;
        assert!(!monitor.should_pause_worker_creation().await);
        ResourceMonitor::observe(&monitor.state, &monitor.limits, 150, 10.0).await;
        assert!(monitor.should_pause_worker_creation().await);
    }

    #[tokio::test]
    async fn dropping_below_limit_resets_the_consecutive_counter() {
        let monitor = ResourceMonitor::new(ResourceLimits { max_memory_mb: 100, ..ResourceLimits::default() });
        ResourceMonitor::observe(&monitor.state, &monitor.limits, 150, 10.0).await;
        ResourceMonitor::observe(&monitor.state, &monitor.limits, 150, 10.0).await;
        ResourceMonitor::observe(&monitor.state, &monitor.limits, 50, 10.0).await;
        assert_eq!(monitor.state.lock().await.consecutive_exceeded, 0);
    }

    #[tokio::test]
    async fn wait_for_memory_release_returns_immediately_when_already_under_threshold() {
        let monitor = ResourceMonitor::new(ResourceLimits::default());
        assert!(monitor.wait_for_memory_release(100).await);
    }
}
