//! Configuration surface for the task queue core.
//!
//! Loaded the same way as the teacher's platform config: a TOML file layered
//! under environment overrides via the `config` crate, deserialized into a
//! `#[serde(default)]` struct tree so any field an operator omits falls back
//! to the documented default.

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const DEFAULT_CONFIG_PATH: &str = "config/taskqueue.toml";
const ENV_PREFIX: &str = "TASKQUEUE";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub queue: QueueSettings,
    pub retry: RetrySettings,
    pub timeout: TimeoutSettings,
    pub recovery: RecoverySettings,
    pub processing: ProcessingSettings,
    pub resources: ResourceSettings,
    pub observability: ObservabilitySettings,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            queue: QueueSettings::default(),
            retry: RetrySettings::default(),
            timeout: TimeoutSettings::default(),
            recovery: RecoverySettings::default(),
            processing: ProcessingSettings::default(),
            resources: ResourceSettings::default(),
            observability: ObservabilitySettings::default(),
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        Self::load_from_path(None::<PathBuf>)
    }

    pub fn load_from_path<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        let mut builder = Config::builder().add_source(
            File::from(PathBuf::from(DEFAULT_CONFIG_PATH))
                .format(FileFormat::Toml)
                .required(false),
        );

        if let Some(path) = path {
            builder = builder.add_source(File::from(path.as_ref()).format(FileFormat::Toml).required(true));
        }

        builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

        let config = builder.build()?;
        config.try_deserialize().context("invalid task queue configuration")
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.queue.name.trim().is_empty() {
            errors.push("queue.name must not be empty".to_string());
        }
        if self.processing.worker_count == 0 {
            errors.push("processing.worker_count must be at least 1".to_string());
        }
        if self.resources.max_memory_mb == 0 {
            errors.push("resources.max_memory_mb must be greater than 0".to_string());
        }
        if self.resources.memory_warning_threshold_mb >= self.resources.max_memory_mb {
            errors.push("resources.memory_warning_threshold_mb must be below max_memory_mb".to_string());
        }
        if errors.is_empty() { Ok(()) } else { Err(errors) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub name: String,
    pub task_ttl_seconds: u64,
    pub redis_url: String,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            name: "file-processing".to_string(),
            task_ttl_seconds: 604_800,
            redis_url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_retries: u32,
    pub base_retry_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self { max_retries: 3, base_retry_delay_ms: 1000 }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub max_processing_time_ms: u64,
    pub timeout_check_interval_ms: u64,
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self { max_processing_time_ms: 1_800_000, timeout_check_interval_ms: 60_000 }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoverySettings {
    pub abandoned_task_threshold_ms: u64,
    pub recovery_batch_size: u32,
    pub enable_auto_recovery: bool,
    pub recovery_check_interval_ms: u64,
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            abandoned_task_threshold_ms: 3_600_000,
            recovery_batch_size: 50,
            enable_auto_recovery: true,
            recovery_check_interval_ms: 600_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingSettings {
    pub worker_count: u32,
    pub batch_size: u32,
    pub chunk_timeout_ms: u64,
    pub enable_progress_tracking: bool,
    pub performance_sample_interval_ms: u64,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            worker_count: 4,
            batch_size: 10_000,
            chunk_timeout_ms: 300_000,
            enable_progress_tracking: true,
            performance_sample_interval_ms: 1_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ResourceSettings {
    pub max_memory_mb: u64,
    pub max_cpu_usage: f32,
    pub memory_warning_threshold_mb: u64,
    pub consecutive_exceeded_threshold: u32,
}

impl Default for ResourceSettings {
    fn default() -> Self {
        Self {
            max_memory_mb: 1800,
            max_cpu_usage: 95.0,
            memory_warning_threshold_mb: 1500,
            consecutive_exceeded_threshold: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilitySettings {
    pub log_level: String,
    pub metrics_port: u16,
    pub enable_metrics: bool,
}

impl Default for ObservabilitySettings {
    fn default() -> Self {
        Self { log_level: "info".to_string(), metrics_port: 9090, enable_metrics: true }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        assert!(AppConfig::default().validate().is_ok());
    }

    #[test]
    fn rejects_empty_queue_name() {
        let mut cfg = AppConfig::default();
        cfg.queue.name = "  ".to_string();
        let errs = cfg.validate().unwrap_err();
        assert!(errs.iter().any(|e| e.contains("queue.name")));
    }

    #[test]
    fn rejects_zero_workers() {
        let mut cfg = AppConfig::default();
        cfg.processing.worker_count = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn rejects_warning_threshold_above_max() {
        let mut cfg = AppConfig::default();
        cfg.resources.memory_warning_threshold_mb = cfg.resources.max_memory_mb;
        assert!(cfg.validate().is_err());
    }
}
