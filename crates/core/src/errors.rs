//! Error taxonomy shared by the queue and processing crates.
//!
//! `ErrorKind` is the closed classification from the failure-handling design:
//! substring matching on a raw error message picks the first matching kind,
//! in the fixed order below. `QueueError` is the typed error surface every
//! public operation returns, following the teacher's `Layer4Error` split of
//! one `#[error(...)]` variant per distinct failure mode with `#[from]`
//! conversions for collaborator errors.

use crate::domain::TaskId;
use thiserror::Error;

/// Closed failure taxonomy. Order matters: `classify` tries kinds top to
/// bottom and the first keyword match wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    RetryableNetwork,
    RetryableResource,
    PermanentPermission,
    PermanentFormat,
    PermanentBusiness,
    /// Raised by the timeout watchdog, never by `classify`.
    Timeout,
    /// Raised by recovery for tasks whose owning process vanished.
    Abandoned,
}

impl ErrorKind {
    pub fn is_retryable(self) -> bool {
        matches!(self, ErrorKind::RetryableNetwork | ErrorKind::RetryableResource | ErrorKind::Abandoned)
    }
}

const NETWORK_KEYWORDS: &[&str] = &["econnreset", "connection reset", "dns", "connection refused", "timed out waiting for connection"];
const RESOURCE_KEYWORDS: &[&str] = &["out of memory", "oom", "disk quota exceeded", "enospc", "resource quota exceeded"];
const PERMISSION_KEYWORDS: &[&str] = &["access denied", "not authorized", "permission denied", "eacces"];
const FORMAT_KEYWORDS: &[&str] = &["unsupported file format", "corrupted csv", "malformed row header", "invalid utf-8"];

/// Classifies a raw error message into the closed taxonomy. `PermanentBusiness`
/// is the catch-all when nothing else matches.
pub fn classify(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    if NETWORK_KEYWORDS.iter().any(|k| lower.contains(k)) {
        ErrorKind::RetryableNetwork
    } else if RESOURCE_KEYWORDS.iter().any(|k| lower.contains(k)) {
        ErrorKind::RetryableResource
    } else if PERMISSION_KEYWORDS.iter().any(|k| lower.contains(k)) {
        ErrorKind::PermanentPermission
    } else if FORMAT_KEYWORDS.iter().any(|k| lower.contains(k)) {
        ErrorKind::PermanentFormat
    } else {
        ErrorKind::PermanentBusiness
    }
}

/// `kind ∈ retryable ∧ retryCount < maxRetries`.
pub fn should_retry(kind: ErrorKind, retry_count: u32, max_retries: u32) -> bool {
    kind.is_retryable() && retry_count < max_retries
}

/// `min(baseRetryDelay * 2^retryCount, 5 minutes)`, shared by consumer retry
/// scheduling and queue connection recovery.
pub fn retry_delay_ms(base_retry_delay_ms: u64, retry_count: u32) -> u64 {
    const MAX_DELAY_MS: u64 = 5 * 60 * 1000;
    base_retry_delay_ms.saturating_mul(1u64 << retry_count.min(20)).min(MAX_DELAY_MS)
}

pub type QueueResult<T> = Result<T, QueueError>;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("task not found: {0}")]
    NotFound(TaskId),

    #[error("queue backend unavailable: {0}")]
    Unavailable(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("file not found: {0}")]
    FileNotFound(String),

    #[error("task timed out: {0}")]
    Timeout(String),

    #[error("task abandoned: {0}")]
    Abandoned(String),

    #[error("data integrity violated: {0}")]
    Integrity(String),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl QueueError {
    /// Maps this error onto the closed taxonomy, for components that need a
    /// `retry vs. permanent` decision rather than the raw variant.
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueueError::Timeout(_) => ErrorKind::Timeout,
            QueueError::Abandoned(_) => ErrorKind::Abandoned,
            QueueError::Redis(_) | QueueError::Unavailable(_) => ErrorKind::RetryableNetwork,
            QueueError::Io(_) => ErrorKind::RetryableResource,
            QueueError::InvalidInput(_) | QueueError::FileNotFound(_) => ErrorKind::PermanentFormat,
            _ => classify(&self.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_prefers_network_over_business_catchall() {
        assert_eq!(classify("connection reset by peer (ECONNRESET)"), ErrorKind::RetryableNetwork);
    }

    #[test]
    fn classify_falls_back_to_business() {
        assert_eq!(classify("the sky is falling"), ErrorKind::PermanentBusiness);
    }

    #[test]
    fn classify_first_match_wins_network_before_format() {
        assert_eq!(classify("ECONNRESET: unsupported file format"), ErrorKind::RetryableNetwork);
    }

    #[test]
    fn retry_delay_caps_at_five_minutes() {
        assert_eq!(retry_delay_ms(1000, 0), 1000);
        assert_eq!(retry_delay_ms(1000, 1), 2000);
        assert_eq!(retry_delay_ms(1000, 20), 5 * 60 * 1000);
    }

    #[test]
    fn should_retry_respects_max_retries() {
        assert!(should_retry(ErrorKind::RetryableNetwork, 2, 3));
        assert!(!should_retry(ErrorKind::RetryableNetwork, 3, 3));
        assert!(!should_retry(ErrorKind::PermanentFormat, 0, 3));
    }
}
