//! Thin wrapper around `taskqueue_core::errors` exposing the single decision
//! the consumer loop needs: classify the failure, then decide whether (and
//! after how long) to retry.

use taskqueue_core::errors::{classify, retry_delay_ms, should_retry, ErrorKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry { delay_ms: u64 },
    Fail,
}

/// Classifies `message` and returns the retry decision for a task currently
/// at `retry_count` with the configured `max_retries`/`base_retry_delay_ms`.
pub fn classify_and_decide(message: &str, retry_count: u32, max_retries: u32, base_retry_delay_ms: u64) -> (ErrorKind, RetryDecision) {
    let kind = classify(message);
    if should_retry(kind, retry_count, max_retries) {
        (kind, RetryDecision::Retry { delay_ms: retry_delay_ms(base_retry_delay_ms, retry_count) })
    } else {
        (kind, RetryDecision::Fail)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn network_error_under_max_retries_is_retried_with_backoff() {
        let (kind, decision) = classify_and_decide("ECONNRESET", 0, 3, 1000);
        assert_eq!(kind, ErrorKind::RetryableNetwork);
        assert_eq!(decision, RetryDecision::Retry { delay_ms: 1000 });
    }

    #[test]
    fn network_error_at_max_retries_fails() {
        let (_, decision) = classify_and_decide("ECONNRESET", 3, 3, 1000);
        assert_eq!(decision, RetryDecision::Fail);
    }

    #[test]
    fn format_error_never_retries() {
        let (kind, decision) = classify_and_decide("unsupported file format", 0, 3, 1000);
        assert_eq!(kind, ErrorKind::PermanentFormat);
        assert_eq!(decision, RetryDecision::Fail);
    }
}
