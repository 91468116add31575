//! Backoff policy for the producer loop (spec.md §4.8: "Default backoff is
//! a fixed 10 000 ms; policy is pluggable per producer.").

use std::sync::Mutex;
use std::time::Duration;

use exponential_backoff::Backoff;

/// Computes how long to wait before retrying a producer after a failed
/// round. `attempt` is the 1-based count of consecutive failures.
pub trait BackoffPolicy: Send + Sync {
    fn backoff_ms(&self, producer_id: &str, attempt: u32) -> i64;
}

/// The default policy: a fixed delay regardless of attempt count.
pub struct FixedBackoff {
    pub ms: i64,
}

impl Default for FixedBackoff {
    fn default() -> Self {
        Self { ms: 10_000 }
    }
}

impl BackoffPolicy for FixedBackoff {
    fn backoff_ms(&self, _producer_id: &str, _attempt: u32) -> i64 {
        self.ms
    }
}

/// Grows the delay exponentially (with jitter) up to a ceiling, for
/// producers whose backing feed benefits from backing off harder under
/// sustained failure than the flat default.
pub struct ExponentialBackoffPolicy {
    backoff: Mutex<Backoff>,
}

impl ExponentialBackoffPolicy {
    pub fn new(min: Duration, max: Duration, retries: u32) -> Self {
        Self {
            backoff: Mutex::new(Backoff::new(retries, min, max)),
        }
    }
}

impl BackoffPolicy for ExponentialBackoffPolicy {
    fn backoff_ms(&self, _producer_id: &str, attempt: u32) -> i64 {
        let backoff = self.backoff.lock().expect("backoff mutex poisoned");
        backoff
            .next(attempt.saturating_sub(1))
            .unwrap_or(Duration::from_millis(10_000))
            .as_millis() as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fixed_backoff_is_constant() {
        let b = FixedBackoff::default();
        assert_eq!(b.backoff_ms("p", 1), 10_000);
        assert_eq!(b.backoff_ms("p", 5), 10_000);
    }

    #[test]
    fn exponential_backoff_grows_then_caps() {
        let b = ExponentialBackoffPolicy::new(Duration::from_millis(100), Duration::from_secs(10), 8);
        let first = b.backoff_ms("p", 1);
        let later = b.backoff_ms("p", 7);
        assert!(later >= first);
        assert!(later <= 10_000);
    }
}
