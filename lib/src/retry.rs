//! Bounded exponential backoff for transient external failures.

use std::time::Duration;

use anyhow::Result;
use indicatif::HumanDuration;

use crate::errors::is_retriable;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RetryPolicy {
    /// Total attempts, including the first one. Always at least 1.
    pub(crate) max_attempts: u32,
    pub(crate) base_delay: Duration,
    pub(crate) max_delay: Duration,
}

impl RetryPolicy {
    /// A single attempt, no retries.
    pub(crate) const NONE: RetryPolicy = RetryPolicy {
        max_attempts: 1,
        base_delay: Duration::ZERO,
        max_delay: Duration::ZERO,
    };

    /// Delay before attempt `attempt + 1`, given `attempt` (1-based) just failed.
    pub(crate) fn delay_after(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Run `f` until it succeeds, fails permanently, or the attempts are used up.
    /// Returns the result together with the number of attempts made.
    pub(crate) fn run<T>(&self, what: &str, mut f: impl FnMut() -> Result<T>) -> (Result<T>, u32) {
        let mut attempt = 1;
        loop {
            match f() {
                Ok(v) => return (Ok(v), attempt),
                Err(e) if attempt < self.max_attempts && is_retriable(&e) => {
                    let delay = self.delay_after(attempt);
                    tracing::warn!(
                        "{what}: attempt {attempt}/{} failed: {e:#}; retrying in {}",
                        self.max_attempts,
                        HumanDuration(delay)
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return (Err(e), attempt),
            }
        }
    }
}
