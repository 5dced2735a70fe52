//! Retry policy for transient completion failures.

use std::time::Duration;

use backon::ExponentialBuilder;

/// Bounded exponential backoff applied to transient transport failures.
///
/// Only errors the client classifies as transient are retried; auth and
/// rate-limit errors surface immediately.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    pub min_delay: Duration,
    /// Cap on the backoff delay.
    pub max_delay: Duration,
    /// Maximum number of retries after the initial attempt.
    pub max_retries: usize,
}

impl Default for RetryPolicy {
    /// 1s → 2s → 4s with jitter, 3 retries.
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(10),
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    pub(crate) fn backoff(&self) -> ExponentialBuilder {
        ExponentialBuilder::new()
            .with_min_delay(self.min_delay)
            .with_max_delay(self.max_delay)
            .with_factor(2.0)
            .with_jitter()
            .with_max_times(self.max_retries)
    }

    /// A policy with near-zero delays, for tests.
    pub fn immediate(max_retries: usize) -> Self {
        Self {
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(2),
            max_retries,
        }
    }
}
