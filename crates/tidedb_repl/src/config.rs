//! Configuration for replication.

use std::time::Duration;

/// Configuration for a replication engine and its sessions.
#[derive(Debug, Clone)]
pub struct ReplConfig {
    /// Maximum documents diffed and transferred per batch. Bounds
    /// in-flight data: a slow target backpressures the session instead
    /// of the session buffering unboundedly.
    pub batch_size: usize,
    /// Deadline carried by every remote store call.
    pub call_timeout: Duration,
    /// Interval at which the remote change watcher polls for new
    /// sequences.
    pub poll_interval: Duration,
    /// Retry behavior for transient transport failures.
    pub retry: RetryConfig,
}

impl ReplConfig {
    /// Creates a configuration with defaults.
    pub fn new() -> Self {
        Self {
            batch_size: 100,
            call_timeout: Duration::from_secs(30),
            poll_interval: Duration::from_millis(500),
            retry: RetryConfig::default(),
        }
    }

    /// Sets the batch size.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Sets the remote call deadline.
    pub fn with_call_timeout(mut self, timeout: Duration) -> Self {
        self.call_timeout = timeout;
        self
    }

    /// Sets the remote poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the retry configuration.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for ReplConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Retry policy for transient failures.
///
/// Bounded two ways: a retry count and a total sleep budget per
/// failure streak. The budget is the operational knob — "spend at most
/// this long waiting on a flaky link before giving up" — and caps the
/// doubling sequence without a separate per-delay maximum.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of attempts per batch (first try included).
    pub max_attempts: u32,
    /// Delay before the first retry; doubles on each subsequent one.
    pub initial_delay: Duration,
    /// Total time the backoff may spend sleeping before it gives up.
    pub backoff_budget: Duration,
}

impl RetryConfig {
    /// Creates a retry configuration.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_delay: Duration::from_millis(100),
            backoff_budget: Duration::from_secs(60),
        }
    }

    /// Creates a configuration with no retries.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_delay: Duration::ZERO,
            backoff_budget: Duration::ZERO,
        }
    }

    /// Sets the delay before the first retry.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the total backoff budget.
    pub fn with_backoff_budget(mut self, budget: Duration) -> Self {
        self.backoff_budget = budget;
        self
    }

    /// Starts a fresh backoff for one failure streak.
    pub fn backoff(&self) -> Backoff {
        Backoff {
            delay: self.initial_delay,
            remaining_budget: self.backoff_budget,
            retries_left: self.max_attempts.saturating_sub(1),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Doubling backoff drawn from a total budget.
///
/// Each call to [`next_delay`](Self::next_delay) yields the time to
/// sleep before the next retry, or `None` once the retry count or the
/// budget is exhausted. A delay larger than what is left in the budget
/// is clipped to the remainder, so the final retry still happens.
#[derive(Debug, Clone)]
pub struct Backoff {
    delay: Duration,
    remaining_budget: Duration,
    retries_left: u32,
}

impl Backoff {
    /// Consumes one retry; `None` means stop retrying.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.retries_left == 0 {
            return None;
        }
        if self.remaining_budget.is_zero() && !self.delay.is_zero() {
            return None;
        }
        self.retries_left -= 1;
        let step = self.delay.min(self.remaining_budget);
        self.remaining_budget -= step;
        self.delay = self.delay.saturating_mul(2);
        Some(step)
    }

    /// Retries still available.
    pub fn retries_left(&self) -> u32 {
        self.retries_left
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_builder() {
        let config = ReplConfig::new()
            .with_batch_size(10)
            .with_call_timeout(Duration::from_secs(5))
            .with_poll_interval(Duration::from_millis(50));

        assert_eq!(config.batch_size, 10);
        assert_eq!(config.call_timeout, Duration::from_secs(5));
        assert_eq!(config.poll_interval, Duration::from_millis(50));
    }

    #[test]
    fn backoff_doubles_until_retries_run_out() {
        let retry = RetryConfig::new(4)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_budget(Duration::from_secs(10));
        let mut backoff = retry.backoff();

        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(200)));
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(400)));
        assert_eq!(backoff.next_delay(), None);
    }

    #[test]
    fn backoff_clips_final_delay_to_the_budget() {
        let retry = RetryConfig::new(10)
            .with_initial_delay(Duration::from_millis(100))
            .with_backoff_budget(Duration::from_millis(250));
        let mut backoff = retry.backoff();

        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
        // 200ms due, 150ms left in the budget.
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(150)));
        assert_eq!(backoff.next_delay(), None);
    }

    #[test]
    fn no_retry_yields_nothing() {
        let retry = RetryConfig::no_retry();
        assert_eq!(retry.max_attempts, 1);
        assert_eq!(retry.backoff().next_delay(), None);
    }
}
