use std::time::Duration;

use rand::Rng;

/// Bounded exponential backoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Add up to half of the computed delay as random jitter.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(2),
            jitter: true,
        }
    }
}

impl RetryPolicy {
    /// Policy used when reopening the live event stream.
    pub fn stream_reconnect(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            jitter: false,
        }
    }

    /// Delay to wait after the `attempt`-th failure (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let delay = exponential_backoff(attempt, self.base_delay, self.max_delay);
        if !self.jitter {
            return delay;
        }
        let spread = delay.as_millis() as u64 / 2;
        if spread == 0 {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0..=spread);
        (delay + Duration::from_millis(extra)).min(self.max_delay)
    }
}

pub fn exponential_backoff(attempt: u32, base: Duration, max: Duration) -> Duration {
    let base_ms = base.as_millis() as u64;
    let delay_ms = base_ms.saturating_mul(2_u64.pow(attempt.min(16)));
    Duration::from_millis(delay_ms).min(max)
}
