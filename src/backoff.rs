use std::time::Duration;

use rand::Rng;

/// Capped exponential backoff: `min(base * 2^(attempt-1), max)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    /// Randomize each delay into `[delay/2, delay]`.
    pub jitter: bool,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self) -> Self {
        self.jitter = true;
        self
    }

    /// Delay before retry number `attempt` (1-based). Attempt 0 is treated
    /// as 1.
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let delay = self
            .base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max)
            .min(self.max);

        if self.jitter && !delay.is_zero() {
            let millis = delay.as_millis() as u64;
            let mut rng = rand::thread_rng();
            Duration::from_millis(rng.gen_range(millis / 2..=millis))
        } else {
            delay
        }
    }
}
