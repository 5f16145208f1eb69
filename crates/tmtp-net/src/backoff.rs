//! Reconnect delays: exponential, capped, with random jitter.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
            attempt: 0,
        }
    }

    /// Delay before the next attempt. The ceiling doubles per attempt up to
    /// `max`; the delay is drawn from the upper half of it.
    pub fn next_delay(&mut self) -> Duration {
        let ceiling = self.ceiling();
        self.attempt = self.attempt.saturating_add(1);
        let half = ceiling / 2;
        let spread = (ceiling - half).as_millis() as u64;
        let jitter = if spread == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..=spread)
        };
        half + Duration::from_millis(jitter)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    fn ceiling(&self) -> Duration {
        let factor = 1u32 << self.attempt.min(16);
        self.base.saturating_mul(factor).min(self.max)
    }
}

/// `period` moved by a random amount of up to `percent` percent either way.
pub fn jittered(period: Duration, percent: u32) -> Duration {
    let span = period.as_millis() as u64 * u64::from(percent.min(100)) / 100;
    if span == 0 {
        return period;
    }
    let offset = rand::thread_rng().gen_range(0..=span * 2);
    (period + Duration::from_millis(offset)).saturating_sub(Duration::from_millis(span))
}
