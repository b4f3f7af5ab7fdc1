//! Reconnect delay schedule
//!
//! Pure functions from attempt number to delay, so the schedule can be
//! tested without timers.

use rand::Rng;
use std::time::Duration;

/// Upper bound on any single reconnect delay
pub const MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);

/// Jitter as a fraction of the nominal delay (±20%)
pub const JITTER_RATIO: f64 = 0.2;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: MAX_RECONNECT_DELAY,
            max_attempts: 5,
            jitter: JITTER_RATIO,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts,
            ..Default::default()
        }
    }

    /// Nominal delay for 1-based `attempt`: base * 2^(attempt-1), capped
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let factor = 1u64 << exponent;
        let millis = (self.base_delay.as_millis() as u64).saturating_mul(factor);
        Duration::from_millis(millis).min(self.max_delay)
    }

    /// Nominal delay scaled by `unit` in [-1, 1] times the jitter ratio, capped
    pub fn jittered_delay(&self, attempt: u32, unit: f64) -> Duration {
        let nominal = self.nominal_delay(attempt).as_millis() as f64;
        let scale = 1.0 + self.jitter * unit.clamp(-1.0, 1.0);
        let millis = (nominal * scale).round().max(0.0) as u64;
        Duration::from_millis(millis).min(self.max_delay)
    }

    /// Delay to wait before `attempt`, never shorter than `previous`
    pub fn next_delay(&self, attempt: u32, previous: Option<Duration>, unit: f64) -> Duration {
        let delay = self.jittered_delay(attempt, unit);
        match previous {
            Some(previous) => delay.max(previous).min(self.max_delay),
            None => delay,
        }
    }

    /// Same as [`next_delay`](Self::next_delay) with a random jitter draw
    pub fn sample(&self, attempt: u32, previous: Option<Duration>) -> Duration {
        let unit = rand::thread_rng().gen_range(-1.0..=1.0);
        self.next_delay(attempt, previous, unit)
    }

    pub fn exhausted(&self, attempt: u32) -> bool {
        attempt > self.max_attempts
    }
}
