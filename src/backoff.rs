//! Reconnect backoff: exponential, capped, with ±20% jitter.
//!
//! The schedule before jitter is `base, 2·base, 4·base, …` up to `max`. A
//! session that stayed connected for at least `stable_threshold` resets the
//! schedule to `base`.

use std::time::Duration;

use rand::Rng;

/// Fraction of the nominal delay the jitter may add or remove.
pub const JITTER: f64 = 0.2;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    max: Duration,
    stable_threshold: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, max: Duration, stable_threshold: Duration) -> Self {
        Self {
            base,
            max,
            stable_threshold,
            attempt: 0,
        }
    }

    /// Nominal (un-jittered) delay for the next attempt.
    pub fn nominal(&self) -> Duration {
        let factor = 2u32.saturating_pow(self.attempt.min(31));
        self.base.saturating_mul(factor).min(self.max)
    }

    /// Delay to sleep before the next reconnect; advances the schedule.
    pub fn next_delay(&mut self) -> Duration {
        let nominal = self.nominal().as_secs_f64();
        self.attempt = self.attempt.saturating_add(1);
        let factor = rand::rng().random_range((1.0 - JITTER)..=(1.0 + JITTER));
        Duration::from_secs_f64(nominal * factor)
    }

    /// Account for a session that just ended after being up for `uptime`.
    pub fn session_ended(&mut self, uptime: Duration) {
        if uptime >= self.stable_threshold {
            self.reset();
        }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}
