//! Reconnect delays.

use crate::config::TimingSettings;
use rand::Rng;
use std::time::Duration;

/// Capped exponential backoff for reconnect attempts.
///
/// The base delay starts at `initial`, doubles after every attempt and never
/// exceeds `max`. Each returned delay is spread by up to `jitter` of its
/// value so that several helpers restarting together do not reconnect in
/// lockstep.
#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    jitter: f64,
    current: Duration,
    attempts: u32,
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration, jitter: f64) -> Self {
        Self {
            initial,
            max,
            jitter: jitter.clamp(0.0, 1.0),
            current: initial,
            attempts: 0,
        }
    }

    pub fn from_timing(timing: &TimingSettings) -> Self {
        Self::new(
            Duration::from_millis(timing.backoff_initial_ms),
            Duration::from_millis(timing.backoff_max_ms),
            timing.backoff_jitter,
        )
    }

    /// Delay to wait before the next attempt; advances the curve.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.current;
        self.current = (self.current * 2).min(self.max);
        self.attempts += 1;
        self.spread(base)
    }

    /// Called after a successful connect.
    pub fn reset(&mut self) {
        self.current = self.initial;
        self.attempts = 0;
    }

    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    fn spread(&self, base: Duration) -> Duration {
        if self.jitter == 0.0 {
            return base;
        }
        let factor = rand::thread_rng().gen_range(1.0 - self.jitter..=1.0 + self.jitter);
        base.mul_f64(factor).min(self.max)
    }
}
