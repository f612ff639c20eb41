//! Exponential reconnect backoff with jitter.
//!
//! Delays grow by a configurable factor up to a cap, with random
//! jitter added so a fleet of clients does not reconnect in lockstep.
//! The first attempt after a failure can be immediate.

use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    /// Delay used for the first (non-immediate) attempt.
    initial: Duration,
    /// Cap on the base delay.
    max: Duration,
    /// Base delay for the next attempt.
    current: Duration,
    /// Growth factor applied after each attempt.
    factor: f64,
    /// Upper bound of the random jitter in milliseconds.
    jitter_ms: u64,
    /// Whether the next call yields a zero delay.
    immediate_first: bool,
}

impl ExponentialBackoff {
    pub const fn new(
        initial: Duration,
        max: Duration,
        factor: f64,
        jitter_ms: u64,
        immediate_first: bool,
    ) -> Self {
        Self {
            initial,
            max,
            current: initial,
            factor,
            jitter_ms,
            immediate_first,
        }
    }

    /// Next delay to sleep before a reconnect attempt.
    ///
    /// Advances the internal state: the base delay is multiplied by
    /// `factor` (capped at `max`) for the following call.
    pub fn next_duration(&mut self) -> Duration {
        if self.immediate_first && self.current == self.initial {
            self.immediate_first = false;
            return Duration::ZERO;
        }

        let jitter = rand::rng().random_range(0..=self.jitter_ms);
        let delay = self.current + Duration::from_millis(jitter);

        let grown = (self.current.as_nanos() as f64 * self.factor) as u64;
        self.current = self.max.min(Duration::from_nanos(grown));

        delay
    }

    /// Return to the initial delay after a successful connection.
    pub const fn reset(&mut self) {
        self.current = self.initial;
    }

    /// Base delay for the next attempt, before jitter.
    pub const fn current_delay(&self) -> Duration {
        self.current
    }
}

// ── Tests ────────────────────────────────────────────────────────
