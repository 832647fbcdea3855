//! Outbound flow throttling: exponential rise on back-pressure, decay on
//! subsequent publishes (spec.md §4.8).

use std::time::{Duration, Instant};

const MAX_DELAY: Duration = Duration::from_secs(30);
const MIN_RISE: Duration = Duration::from_millis(500);

/// Tracks the current throttle delay. `engage()` is called when the broker
/// (or transport layer) signals back-pressure; `take_delay()` is called
/// before a publish to get the delay the caller should suspend for, and
/// decays the delay afterward based on wall-clock time since the last
/// publish.
#[derive(Default)]
pub struct Throttle {
    delay: Duration,
    engaged_at: Option<Instant>,
    last_publish: Option<Instant>,
}

impl Throttle {
    pub fn new() -> Self {
        Throttle::default()
    }

    pub fn is_active(&self) -> bool {
        self.delay > Duration::ZERO
    }

    /// `delay = max(2*delay, delay + 500ms)` capped at 30s.
    pub fn engage(&mut self, now: Instant) {
        self.delay = (self.delay * 2)
            .max(self.delay + MIN_RISE)
            .min(MAX_DELAY);
        self.engaged_at = Some(now);
    }

    /// Returns the delay the caller should suspend for before this
    /// publish, then decays the delay by
    /// `3%·delay·seconds-since-last-publish + 5ms·seconds-since-last-publish`.
    pub fn take_delay(&mut self, now: Instant) -> Duration {
        let delay = self.delay;

        let elapsed_secs = self
            .last_publish
            .map(|prev| now.saturating_duration_since(prev).as_secs_f64())
            .unwrap_or(0.0);
        self.last_publish = Some(now);

        if self.delay > Duration::ZERO {
            let decay_secs =
                0.03 * self.delay.as_secs_f64() * elapsed_secs + 0.005 * elapsed_secs;
            let decay = Duration::from_secs_f64(decay_secs.max(0.0));
            self.delay = self.delay.saturating_sub(decay);
        }

        delay
    }
}
