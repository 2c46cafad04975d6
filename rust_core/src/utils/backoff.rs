//! Exponential backoff with full jitter.
//!
//! Delay for attempt n is `min(cap, base * 2^n) * uniform(0.5, 1.5)`.
//! Used for feed reconnects and sink flush retries.

use rand::Rng;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Reconnect policy shared by both venue feeds: 1 s base, 60 s cap.
    pub fn reconnect() -> Self {
        Self::new(Duration::from_secs(1), Duration::from_secs(60))
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Delay to sleep before the next attempt; advances the counter.
    pub fn next_delay(&mut self) -> Duration {
        let exp = self.base.as_secs_f64() * 2f64.powi(self.attempt.min(30) as i32);
        let capped = exp.min(self.cap.as_secs_f64());
        self.attempt = self.attempt.saturating_add(1);
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_secs_f64(capped * jitter)
    }

    /// Call after a successful attempt so the next failure starts small.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
