//! Fixed-window dispatch rate limiting.

use std::time::{Duration, Instant};

/// A fixed-window bucket: `max` tokens refilled in full every `window`.
///
/// `consume` is non-blocking; a denied dispatch attempt simply leaves the
/// job pending for a later scheduler tick.
#[derive(Debug)]
pub struct RateLimiter {
    max: u32,
    window: Duration,
    tokens: u32,
    window_started_at: Instant,
}

impl RateLimiter {
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window,
            tokens: max,
            window_started_at: Instant::now(),
        }
    }

    /// Takes one token, refilling first if the window has elapsed. Returns
    /// `false` when the window's budget is spent.
    pub fn consume(&mut self) -> bool {
        if self.window_started_at.elapsed() >= self.window {
            self.tokens = self.max;
            self.window_started_at = Instant::now();
        }
        if self.tokens > 0 {
            self.tokens -= 1;
            true
        } else {
            false
        }
    }

    pub fn remaining(&self) -> u32 {
        self.tokens
    }
}
