//! Rate limiting for relay connections
//!
//! Token bucket per connection: bursts up to `burst` frames, then
//! `per_sec` frames per second. Sync frames cannot be dropped without the
//! replicas diverging, so a frame over the limit is delayed, not refused.

use std::time::{Duration, Instant};

/// Token bucket rate limiter
#[derive(Debug, Clone)]
pub struct RateLimiter {
    tokens: f64,
    burst: f64,
    per_sec: f64,
    last_refill: Instant,
}

impl RateLimiter {
    pub fn new(burst: u32, per_sec: u32) -> Self {
        Self::starting_at(burst, per_sec, Instant::now())
    }

    fn starting_at(burst: u32, per_sec: u32, now: Instant) -> Self {
        let burst = f64::from(burst.max(1));
        Self {
            tokens: burst,
            burst,
            per_sec: f64::from(per_sec.max(1)),
            last_refill: now,
        }
    }

    /// Take one token, returning how long to hold the frame before handling it
    ///
    /// Over the limit the bucket goes into debt, so frames arriving while an
    /// earlier one waits queue up behind it.
    pub fn reserve(&mut self) -> Duration {
        self.reserve_at(Instant::now())
    }

    fn reserve_at(&mut self, now: Instant) -> Duration {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = elapsed.mul_add(self.per_sec, self.tokens).min(self.burst);
        self.last_refill = now;
        self.tokens -= 1.0;
        if self.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-self.tokens / self.per_sec)
        }
    }
}
