//! Token-bucket rate limiting.
//!
//! The surface serves one user over loopback, so a single global bucket is
//! enough to keep a runaway client (or a tight interceptor retry loop) from
//! monopolizing the daemon.

use std::time::Instant;

use parking_lot::Mutex;

/// A global token bucket.
#[derive(Debug)]
pub struct RateLimiter {
    state: Mutex<BucketState>,
    capacity: f64,
    refill_per_sec: f64,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    refilled_at: Instant,
}

impl RateLimiter {
    /// A bucket holding `capacity` requests, refilling at `refill_per_sec`.
    #[must_use]
    pub fn new(capacity: u32, refill_per_sec: u32) -> Self {
        Self {
            state: Mutex::new(BucketState {
                tokens: f64::from(capacity),
                refilled_at: Instant::now(),
            }),
            capacity: f64::from(capacity),
            refill_per_sec: f64::from(refill_per_sec),
        }
    }

    /// Take one token; `false` means the caller should be throttled.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        let now = Instant::now();
        let elapsed = now.duration_since(state.refilled_at).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.refilled_at = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}
