//! Token bucket for the pool's tasks-per-minute ceiling.
//!
//! Capacity equals the per-minute rate and refill is continuous, so short
//! bursts up to the rate are allowed but any 60-second window never sees
//! more starts than the configured limit.

use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Continuously-refilled token bucket; one token per task start.
#[derive(Debug)]
pub struct TokenBucket {
    capacity: f64,
    tokens_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Bucket allowing `per_minute` consumptions per minute.
    #[must_use]
    pub fn per_minute(per_minute: u32) -> Self {
        let capacity = f64::from(per_minute.max(1));
        Self {
            capacity,
            tokens_per_sec: capacity / 60.0,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    /// Take one token if available.
    pub fn try_acquire(&self) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Time until the next token becomes available; zero when one is
    /// already there.
    pub fn time_to_next_token(&self) -> Duration {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 {
            return Duration::ZERO;
        }
        let missing = 1.0 - state.tokens;
        Duration::from_secs_f64(missing / self.tokens_per_sec)
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.tokens_per_sec).min(self.capacity);
            state.last_refill = now;
        }
    }
}
