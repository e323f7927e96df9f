//! Token bucket
//!
//! Lazy refill: on every access the balance grows by
//! `elapsed_seconds * refill_rate`, capped at capacity. No background
//! timer is involved; an untouched bucket simply refills on its next use.

use std::time::{Duration, Instant};

struct BucketState {
    tokens: f64,
    last_refill: Instant,
    last_access: Instant,
}

/// Per-key token bucket
///
/// The refill-then-decrement sequence runs under a single mutex, so two
/// concurrent requests racing for the last token cannot both be admitted.
pub struct TokenBucket {
    capacity: f64,
    refill_rate: f64,
    state: parking_lot::Mutex<BucketState>,
}

impl TokenBucket {
    /// `capacity` tokens, refilling at `refill_rate` tokens per second
    pub fn new(capacity: u32, refill_rate: f64) -> Self {
        let now = Instant::now();
        Self {
            capacity: f64::from(capacity),
            refill_rate,
            state: parking_lot::Mutex::new(BucketState {
                tokens: f64::from(capacity),
                last_refill: now,
                last_access: now,
            }),
        }
    }

    /// Consume one token if available
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

    /// Consume one token unconditionally, flooring at zero
    pub fn force_consume(&self) {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens = (state.tokens - 1.0).max(0.0);
    }

    /// Whole tokens currently available
    pub fn remaining(&self) -> u32 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens.floor() as u32
    }

    /// Time until at least one token is available (zero if one already is)
    pub fn time_to_next_token(&self) -> Duration {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= 1.0 || self.refill_rate <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64((1.0 - state.tokens) / self.refill_rate)
        }
    }

    /// Instant of the most recent acquire/consume/inspect
    pub fn last_access(&self) -> Instant {
        self.state.lock().last_access
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
            state.last_refill = now;
        }
        state.last_access = now;
    }
}
