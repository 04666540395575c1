//! Fixed-capacity token bucket with interval refill.
//!
//! Time is passed in explicitly as milliseconds since an arbitrary epoch,
//! so the same arithmetic serves the in-process bucket and the one persisted
//! in SQLite.

use std::time::Duration;

/// Bucket shape: at most `capacity` tokens; `refill_tokens` are added at
/// every whole `refill_period` boundary.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BucketParams {
    pub capacity: u64,
    pub refill_tokens: u64,
    pub refill_period: Duration,
}

impl BucketParams {
    pub fn new(capacity: u64, refill_tokens: u64, refill_period: Duration) -> Self {
        Self { capacity, refill_tokens, refill_period }
    }

    fn period_ms(&self) -> u64 {
        (self.refill_period.as_millis() as u64).max(1)
    }
}

#[derive(Clone, Debug)]
pub struct TokenBucket {
    params: BucketParams,
    tokens: u64,
    last_refill_ms: u64,
}

impl TokenBucket {
    /// A full bucket whose first refill boundary is one period after `now_ms`.
    pub fn new(params: BucketParams, now_ms: u64) -> Self {
        Self { params, tokens: params.capacity, last_refill_ms: now_ms }
    }

    /// Rebuild from persisted state. Tokens above capacity are clamped.
    pub fn from_state(params: BucketParams, tokens: u64, last_refill_ms: u64) -> Self {
        Self { params, tokens: tokens.min(params.capacity), last_refill_ms }
    }

    pub fn params(&self) -> BucketParams {
        self.params
    }

    pub fn last_refill_ms(&self) -> u64 {
        self.last_refill_ms
    }

    fn refill(&mut self, now_ms: u64) {
        let period = self.params.period_ms();
        let elapsed = now_ms.saturating_sub(self.last_refill_ms);
        let periods = elapsed / period;
        if periods == 0 {
            return;
        }
        let added = periods.saturating_mul(self.params.refill_tokens);
        self.tokens = self.tokens.saturating_add(added).min(self.params.capacity);
        self.last_refill_ms += periods * period;
    }

    /// Take `n` tokens if that many are available at `now_ms`.
    pub fn try_consume(&mut self, n: u64, now_ms: u64) -> bool {
        self.refill(now_ms);
        if self.tokens >= n {
            self.tokens -= n;
            true
        } else {
            false
        }
    }

    pub fn available_tokens(&mut self, now_ms: u64) -> u64 {
        self.refill(now_ms);
        self.tokens
    }
}
