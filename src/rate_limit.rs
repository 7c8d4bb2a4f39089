//! Per-connection token bucket with a strike window and time-bounded block.

use crate::clock::Clock;
use std::sync::Arc;

/// Token bucket: capacity `rateBurstBytes`, refill `rateBytesPerSecond`.
#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    capacity: f64,
    rate_per_sec: f64,
    last_refill_ms: u64,
}

impl TokenBucket {
    fn new(capacity: f64, rate_per_sec: f64, now_ms: u64) -> Self {
        Self { tokens: capacity, capacity, rate_per_sec, last_refill_ms: now_ms }
    }

    fn refill(&mut self, now_ms: u64) {
        let elapsed_ms = now_ms.saturating_sub(self.last_refill_ms);
        let refilled = (elapsed_ms as f64 / 1000.0) * self.rate_per_sec;
        self.tokens = (self.tokens + refilled).min(self.capacity);
        self.last_refill_ms = now_ms;
    }
}

/// Rate-limit state for a single connection:
/// 1. blocked check, 2. strike window reset, 3. refill, 4. strike/block,
/// 5. accept/reject and consume tokens.
#[derive(Debug)]
pub struct ConnectionRateLimit {
    bucket: TokenBucket,
    strikes: u32,
    strike_reset_at_ms: u64,
    blocked_until_ms: u64,
    max_strikes: u32,
    strike_window_ms: u64,
    block_ms: u64,
}

impl ConnectionRateLimit {
    pub fn new(
        capacity: f64,
        rate_per_sec: f64,
        max_strikes: u32,
        strike_window_ms: u64,
        block_ms: u64,
        now_ms: u64,
    ) -> Self {
        Self {
            bucket: TokenBucket::new(capacity, rate_per_sec, now_ms),
            strikes: 0,
            strike_reset_at_ms: now_ms + strike_window_ms,
            blocked_until_ms: 0,
            max_strikes,
            strike_window_ms,
            block_ms,
        }
    }

    pub fn is_blocked(&self, now_ms: u64) -> bool {
        now_ms < self.blocked_until_ms
    }

    /// Apply the admission check for an inbound payload of `bytes` length.
    /// Returns `true` if accepted (tokens consumed), `false` if rejected.
    pub fn admit(&mut self, bytes: f64, now_ms: u64) -> bool {
        if self.is_blocked(now_ms) {
            return false;
        }

        if now_ms > self.strike_reset_at_ms {
            self.strikes = 0;
            self.strike_reset_at_ms = now_ms + self.strike_window_ms;
        }

        self.bucket.refill(now_ms);

        if bytes > self.bucket.tokens {
            self.strikes += 1;
            if self.strikes >= self.max_strikes {
                self.blocked_until_ms = now_ms + self.block_ms;
            }
            return false;
        }

        self.bucket.tokens -= bytes;
        true
    }
}

/// Per-connection rate-limit state keyed by remote public key (hex), created
/// on first use and destroyed on connection close.
pub struct RateLimiter {
    clock: Arc<dyn Clock>,
    capacity: f64,
    rate_per_sec: f64,
    max_strikes: u32,
    strike_window_ms: u64,
    block_ms: u64,
}

impl RateLimiter {
    pub fn new(
        clock: Arc<dyn Clock>,
        capacity: f64,
        rate_per_sec: f64,
        max_strikes: u32,
        strike_window_ms: u64,
        block_ms: u64,
    ) -> Self {
        Self { clock, capacity, rate_per_sec, max_strikes, strike_window_ms, block_ms }
    }

    pub fn new_connection_state(&self) -> ConnectionRateLimit {
        ConnectionRateLimit::new(
            self.capacity,
            self.rate_per_sec,
            self.max_strikes,
            self.strike_window_ms,
            self.block_ms,
            self.clock.now_ms(),
        )
    }

    pub fn now_ms(&self) -> u64 {
        self.clock.now_ms()
    }
}
