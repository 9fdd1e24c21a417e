//! Per-key token bucket rate limiting
//!
//! Buckets refill lazily on access from elapsed monotonic time. One mutex
//! guards the bucket map; the critical section is pure arithmetic and never
//! touches I/O. Denied callers get an immediate answer, no queuing.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use crate::config::rate;

/// A single refilling token bucket
#[derive(Debug, Clone)]
pub struct TokenBucket {
    tokens: f64,
    capacity: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            tokens: capacity,
            capacity,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    /// Refill from elapsed time, then try to deduct one token
    pub fn try_acquire(&mut self) -> bool {
        self.refill(Instant::now());
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Re-target the bucket without losing accumulated state. Used by the
    /// per-request rpm override: the rate changes for one call only, the
    /// token level persists.
    pub fn set_rate(&mut self, capacity: f64, refill_per_sec: f64) {
        self.refill(Instant::now());
        self.capacity = capacity;
        self.refill_per_sec = refill_per_sec;
        self.tokens = self.tokens.min(capacity);
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        if elapsed > 0.0 {
            self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
            self.last_refill = now;
        }
    }

    #[cfg(test)]
    fn drain(&mut self) {
        self.tokens = 0.0;
        self.last_refill = Instant::now();
    }
}

/// Per-key rate limiter with a shared default rate
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    default_rpm: u32,
}

impl RateLimiter {
    pub fn new(default_rpm: u32) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            default_rpm,
        }
    }

    /// Admit or deny one request for the key. `override_rpm` replaces the
    /// configured rate for this call; bucket state persists across calls.
    pub fn allow(&self, key: &str, override_rpm: Option<u32>) -> bool {
        let rpm = override_rpm.unwrap_or(self.default_rpm).max(1);
        let capacity = rpm as f64;
        let refill = rpm as f64 / 60.0;

        let mut buckets = self.buckets.lock().unwrap_or_else(|e| e.into_inner());
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(capacity, refill));
        bucket.set_rate(capacity, refill);
        bucket.try_acquire()
    }

    /// Number of tracked keys, for the health endpoint
    pub fn tracked_keys(&self) -> usize {
        self.buckets.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(rate::DEFAULT_RPM)
    }
}
