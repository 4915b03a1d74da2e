//! Per-device token bucket rate limiter, per §4.D.
//!
//! Grounded in the same lazy-refill token bucket shape used by the
//! pack's gateway rate-limit middleware, generalized from a per-IP
//! HTTP layer to a per-device map mutated only by its owning session.

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// State for one device's bucket. `0 <= tokens <= capacity`. Refill is
/// lazy: recomputed on each `try_acquire` call, never on a timer.
#[derive(Debug, Clone)]
struct TokenBucket {
    capacity: f64,
    refill_rate_per_sec: f64,
    tokens: f64,
    last_refill_at: Instant,
}

impl TokenBucket {
    fn new(capacity: f64, refill_rate_per_sec: f64) -> Self {
        Self {
            capacity,
            refill_rate_per_sec,
            tokens: capacity,
            last_refill_at: Instant::now(),
        }
    }

    fn try_acquire_at(&mut self, now: Instant) -> bool {
        let elapsed = now.saturating_duration_since(self.last_refill_at);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_rate_per_sec)
            .min(self.capacity);
        self.last_refill_at = now;

        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Owns one `TokenBucket` per `clientId`. `capacity == refillRatePerSec
/// == messageRateLimitPerSecond` per the configuration contract in §4.D.
#[derive(Debug, Default)]
pub struct RateLimiter {
    rate_per_sec: f64,
    buckets: HashMap<String, TokenBucket>,
}

impl RateLimiter {
    pub fn new(messages_per_second: f64) -> Self {
        Self {
            rate_per_sec: messages_per_second,
            buckets: HashMap::new(),
        }
    }

    /// Refills then attempts to consume one token for `client_id`.
    /// Empty or otherwise unknown-but-invalid `client_id` returns
    /// `false` without creating state.
    pub fn try_acquire(&mut self, client_id: &str) -> bool {
        self.try_acquire_at(client_id, Instant::now())
    }

    fn try_acquire_at(&mut self, client_id: &str, now: Instant) -> bool {
        if client_id.is_empty() {
            return false;
        }
        let rate = self.rate_per_sec;
        let bucket = self
            .buckets
            .entry(client_id.to_string())
            .or_insert_with(|| TokenBucket::new(rate, rate));
        bucket.try_acquire_at(now)
    }

    /// Removes the bucket for `client_id`, freeing it to restart at
    /// full capacity on next use.
    pub fn reset(&mut self, client_id: &str) {
        self.buckets.remove(client_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exact_capacity_burst_then_rejection() {
        let mut limiter = RateLimiter::new(5.0);
        let now = Instant::now();
        for _ in 0..5 {
            assert!(limiter.try_acquire_at("dev-1", now));
        }
        assert!(!limiter.try_acquire_at("dev-1", now));
    }

    #[test]
    fn refill_after_waiting_one_over_rate_seconds_allows_one_more() {
        let mut limiter = RateLimiter::new(2.0);
        let t0 = Instant::now();
        assert!(limiter.try_acquire_at("dev-1", t0));
        assert!(limiter.try_acquire_at("dev-1", t0));
        assert!(!limiter.try_acquire_at("dev-1", t0));

        let t1 = t0 + Duration::from_millis(600);
        assert!(limiter.try_acquire_at("dev-1", t1));
    }

    #[test]
    fn empty_client_id_is_always_rejected() {
        let mut limiter = RateLimiter::new(10.0);
        assert!(!limiter.try_acquire(""));
    }

    #[test]
    fn reset_restores_full_capacity() {
        let mut limiter = RateLimiter::new(1.0);
        let t0 = Instant::now();
        assert!(limiter.try_acquire_at("dev-1", t0));
        assert!(!limiter.try_acquire_at("dev-1", t0));
        limiter.reset("dev-1");
        assert!(limiter.try_acquire_at("dev-1", t0));
    }

    #[test]
    fn buckets_are_independent_per_device() {
        let mut limiter = RateLimiter::new(1.0);
        let t0 = Instant::now();
        assert!(limiter.try_acquire_at("dev-1", t0));
        assert!(limiter.try_acquire_at("dev-2", t0));
    }
}
