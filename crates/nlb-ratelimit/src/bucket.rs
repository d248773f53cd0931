//! Lazy-refill token bucket.

use serde::Serialize;
use std::time::Instant;

/// A single token bucket.
///
/// Tokens are fractional and stay within `[0, capacity]`. Refill happens
/// on every [`try_consume_at`](Self::try_consume_at) call, using the time
/// elapsed since the previous call.
#[derive(Debug, Clone)]
pub struct TokenBucket {
    capacity: f64,
    /// Tokens added per second.
    refill_rate: f64,
    tokens: f64,
    last_refill: Instant,
    allowed: u64,
    denied: u64,
}

/// Point-in-time view of a bucket.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BucketStats {
    pub key: String,
    pub capacity: f64,
    pub refill_rate: f64,
    pub tokens: f64,
    /// Fraction of capacity currently spent, 0.0 to 1.0.
    pub utilization: f64,
    pub allowed: u64,
    pub denied: u64,
}

impl TokenBucket {
    /// Create a full bucket. Callers validate `capacity > 0` and a finite,
    /// non-negative `refill_rate`.
    pub fn new(capacity: f64, refill_rate: f64, now: Instant) -> Self {
        Self {
            capacity,
            refill_rate,
            tokens: capacity,
            last_refill: now,
            allowed: 0,
            denied: 0,
        }
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Tokens that would be available at `now`, without mutating state.
    pub fn available_at(&self, now: Instant) -> f64 {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        (self.tokens + elapsed * self.refill_rate).min(self.capacity)
    }

    fn refill(&mut self, now: Instant) {
        self.tokens = self.available_at(now);
        // A caller holding an older `now` never moves the clock backwards.
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    /// Refill, then take `n` tokens if that many are available. A denied
    /// request leaves the token count unchanged.
    pub fn try_consume_at(&mut self, n: f64, now: Instant) -> Result<(), f64> {
        self.refill(now);
        if self.tokens >= n {
            self.tokens = (self.tokens - n).max(0.0);
            self.allowed += 1;
            Ok(())
        } else {
            self.denied += 1;
            Err(self.tokens)
        }
    }

    pub fn stats_at(&self, key: &str, now: Instant) -> BucketStats {
        let tokens = self.available_at(now);
        BucketStats {
            key: key.to_string(),
            capacity: self.capacity,
            refill_rate: self.refill_rate,
            tokens,
            utilization: 1.0 - tokens / self.capacity,
            allowed: self.allowed,
            denied: self.denied,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn starts_full_and_drains() {
        let t0 = Instant::now();
        let mut b = TokenBucket::new(3.0, 1.0, t0);
        assert!(b.try_consume_at(1.0, t0).is_ok());
        assert!(b.try_consume_at(1.0, t0).is_ok());
        assert!(b.try_consume_at(1.0, t0).is_ok());
        assert_eq!(b.try_consume_at(1.0, t0), Err(0.0));
    }

    #[test]
    fn denied_request_keeps_tokens() {
        let t0 = Instant::now();
        let mut b = TokenBucket::new(2.0, 0.0, t0);
        assert!(b.try_consume_at(1.5, t0).is_ok());
        assert_eq!(b.try_consume_at(1.0, t0), Err(0.5));
        assert!(b.try_consume_at(0.5, t0).is_ok());
    }

    #[test]
    fn refill_is_capped_at_capacity() {
        let t0 = Instant::now();
        let mut b = TokenBucket::new(4.0, 10.0, t0);
        b.try_consume_at(4.0, t0).unwrap();
        let later = t0 + Duration::from_secs(60);
        assert_eq!(b.available_at(later), 4.0);
    }

    #[test]
    fn fractional_refill() {
        let t0 = Instant::now();
        let mut b = TokenBucket::new(1.0, 2.0, t0);
        b.try_consume_at(1.0, t0).unwrap();
        let t1 = t0 + Duration::from_millis(250);
        assert_eq!(b.try_consume_at(1.0, t1), Err(0.5));
        let t2 = t0 + Duration::from_millis(500);
        assert!(b.try_consume_at(1.0, t2).is_ok());
    }

    #[test]
    fn stale_timestamp_does_not_rewind_clock() {
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(1);
        let mut b = TokenBucket::new(1.0, 1.0, t0);
        b.try_consume_at(1.0, t1).unwrap();
        // An older timestamp adds nothing.
        assert!(b.try_consume_at(1.0, t0).is_err());
        assert!(b.try_consume_at(1.0, t1 + Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn stats_report_utilization() {
        let t0 = Instant::now();
        let mut b = TokenBucket::new(4.0, 0.0, t0);
        b.try_consume_at(1.0, t0).unwrap();
        let _ = b.try_consume_at(10.0, t0);
        let s = b.stats_at("svc", t0);
        assert_eq!(s.tokens, 3.0);
        assert_eq!(s.utilization, 0.25);
        assert_eq!((s.allowed, s.denied), (1, 1));
    }
}
