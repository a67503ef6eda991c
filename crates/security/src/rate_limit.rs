//! Per-key token bucket rate limiting.
//!
//! Each key starts with `burst` tokens and refills linearly at
//! `max_requests / window`, never exceeding `burst`. Buckets live in a
//! sharded [`DashMap`]; `consume` holds the entry lock for its key while it
//! refills and decrements, so concurrent callers on one key never double-spend.

use std::time::{Duration, Instant};

use {dashmap::DashMap, thiserror::Error, tracing::debug};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RateLimitError {
    #[error("rate limit exceeded for {key}")]
    LimitExceeded { key: String, retry_after: Duration },
}

impl RateLimitError {
    pub fn retry_after(&self) -> Duration {
        match self {
            RateLimitError::LimitExceeded { retry_after, .. } => *retry_after,
        }
    }
}

#[derive(Debug, Clone)]
struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    fn full(cap: f64, now: Instant) -> Self {
        Self {
            tokens: cap,
            last_refill: now,
        }
    }

    fn refill(&mut self, now: Instant, rate_per_sec: f64, cap: f64) {
        // Instants older than the last refill never move the bucket backwards.
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * rate_per_sec).min(cap);
        if now > self.last_refill {
            self.last_refill = now;
        }
    }

    fn time_until_available(&self, rate_per_sec: f64) -> Duration {
        if self.tokens >= 1.0 {
            return Duration::ZERO;
        }
        if rate_per_sec <= 0.0 {
            return Duration::MAX;
        }
        Duration::from_secs_f64((1.0 - self.tokens) / rate_per_sec)
    }
}

/// Token bucket limiter keyed by an arbitrary string (remote IP, client id).
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    burst: u32,
    rate_per_sec: f64,
    buckets: DashMap<String, TokenBucket>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration, burst: u32) -> Self {
        let rate_per_sec = if window.is_zero() {
            0.0
        } else {
            f64::from(max_requests) / window.as_secs_f64()
        };
        Self {
            max_requests,
            window,
            burst,
            rate_per_sec,
            buckets: DashMap::new(),
        }
    }

    pub fn max_requests(&self) -> u32 {
        self.max_requests
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    pub fn burst(&self) -> u32 {
        self.burst
    }

    /// Take one token for `key`. Returns false when the bucket is empty.
    pub fn consume(&self, key: &str) -> bool {
        self.consume_at(key, Instant::now())
    }

    pub fn consume_at(&self, key: &str, now: Instant) -> bool {
        self.try_consume_at(key, now).is_ok()
    }

    /// Like [`consume`](Self::consume) but reports how long until a token frees up.
    pub fn check(&self, key: &str) -> Result<(), RateLimitError> {
        self.try_consume_at(key, Instant::now())
    }

    fn try_consume_at(&self, key: &str, now: Instant) -> Result<(), RateLimitError> {
        let cap = f64::from(self.burst);
        let mut bucket = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::full(cap, now));
        bucket.refill(now, self.rate_per_sec, cap);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let retry_after = bucket.time_until_available(self.rate_per_sec);
            let retry_after_ms = u64::try_from(retry_after.as_millis()).unwrap_or(u64::MAX);
            debug!(key, retry_after_ms, "rate limited");
            Err(RateLimitError::LimitExceeded {
                key: key.to_string(),
                retry_after,
            })
        }
    }

    /// Tokens currently available for `key` (a fresh key reports a full bucket).
    pub fn available(&self, key: &str) -> f64 {
        let cap = f64::from(self.burst);
        match self.buckets.get_mut(key) {
            Some(mut bucket) => {
                bucket.refill(Instant::now(), self.rate_per_sec, cap);
                bucket.tokens
            },
            None => cap,
        }
    }

    /// Drop buckets that have refilled completely. A full bucket behaves
    /// exactly like an absent one, so removal is unobservable to callers.
    pub fn sweep(&self) -> usize {
        self.sweep_at(Instant::now())
    }

    pub fn sweep_at(&self, now: Instant) -> usize {
        let cap = f64::from(self.burst);
        let before = self.buckets.len();
        self.buckets.retain(|_, bucket| {
            bucket.refill(now, self.rate_per_sec, cap);
            bucket.tokens < cap
        });
        let removed = before.saturating_sub(self.buckets.len());
        if removed > 0 {
            debug!(removed, remaining = self.buckets.len(), "swept idle rate-limit buckets");
        }
        removed
    }

    /// Forget a key entirely (e.g. when its connection closes).
    pub fn remove(&self, key: &str) {
        self.buckets.remove(key);
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use {super::*, std::sync::Arc};

    #[test]
    fn burst_then_refuse() {
        let limiter = RateLimiter::new(20, Duration::from_secs(60), 20);
        let now = Instant::now();
        for i in 0..20 {
            assert!(limiter.consume_at("10.0.0.1", now), "request {i} should pass");
        }
        assert!(!limiter.consume_at("10.0.0.1", now));
    }

    #[test]
    fn keys_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60), 1);
        let now = Instant::now();
        assert!(limiter.consume_at("a", now));
        assert!(!limiter.consume_at("a", now));
        assert!(limiter.consume_at("b", now));
    }

    #[test]
    fn refills_linearly() {
        // 10 per second, burst 2.
        let limiter = RateLimiter::new(10, Duration::from_secs(1), 2);
        let start = Instant::now();
        assert!(limiter.consume_at("k", start));
        assert!(limiter.consume_at("k", start));
        assert!(!limiter.consume_at("k", start));

        assert!(limiter.consume_at("k", start + Duration::from_millis(110)));
        assert!(!limiter.consume_at("k", start + Duration::from_millis(120)));
    }

    #[test]
    fn refill_capped_at_burst() {
        let limiter = RateLimiter::new(100, Duration::from_secs(1), 3);
        let start = Instant::now();
        assert!(limiter.consume_at("k", start));
        let later = start + Duration::from_secs(60);
        for _ in 0..3 {
            assert!(limiter.consume_at("k", later));
        }
        assert!(!limiter.consume_at("k", later));
    }

    #[test]
    fn earlier_instant_does_not_refill() {
        let limiter = RateLimiter::new(1, Duration::from_secs(1), 1);
        let start = Instant::now() + Duration::from_secs(5);
        assert!(limiter.consume_at("k", start));
        assert!(!limiter.consume_at("k", start - Duration::from_secs(3)));
    }

    #[test]
    fn zero_burst_always_refuses() {
        let limiter = RateLimiter::new(10, Duration::from_secs(1), 0);
        assert!(!limiter.consume("k"));
    }

    #[test]
    fn check_reports_retry_after() {
        let limiter = RateLimiter::new(1, Duration::from_secs(2), 1);
        limiter.check("k").unwrap();
        let err = limiter.check("k").unwrap_err();
        assert!(err.retry_after() > Duration::from_secs(1));
        assert!(err.retry_after() <= Duration::from_secs(2));
    }

    #[test]
    fn sweep_drops_only_full_buckets() {
        let limiter = RateLimiter::new(1, Duration::from_secs(10), 2);
        let now = Instant::now();
        limiter.consume_at("idle", now);
        limiter.consume_at("busy", now + Duration::from_secs(25));
        limiter.consume_at("busy", now + Duration::from_secs(25));

        let removed = limiter.sweep_at(now + Duration::from_secs(25));
        assert_eq!(removed, 1);
        assert_eq!(limiter.len(), 1);
        assert!(limiter.available("idle") >= 2.0);
    }

    #[test]
    fn concurrent_consumers_never_overspend() {
        let limiter = Arc::new(RateLimiter::new(1, Duration::from_secs(3600), 100));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                std::thread::spawn(move || (0..50).filter(|_| limiter.consume("shared")).count())
            })
            .collect();
        let granted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        // At most one token can refill during the test run.
        assert!((100..=101).contains(&granted), "granted {granted}");
    }
}
