//! Fixed-window rate limiting
//!
//! Guards the invoice-creation and webhook endpoints. Buckets are arbitrary
//! strings, typically remote-address + endpoint. Window reset is lazy: the
//! elapsed time is checked on access rather than by a background sweep.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: Instant,
    count: u32,
}

/// Outcome of a permit request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permit {
    /// Whether the request is allowed
    pub allowed: bool,
    /// How long until the window resets; zero when allowed
    pub retry_after: Duration,
}

/// Fixed-window permit counter keyed by bucket string
pub struct RateLimiter {
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    /// Create an empty rate limiter
    pub fn new() -> Self {
        Self {
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Try to consume one permit from `bucket`
    pub fn try_consume(&self, bucket: &str, limit: u32, window: Duration) -> Permit {
        self.try_consume_at(bucket, limit, window, Instant::now())
    }

    fn try_consume_at(&self, bucket: &str, limit: u32, window: Duration, now: Instant) -> Permit {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());

        // Lazy reset: entries whose window has fully elapsed are dropped on
        // access, so the map does not retain one entry per bucket forever.
        windows.retain(|_, w| now.saturating_duration_since(w.started_at) < window);

        let state = windows.entry(bucket.to_string()).or_insert(Window {
            started_at: now,
            count: 0,
        });

        if state.count < limit {
            state.count += 1;
            Permit {
                allowed: true,
                retry_after: Duration::ZERO,
            }
        } else {
            let elapsed = now.duration_since(state.started_at);
            Permit {
                allowed: false,
                retry_after: window.saturating_sub(elapsed),
            }
        }
    }

    #[cfg(test)]
    fn bucket_count(&self) -> usize {
        self.windows.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_then_reject_with_retry_after() {
        let limiter = RateLimiter::new();
        let window = Duration::from_secs(60);
        let now = Instant::now();

        for _ in 0..5 {
            let permit = limiter.try_consume_at("ip:invoices", 5, window, now);
            assert!(permit.allowed);
        }

        let rejected = limiter.try_consume_at("ip:invoices", 5, window, now);
        assert!(!rejected.allowed);
        assert!(rejected.retry_after > Duration::ZERO);
    }

    #[test]
    fn test_window_resets_lazily() {
        let limiter = RateLimiter::new();
        let window = Duration::from_secs(60);
        let start = Instant::now();

        for _ in 0..5 {
            assert!(limiter.try_consume_at("bucket", 5, window, start).allowed);
        }
        assert!(!limiter.try_consume_at("bucket", 5, window, start).allowed);

        // After the window elapses the counter resets on access
        let later = start + Duration::from_secs(61);
        assert!(limiter.try_consume_at("bucket", 5, window, later).allowed);
    }

    #[test]
    fn test_expired_buckets_are_purged_on_access() {
        let limiter = RateLimiter::new();
        let window = Duration::from_secs(60);
        let start = Instant::now();

        for n in 0..50 {
            limiter.try_consume_at(&format!("ip-{}:invoices", n), 5, window, start);
        }
        assert_eq!(limiter.bucket_count(), 50);

        // A single access after the window elapses sweeps the stale entries
        let later = start + Duration::from_secs(61);
        limiter.try_consume_at("fresh", 5, window, later);
        assert_eq!(limiter.bucket_count(), 1);
    }

    #[test]
    fn test_buckets_are_independent() {
        let limiter = RateLimiter::new();
        let window = Duration::from_secs(60);
        let now = Instant::now();

        assert!(limiter.try_consume_at("a", 1, window, now).allowed);
        assert!(!limiter.try_consume_at("a", 1, window, now).allowed);
        assert!(limiter.try_consume_at("b", 1, window, now).allowed);
    }
}
