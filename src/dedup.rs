//! Settlement event deduplication
//!
//! The wallet daemon delivers settlement events at least once: the same
//! payment can arrive both on the in-process event stream and as a webhook,
//! and either channel may redeliver. Without this gate, retried deliveries
//! would double-confirm payments.
//!
//! Keys stay marked for the full TTL window even after `complete`, so
//! completion does not re-arm immediate reprocessing; the intent is "don't
//! process the same event twice within the window", not "allow reprocessing
//! after completion".

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tracing::debug;

#[derive(Debug, Clone, Copy)]
struct SeenEntry {
    marked_at: Instant,
}

/// Short-TTL "seen" set keyed by payment identifier
pub struct EventDeduplicator {
    ttl: Duration,
    seen: Mutex<HashMap<String, SeenEntry>>,
}

impl EventDeduplicator {
    /// Create a deduplicator with the given TTL window
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            seen: Mutex::new(HashMap::new()),
        }
    }

    /// Atomically mark `key` as in-flight.
    ///
    /// Returns true exactly once per key per TTL window, even under
    /// concurrent callers; every other call within the window returns false.
    pub fn try_begin(&self, key: &str) -> bool {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();

        // Window reset is lazy; expired entries are purged on access.
        seen.retain(|_, entry| now.duration_since(entry.marked_at) < self.ttl);

        if seen.contains_key(key) {
            debug!("Dedup: {} already seen, skipping", key);
            return false;
        }

        seen.insert(key.to_string(), SeenEntry { marked_at: now });
        true
    }

    /// Mark processing of `key` as finished.
    ///
    /// The key stays in the seen set until its TTL expires.
    pub fn complete(&self, key: &str) {
        // Entry intentionally retained; expiry is TTL-driven.
        debug!("Dedup: {} completed", key);
    }

    /// Drop the mark for `key` after a processing failure, so the provider's
    /// redelivery can be processed as fresh.
    pub fn forget(&self, key: &str) {
        let mut seen = self.seen.lock().unwrap_or_else(|e| e.into_inner());
        seen.remove(key);
        debug!("Dedup: {} forgotten after failure", key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_try_begin_is_exactly_once() {
        let dedup = EventDeduplicator::new(Duration::from_secs(60));
        assert!(dedup.try_begin("hash1"));
        assert!(!dedup.try_begin("hash1"));
        assert!(dedup.try_begin("hash2"));
    }

    #[test]
    fn test_complete_does_not_rearm() {
        let dedup = EventDeduplicator::new(Duration::from_secs(60));
        assert!(dedup.try_begin("hash1"));
        dedup.complete("hash1");
        assert!(!dedup.try_begin("hash1"));
    }

    #[test]
    fn test_forget_allows_retry() {
        let dedup = EventDeduplicator::new(Duration::from_secs(60));
        assert!(dedup.try_begin("hash1"));
        dedup.forget("hash1");
        assert!(dedup.try_begin("hash1"));
    }

    #[test]
    fn test_expires_after_ttl() {
        let dedup = EventDeduplicator::new(Duration::from_millis(20));
        assert!(dedup.try_begin("hash1"));
        std::thread::sleep(Duration::from_millis(40));
        assert!(dedup.try_begin("hash1"));
    }

    #[test]
    fn test_concurrent_try_begin_single_winner() {
        let dedup = Arc::new(EventDeduplicator::new(Duration::from_secs(60)));
        let mut handles = Vec::new();
        for _ in 0..16 {
            let dedup = dedup.clone();
            handles.push(std::thread::spawn(move || dedup.try_begin("hash1")));
        }
        let wins: usize = handles
            .into_iter()
            .map(|h| h.join().unwrap() as usize)
            .sum();
        assert_eq!(wins, 1);
    }
}
