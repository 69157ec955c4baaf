//! Per-request-context deduplication for the usage tracker.
//!
//! Rust has no ergonomic weak-reference story at the request-context
//! boundary a framework like Next.js exposes in JavaScript. Instead, the
//! `Host` hands out an opaque per-request nonce and this module keeps a
//! bounded set of nonces already recorded, so that `track_read` called
//! many times within one request records exactly one event.

use std::time::{Duration, Instant};

use dashmap::DashMap;

/// Tracks request nonces already recorded, evicting entries older than
/// `ttl` so the set cannot grow unboundedly across a long-lived process.
pub struct RequestDedup {
    seen: DashMap<String, Instant>,
    ttl: Duration,
}

impl RequestDedup {
    /// A dedup set with the given eviction TTL.
    pub fn new(ttl: Duration) -> Self {
        Self {
            seen: DashMap::new(),
            ttl,
        }
    }

    /// Returns `true` the first time `nonce` is seen, `false` on every
    /// subsequent call for the same nonce (until it is evicted).
    pub fn mark_first_seen(&self, nonce: &str, now: Instant) -> bool {
        self.evict_expired(now);
        if self.seen.contains_key(nonce) {
            return false;
        }
        self.seen.insert(nonce.to_string(), now);
        true
    }

    fn evict_expired(&self, now: Instant) {
        self.seen.retain(|_, seen_at| now.duration_since(*seen_at) < self.ttl);
    }

    /// Number of nonces currently tracked.
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_call_for_a_nonce_returns_true_subsequent_calls_false() {
        let dedup = RequestDedup::new(Duration::from_secs(60));
        let now = Instant::now();
        assert!(dedup.mark_first_seen("req_1", now));
        for _ in 0..9 {
            assert!(!dedup.mark_first_seen("req_1", now));
        }
        assert_eq!(dedup.len(), 1);
    }

    #[test]
    fn distinct_nonces_are_tracked_independently() {
        let dedup = RequestDedup::new(Duration::from_secs(60));
        let now = Instant::now();
        assert!(dedup.mark_first_seen("req_1", now));
        assert!(dedup.mark_first_seen("req_2", now));
        assert_eq!(dedup.len(), 2);
    }

    #[test]
    fn entries_evict_after_ttl() {
        let dedup = RequestDedup::new(Duration::from_millis(10));
        let t0 = Instant::now();
        assert!(dedup.mark_first_seen("req_1", t0));
        let t1 = t0 + Duration::from_millis(20);
        assert!(dedup.mark_first_seen("req_1", t1));
    }
}
