//! Per-source sliding-window rate limiting with bounded memory.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// Maximum distinct sources tracked; the least-recently-active bucket is
/// evicted on overflow.
const MAX_BUCKETS: usize = 1024;

pub struct SlidingWindowLimiter {
    limit: u32,
    window_s: f64,
    buckets: Mutex<HashMap<String, VecDeque<f64>>>,
}

impl SlidingWindowLimiter {
    pub fn new(limit: u32, window_s: f64) -> Self {
        Self {
            limit: limit.max(1),
            window_s: window_s.max(1.0),
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Whether a request from `source` at time `now` is allowed.
    ///
    /// Returns `(allowed, retry_after_s)`; `retry_after_s` is zero when
    /// allowed and at least one second otherwise.
    pub fn allow(&self, source: &str, now: f64) -> (bool, u64) {
        let mut buckets = self.buckets.lock().unwrap();

        if !buckets.contains_key(source) && buckets.len() >= MAX_BUCKETS {
            // Evict the bucket whose newest entry is oldest
            if let Some(victim) = buckets
                .iter()
                .min_by(|a, b| {
                    let a_last = a.1.back().copied().unwrap_or(0.0);
                    let b_last = b.1.back().copied().unwrap_or(0.0);
                    a_last.partial_cmp(&b_last).unwrap_or(std::cmp::Ordering::Equal)
                })
                .map(|(k, _)| k.clone())
            {
                buckets.remove(&victim);
            }
        }

        let bucket = buckets.entry(source.to_string()).or_default();
        let cutoff = now - self.window_s;
        while bucket.front().is_some_and(|ts| *ts <= cutoff) {
            bucket.pop_front();
        }

        if (bucket.len() as u32) < self.limit {
            bucket.push_back(now);
            (true, 0)
        } else {
            let oldest = bucket.front().copied().unwrap_or(now);
            let retry = (oldest + self.window_s - now).ceil().max(1.0) as u64;
            (false, retry)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enforces_window() {
        let limiter = SlidingWindowLimiter::new(2, 60.0);

        let (ok, retry) = limiter.allow("127.0.0.1", 100.0);
        assert!(ok);
        assert_eq!(retry, 0);

        let (ok, retry) = limiter.allow("127.0.0.1", 101.0);
        assert!(ok);
        assert_eq!(retry, 0);

        let (ok, retry) = limiter.allow("127.0.0.1", 102.0);
        assert!(!ok);
        assert!(retry >= 1);

        // Window slides: the 100.0 entry has expired by 161.0
        let (ok, retry) = limiter.allow("127.0.0.1", 161.0);
        assert!(ok);
        assert_eq!(retry, 0);
    }

    #[test]
    fn test_sources_are_independent() {
        let limiter = SlidingWindowLimiter::new(1, 60.0);
        assert!(limiter.allow("a", 10.0).0);
        assert!(!limiter.allow("a", 11.0).0);
        assert!(limiter.allow("b", 11.0).0);
    }

    #[test]
    fn test_retry_after_reflects_oldest_entry() {
        let limiter = SlidingWindowLimiter::new(1, 60.0);
        limiter.allow("x", 100.0);
        let (ok, retry) = limiter.allow("x", 130.0);
        assert!(!ok);
        // Oldest entry expires at 160: 30 seconds away
        assert_eq!(retry, 30);
    }

    #[test]
    fn test_bucket_count_bounded() {
        let limiter = SlidingWindowLimiter::new(1, 60.0);
        for i in 0..(MAX_BUCKETS + 50) {
            limiter.allow(&format!("src{i}"), i as f64);
        }
        let buckets = limiter.buckets.lock().unwrap();
        assert!(buckets.len() <= MAX_BUCKETS);
        // The most recent source survived
        assert!(buckets.contains_key(&format!("src{}", MAX_BUCKETS + 49)));
    }
}
