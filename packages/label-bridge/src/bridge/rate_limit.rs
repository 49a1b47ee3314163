//! Process-local sliding-window rate limiter.
//!
//! Keyed by `discordUserId:endpoint`. Counters are not shared between
//! instances; that is acceptable for abuse mitigation.

use std::collections::VecDeque;
use std::sync::Arc;

use dashmap::DashMap;

/// Sliding-window limiter backed by per-key timestamp logs.
#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<DashMap<String, VecDeque<i64>>>,
    max_requests: usize,
    window_ms: i64,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window_ms: i64) -> Self {
        Self {
            windows: Arc::new(DashMap::new()),
            max_requests: max_requests.max(1),
            window_ms: window_ms.max(1),
        }
    }

    /// Build the limiter key for an identity/endpoint pair.
    pub fn key(discord_user_id: Option<&str>, endpoint: &str) -> String {
        format!("{}:{}", discord_user_id.unwrap_or("anonymous"), endpoint)
    }

    /// Record a hit for `key` at `now_ms`.
    ///
    /// Returns `Err(retry_after_secs)` if the window is already full; rejected
    /// hits are not recorded.
    pub fn check(&self, key: &str, now_ms: i64) -> Result<(), u64> {
        let mut hits = self.windows.entry(key.to_string()).or_default();
        let cutoff = now_ms - self.window_ms;
        while hits.front().is_some_and(|&t| t <= cutoff) {
            hits.pop_front();
        }

        if hits.len() >= self.max_requests {
            let oldest = hits.front().copied().unwrap_or(now_ms);
            let wait_ms = (oldest + self.window_ms - now_ms).max(0);
            let retry_after = (wait_ms as u64).div_ceil(1000).max(1);
            return Err(retry_after);
        }

        hits.push_back(now_ms);
        Ok(())
    }

    /// Drop keys with no hits inside the window. Returns how many were removed.
    pub fn prune(&self, now_ms: i64) -> usize {
        let cutoff = now_ms - self.window_ms;
        let before = self.windows.len();
        self.windows
            .retain(|_, hits| hits.back().is_some_and(|&t| t > cutoff));
        before.saturating_sub(self.windows.len())
    }

    /// Number of tracked keys.
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_up_to_limit() {
        let limiter = RateLimiter::new(3, 60_000);
        let key = RateLimiter::key(Some("42"), "/api/bridge/demos");
        assert!(limiter.check(&key, 1_000).is_ok());
        assert!(limiter.check(&key, 1_001).is_ok());
        assert!(limiter.check(&key, 1_002).is_ok());
        assert_eq!(limiter.check(&key, 1_003), Err(60));
    }

    #[test]
    fn test_window_slides() {
        let limiter = RateLimiter::new(2, 10_000);
        let key = "42:/x";
        assert!(limiter.check(key, 0).is_ok());
        assert!(limiter.check(key, 5_000).is_ok());
        assert_eq!(limiter.check(key, 6_000), Err(4));
        // First hit leaves the window at t=10_000
        assert!(limiter.check(key, 10_000).is_ok());
        assert!(limiter.check(key, 10_001).is_err());
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new(1, 60_000);
        assert!(limiter
            .check(&RateLimiter::key(Some("1"), "/a"), 0)
            .is_ok());
        assert!(limiter
            .check(&RateLimiter::key(Some("1"), "/b"), 0)
            .is_ok());
        assert!(limiter
            .check(&RateLimiter::key(Some("2"), "/a"), 0)
            .is_ok());
        assert!(limiter
            .check(&RateLimiter::key(None, "/a"), 0)
            .is_ok());
        assert!(limiter
            .check(&RateLimiter::key(Some("1"), "/a"), 1)
            .is_err());
    }

    #[test]
    fn test_prune_drops_idle_keys() {
        let limiter = RateLimiter::new(5, 1_000);
        limiter.check("a", 0).unwrap();
        limiter.check("b", 900).unwrap();
        assert_eq!(limiter.tracked_keys(), 2);
        assert_eq!(limiter.prune(1_500), 1);
        assert_eq!(limiter.tracked_keys(), 1);
    }
}
