//! Fixed-window rate limiting keyed by (user, chat).
//!
//! Each key owns one counter. The first request of a window creates the
//! counter with `count = 1` and `reset_at = now + window`; later requests
//! increment it until `max_requests` is reached. A request arriving after
//! `reset_at` replaces the counter with a fresh window. Check and update
//! happen under one lock, so concurrent callers cannot exceed the quota.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use parley_core::RequestContext;

/// Windows too long to represent end here instead.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

/// Maximum requests per window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    pub max_requests: u32,
    #[serde(rename = "window_secs", with = "window_secs")]
    pub window: Duration,
}

impl RateLimitPolicy {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
        }
    }

    pub fn per_second(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(1))
    }

    pub fn per_minute(max_requests: u32) -> Self {
        Self::new(max_requests, Duration::from_secs(60))
    }
}

mod window_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(window: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(window.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_secs)
    }
}

/// Identifies whose requests are counted together.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RateLimitKey {
    pub user_id: i64,
    pub chat_id: i64,
}

impl RateLimitKey {
    pub fn new(user_id: i64, chat_id: i64) -> Self {
        Self { user_id, chat_id }
    }
}

impl From<&RequestContext> for RateLimitKey {
    fn from(ctx: &RequestContext) -> Self {
        Self::new(ctx.user_id(), ctx.chat_id())
    }
}

impl std::fmt::Display for RateLimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "user:{}:chat:{}", self.user_id, self.chat_id)
    }
}

#[derive(Debug, Clone, Copy)]
struct Counter {
    count: u32,
    reset_at: Instant,
}

/// Current usage for a key, as reported by [`RateLimiter::usage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitUsage {
    pub current: u32,
    pub max: u32,
    /// End of the live window, or `None` when the key has no live counter.
    pub reset_at: Option<Instant>,
}

impl RateLimitUsage {
    pub fn remaining(&self) -> u32 {
        self.max.saturating_sub(self.current)
    }
}

pub struct RateLimiter {
    policy: RateLimitPolicy,
    counters: Mutex<HashMap<RateLimitKey, Counter>>,
}

impl RateLimiter {
    pub fn new(policy: RateLimitPolicy) -> Self {
        Self {
            policy,
            counters: Mutex::new(HashMap::new()),
        }
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    /// Counts a request for `key` and reports whether it is within quota.
    pub fn allow(&self, key: RateLimitKey) -> bool {
        let now = Instant::now();
        let mut counters = self.counters.lock();

        if let Some(counter) = counters.get_mut(&key)
            && now < counter.reset_at
        {
            if counter.count >= self.policy.max_requests {
                return false;
            }
            counter.count += 1;
            return true;
        }

        if self.policy.max_requests == 0 {
            return false;
        }
        counters.insert(
            key,
            Counter {
                count: 1,
                reset_at: self.window_end(now),
            },
        );
        true
    }

    fn window_end(&self, now: Instant) -> Instant {
        now.checked_add(self.policy.window)
            .unwrap_or_else(|| now + FAR_FUTURE)
    }

    /// Clears the counter for `key`.
    pub fn reset(&self, key: RateLimitKey) {
        self.counters.lock().remove(&key);
    }

    /// Reports usage for `key` without counting a request.
    pub fn usage(&self, key: RateLimitKey) -> RateLimitUsage {
        let now = Instant::now();
        let counters = self.counters.lock();

        match counters.get(&key) {
            Some(counter) if now < counter.reset_at => RateLimitUsage {
                current: counter.count,
                max: self.policy.max_requests,
                reset_at: Some(counter.reset_at),
            },
            _ => RateLimitUsage {
                current: 0,
                max: self.policy.max_requests,
                reset_at: None,
            },
        }
    }

    /// Drops counters whose window has ended. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut counters = self.counters.lock();
        let before = counters.len();
        counters.retain(|_, c| now < c.reset_at);
        before - counters.len()
    }

    /// Number of live and expired counters currently held.
    pub fn tracked_keys(&self) -> usize {
        self.counters.lock().len()
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("policy", &self.policy)
            .field("tracked_keys", &self.tracked_keys())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const KEY: RateLimitKey = RateLimitKey {
        user_id: 1,
        chat_id: 100,
    };

    #[tokio::test(start_paused = true)]
    async fn test_fixed_window() {
        let limiter = RateLimiter::new(RateLimitPolicy::new(3, Duration::from_secs(10)));

        for _ in 0..3 {
            assert!(limiter.allow(KEY));
        }
        assert!(!limiter.allow(KEY));

        tokio::time::advance(Duration::from_secs(10)).await;

        assert!(limiter.allow(KEY));
        assert_eq!(limiter.usage(KEY).current, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrepresentable_window_never_resets() {
        let limiter = RateLimiter::new(RateLimitPolicy::new(1, Duration::from_secs(u64::MAX)));

        assert!(limiter.allow(KEY));
        assert!(!limiter.allow(KEY));
        assert!(limiter.usage(KEY).reset_at.is_some());

        tokio::time::advance(Duration::from_secs(365 * 24 * 60 * 60)).await;
        assert!(!limiter.allow(KEY));
        assert_eq!(limiter.purge_expired(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let limiter = RateLimiter::new(RateLimitPolicy::new(1, Duration::from_secs(60)));
        let other_chat = RateLimitKey::new(1, 200);

        assert!(limiter.allow(KEY));
        assert!(!limiter.allow(KEY));
        assert!(limiter.allow(other_chat));
    }

    #[tokio::test(start_paused = true)]
    async fn test_usage_and_reset() {
        let limiter = RateLimiter::new(RateLimitPolicy::new(5, Duration::from_secs(30)));

        let usage = limiter.usage(KEY);
        assert_eq!(usage.current, 0);
        assert_eq!(usage.max, 5);
        assert!(usage.reset_at.is_none());

        limiter.allow(KEY);
        limiter.allow(KEY);
        let usage = limiter.usage(KEY);
        assert_eq!(usage.current, 2);
        assert_eq!(usage.remaining(), 3);
        assert_eq!(
            usage.reset_at,
            Some(Instant::now() + Duration::from_secs(30))
        );
        // usage does not count
        assert_eq!(limiter.usage(KEY).current, 2);

        limiter.reset(KEY);
        assert_eq!(limiter.usage(KEY).current, 0);
        assert_eq!(limiter.tracked_keys(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_purge_expired() {
        let limiter = RateLimiter::new(RateLimitPolicy::new(5, Duration::from_secs(5)));
        limiter.allow(KEY);
        tokio::time::advance(Duration::from_secs(3)).await;
        limiter.allow(RateLimitKey::new(2, 100));
        tokio::time::advance(Duration::from_secs(3)).await;

        assert_eq!(limiter.purge_expired(), 1);
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_never_exceed_quota() {
        let limiter = Arc::new(RateLimiter::new(RateLimitPolicy::per_minute(50)));
        let allowed = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..200)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                let allowed = Arc::clone(&allowed);
                tokio::spawn(async move {
                    if limiter.allow(KEY) {
                        allowed.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(allowed.load(Ordering::SeqCst), 50);
    }

    #[test]
    fn test_key_display() {
        assert_eq!(KEY.to_string(), "user:1:chat:100");
    }
}
