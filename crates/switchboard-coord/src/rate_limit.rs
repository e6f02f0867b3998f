//! Fixed-window rate limiter.
//!
//! Each window gets its own counter key embedding the truncated window
//! start, so old windows expire on their own. The expiry is set only on the
//! first increment in a window; later calls never extend it.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, TimeZone, Utc};
use switchboard_core::{Clock, Result};

use crate::cache::SharedCache;

/// Limit applied per identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Calls allowed per window.
    pub limit: u64,
    /// Window length.
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { limit: 60, window: Duration::from_secs(60) }
    }
}

/// Outcome of one [`RateLimiter::allow`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    /// Whether the call fits in the current window.
    pub allowed: bool,
    /// Calls left in the current window.
    pub remaining: u64,
    /// When the current window ends.
    pub reset_at: DateTime<Utc>,
}

/// Fixed-window counter per identifier.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    cache: Arc<dyn SharedCache>,
    clock: Arc<dyn Clock>,
    config: RateLimitConfig,
}

impl RateLimiter {
    /// Creates a limiter.
    pub fn new(cache: Arc<dyn SharedCache>, clock: Arc<dyn Clock>, config: RateLimitConfig) -> Self {
        Self { cache, clock, config }
    }

    /// Configured limit.
    pub fn config(&self) -> RateLimitConfig {
        self.config
    }

    /// Counts one call for `id` and reports whether it is allowed.
    pub async fn allow(&self, id: &str) -> Result<RateLimitDecision> {
        let window_ms = u64::try_from(self.config.window.as_millis()).unwrap_or(u64::MAX).max(1);
        let now_ms = self.clock.unix_millis();
        let window_start = now_ms - now_ms % window_ms;
        let key = format!("ratelimit:{id}:{window_start}");

        let count = self.cache.incr(&key).await?;
        if count == 1 {
            self.cache.expire(&key, self.config.window).await?;
        }

        let count = u64::try_from(count).unwrap_or(0);
        let reset_ms = i64::try_from(window_start.saturating_add(window_ms)).unwrap_or(i64::MAX);
        Ok(RateLimitDecision {
            allowed: count <= self.config.limit,
            remaining: self.config.limit.saturating_sub(count),
            reset_at: Utc.timestamp_millis_opt(reset_ms).single().unwrap_or_else(Utc::now),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::UNIX_EPOCH;

    use switchboard_core::TestClock;

    use super::*;
    use crate::cache::MemoryCache;

    fn limiter(limit: u64, window: Duration) -> (RateLimiter, TestClock) {
        let clock = TestClock::starting_at(UNIX_EPOCH + Duration::from_secs(1_700_000_000));
        let cache = Arc::new(MemoryCache::with_clock(Arc::new(clock.clone())));
        (RateLimiter::new(cache, Arc::new(clock.clone()), RateLimitConfig { limit, window }), clock)
    }

    #[tokio::test]
    async fn allows_up_to_limit_then_denies() {
        let (limiter, _) = limiter(2, Duration::from_secs(60));

        let first = limiter.allow("acme").await.unwrap();
        assert!(first.allowed);
        assert_eq!(first.remaining, 1);

        assert!(limiter.allow("acme").await.unwrap().allowed);

        let third = limiter.allow("acme").await.unwrap();
        assert!(!third.allowed);
        assert_eq!(third.remaining, 0);
    }

    #[tokio::test]
    async fn identifiers_are_counted_separately() {
        let (limiter, _) = limiter(1, Duration::from_secs(60));
        assert!(limiter.allow("acme").await.unwrap().allowed);
        assert!(limiter.allow("beta").await.unwrap().allowed);
        assert!(!limiter.allow("acme").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn next_window_starts_fresh() {
        let (limiter, clock) = limiter(1, Duration::from_secs(60));
        let denied = {
            limiter.allow("acme").await.unwrap();
            limiter.allow("acme").await.unwrap()
        };
        assert!(!denied.allowed);

        clock.advance(Duration::from_secs(60));

        assert!(limiter.allow("acme").await.unwrap().allowed);
    }

    #[tokio::test]
    async fn reset_at_is_window_end() {
        let (limiter, clock) = limiter(5, Duration::from_secs(60));
        clock.advance(Duration::from_secs(15));

        let decision = limiter.allow("acme").await.unwrap();
        // 1_700_000_000 is 20s into a 60s window.
        assert_eq!(decision.reset_at.timestamp(), 1_700_000_040);
    }
}
