//! Concurrency properties of the coordination primitives.

use std::{sync::Arc, time::Duration};

use futures::future::join_all;
use proptest::prelude::*;
use switchboard_coord::{
    Deduplicator, DistributedLock, MemoryCache, RateLimitConfig, RateLimiter, SharedCache,
};
use switchboard_core::TestClock;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_check_and_mark_yields_exactly_one_first_seen() -> anyhow::Result<()> {
    let dedup = Deduplicator::new(Arc::new(MemoryCache::new()), Duration::from_secs(60));

    let handles = (0..64).map(|_| {
        let dedup = dedup.clone();
        tokio::spawn(async move { dedup.check_and_mark("cmd:42:0").await })
    });

    let mut first_seen = 0;
    for outcome in join_all(handles).await {
        let is_duplicate = outcome??;
        if !is_duplicate {
            first_seen += 1;
        }
    }

    assert_eq!(first_seen, 1);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_try_lock_has_one_winner() -> anyhow::Result<()> {
    let cache: Arc<dyn SharedCache> = Arc::new(MemoryCache::new());

    let attempts = (0..16).map(|_| {
        let lock = DistributedLock::new(cache.clone());
        tokio::spawn(async move { lock.try_lock("restore:acme", Duration::from_secs(30)).await })
    });

    let mut winners = 0;
    for outcome in join_all(attempts).await {
        if outcome?? {
            winners += 1;
        }
    }

    assert_eq!(winners, 1);
    Ok(())
}

proptest! {
    #[test]
    fn allowed_calls_never_exceed_limit_within_one_window(limit in 1u64..20, calls in 0usize..60) {
        let runtime = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let allowed = runtime.block_on(async {
            let clock = TestClock::new();
            let cache = Arc::new(MemoryCache::with_clock(Arc::new(clock.clone())));
            let limiter = RateLimiter::new(
                cache,
                Arc::new(clock),
                RateLimitConfig { limit, window: Duration::from_secs(3_600) },
            );

            let mut allowed = 0usize;
            for _ in 0..calls {
                if limiter.allow("acme").await.unwrap().allowed {
                    allowed += 1;
                }
            }
            allowed
        });

        prop_assert!(allowed as u64 <= limit);
        prop_assert_eq!(allowed, calls.min(limit as usize));
    }
}
