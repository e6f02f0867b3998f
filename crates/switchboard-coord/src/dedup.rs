//! Set-if-absent deduplication.

use std::{sync::Arc, time::Duration};

use switchboard_core::Result;

use crate::cache::SharedCache;

/// Marks keys as seen for a TTL.
#[derive(Debug, Clone)]
pub struct Deduplicator {
    cache: Arc<dyn SharedCache>,
    ttl: Duration,
}

impl Deduplicator {
    /// Creates a deduplicator whose marks live for `ttl`.
    pub fn new(cache: Arc<dyn SharedCache>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    /// Marks `key` and returns whether it was already marked.
    ///
    /// Backed by one atomic set-if-absent, so of N concurrent callers with the
    /// same key exactly one sees `false`.
    pub async fn check_and_mark(&self, key: &str) -> Result<bool> {
        let stored = self.cache.set_nx(&Self::cache_key(key), "1", self.ttl).await?;
        Ok(!stored)
    }

    /// Whether `key` is marked, without marking it.
    ///
    /// Callers that must not lose work check with this first and call
    /// [`Deduplicator::check_and_mark`] only once the work is settled.
    pub async fn is_marked(&self, key: &str) -> Result<bool> {
        Ok(self.cache.get(&Self::cache_key(key)).await?.is_some())
    }

    fn cache_key(key: &str) -> String {
        format!("dedup:{key}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;

    #[tokio::test]
    async fn second_mark_is_duplicate() {
        let dedup = Deduplicator::new(Arc::new(MemoryCache::new()), Duration::from_secs(60));

        assert!(!dedup.check_and_mark("cmd:1:0").await.unwrap());
        assert!(dedup.check_and_mark("cmd:1:0").await.unwrap());
        assert!(!dedup.check_and_mark("cmd:1:1").await.unwrap());
    }

    #[tokio::test]
    async fn is_marked_does_not_mark() {
        let dedup = Deduplicator::new(Arc::new(MemoryCache::new()), Duration::from_secs(60));

        assert!(!dedup.is_marked("cmd:2:0").await.unwrap());
        assert!(!dedup.is_marked("cmd:2:0").await.unwrap());

        assert!(!dedup.check_and_mark("cmd:2:0").await.unwrap());
        assert!(dedup.is_marked("cmd:2:0").await.unwrap());
    }
}
