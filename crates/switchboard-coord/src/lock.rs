//! Advisory, TTL-bounded distributed lock.
//!
//! Best effort across processes: the TTL frees locks whose owner died, and
//! unlock only removes a lock this instance still owns. It prevents duplicate
//! concurrent work; it is not strict mutual exclusion under every failure.

use std::{sync::Arc, time::Duration};

use switchboard_core::{CoreError, Result};
use tracing::debug;
use uuid::Uuid;

use crate::cache::SharedCache;

/// Lock client with a unique owner token.
#[derive(Debug, Clone)]
pub struct DistributedLock {
    cache: Arc<dyn SharedCache>,
    owner: String,
}

fn lock_key(name: &str) -> String {
    format!("lock:{name}")
}

impl DistributedLock {
    /// Creates a lock client with a fresh owner token.
    pub fn new(cache: Arc<dyn SharedCache>) -> Self {
        Self { cache, owner: Uuid::new_v4().to_string() }
    }

    /// Owner token written into held locks.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Tries to take `name` for `ttl`. Returns whether it was acquired.
    pub async fn try_lock(&self, name: &str, ttl: Duration) -> Result<bool> {
        let acquired = self.cache.set_nx(&lock_key(name), &self.owner, ttl).await?;
        debug!(lock = name, acquired, "try_lock");
        Ok(acquired)
    }

    /// Like [`DistributedLock::try_lock`], but contention is an error.
    pub async fn require(&self, name: &str, ttl: Duration) -> Result<()> {
        if self.try_lock(name, ttl).await? {
            Ok(())
        } else {
            Err(CoreError::LockContention { name: name.to_string() })
        }
    }

    /// Releases `name` if this client still owns it. Returns whether it was released.
    pub async fn unlock(&self, name: &str) -> Result<bool> {
        self.cache.delete_if_equals(&lock_key(name), &self.owner).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;

    #[tokio::test]
    async fn second_owner_is_refused_until_unlock() {
        let cache: Arc<dyn SharedCache> = Arc::new(MemoryCache::new());
        let first = DistributedLock::new(cache.clone());
        let second = DistributedLock::new(cache);

        assert!(first.try_lock("restore:acme", Duration::from_secs(30)).await.unwrap());
        assert!(!second.try_lock("restore:acme", Duration::from_secs(30)).await.unwrap());

        assert!(!second.unlock("restore:acme").await.unwrap());
        assert!(first.unlock("restore:acme").await.unwrap());

        assert!(second.try_lock("restore:acme", Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn require_reports_contention() {
        let cache: Arc<dyn SharedCache> = Arc::new(MemoryCache::new());
        let holder = DistributedLock::new(cache.clone());
        holder.require("job", Duration::from_secs(5)).await.unwrap();

        let err = DistributedLock::new(cache).require("job", Duration::from_secs(5)).await.unwrap_err();
        assert!(matches!(err, CoreError::LockContention { ref name } if name == "job"));
    }
}
