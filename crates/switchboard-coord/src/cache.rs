//! Shared cache contract with in-memory and Redis backends.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard,
    },
    time::{Duration, Instant},
};

use redis::aio::ConnectionManager;
use switchboard_core::{Clock, CoreError, RealClock, Result};
use tracing::{debug, info};

/// The handful of atomic cache operations the coordination primitives need.
///
/// Every operation must be atomic on the backing store; callers rely on
/// that rather than on local locking.
#[async_trait::async_trait]
pub trait SharedCache: Send + Sync + std::fmt::Debug {
    /// Increments an integer key, creating it at zero, and returns the new value.
    async fn incr(&self, key: &str) -> Result<i64>;

    /// Sets a key's time to live.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    /// Stores `value` only if `key` is absent. Returns whether it was stored.
    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool>;

    /// Reads a string key.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Removes a key.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Removes `key` only if it currently holds `expected`. Returns whether it was removed.
    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool>;
}

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

/// Writes between two sweeps of expired entries.
const SWEEP_EVERY: u64 = 256;

/// Process-local cache with clock driven expiry.
///
/// Suitable for single-instance deployments and tests. Expired entries are
/// evicted on access, and every [`SWEEP_EVERY`] writes the whole map is
/// swept so keys that are never read again do not accumulate.
#[derive(Debug, Clone)]
pub struct MemoryCache {
    entries: Arc<Mutex<HashMap<String, Entry>>>,
    writes: Arc<AtomicU64>,
    clock: Arc<dyn Clock>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryCache {
    /// Creates an empty cache on the real clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(RealClock::new()))
    }

    /// Creates an empty cache on the given clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            writes: Arc::new(AtomicU64::new(0)),
            clock,
        }
    }

    /// Number of entries held, expired ones included until the next sweep.
    pub fn len(&self) -> usize {
        self.entries.lock().map(|entries| entries.len()).unwrap_or(0)
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entries(&self) -> Result<MutexGuard<'_, HashMap<String, Entry>>> {
        self.entries.lock().map_err(|_| CoreError::cache("memory cache lock poisoned"))
    }

    fn live<'a>(
        entries: &'a mut HashMap<String, Entry>,
        key: &str,
        now: Instant,
    ) -> Option<&'a mut Entry> {
        let expired = entries
            .get(key)
            .and_then(|entry| entry.expires_at)
            .is_some_and(|deadline| deadline <= now);
        if expired {
            entries.remove(key);
        }
        entries.get_mut(key)
    }

    /// Counts a write and drops every expired entry once per [`SWEEP_EVERY`] writes.
    fn note_write(&self, entries: &mut HashMap<String, Entry>, now: Instant) {
        let writes = self.writes.fetch_add(1, Ordering::Relaxed) + 1;
        if writes % SWEEP_EVERY == 0 {
            let before = entries.len();
            entries.retain(|_, entry| !entry.expires_at.is_some_and(|deadline| deadline <= now));
            let swept = before - entries.len();
            if swept > 0 {
                debug!(swept, remaining = entries.len(), "swept expired cache entries");
            }
        }
    }
}

#[async_trait::async_trait]
impl SharedCache for MemoryCache {
    async fn incr(&self, key: &str) -> Result<i64> {
        let now = self.clock.now();
        let mut entries = self.entries()?;

        let next = match Self::live(&mut entries, key, now) {
            Some(entry) => {
                let current: i64 = entry.value.parse().map_err(|_| {
                    CoreError::cache(format!("value at '{key}' is not an integer"))
                })?;
                entry.value = (current + 1).to_string();
                current + 1
            },
            None => {
                entries.insert(key.to_string(), Entry { value: "1".into(), expires_at: None });
                1
            },
        };
        self.note_write(&mut entries, now);
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let now = self.clock.now();
        let mut entries = self.entries()?;
        if let Some(entry) = Self::live(&mut entries, key, now) {
            entry.expires_at = Some(now + ttl);
        }
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let now = self.clock.now();
        let mut entries = self.entries()?;
        if Self::live(&mut entries, key, now).is_some() {
            return Ok(false);
        }
        entries.insert(key.to_string(), Entry { value: value.to_string(), expires_at: Some(now + ttl) });
        self.note_write(&mut entries, now);
        Ok(true)
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = self.clock.now();
        let mut entries = self.entries()?;
        Ok(Self::live(&mut entries, key, now).map(|entry| entry.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries()?.remove(key);
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let now = self.clock.now();
        let mut entries = self.entries()?;
        let matches = Self::live(&mut entries, key, now).is_some_and(|entry| entry.value == expected);
        if matches {
            entries.remove(key);
        }
        Ok(matches)
    }
}

const DELETE_IF_EQUALS: &str = r#"
if redis.call("GET", KEYS[1]) == ARGV[1] then
    return redis.call("DEL", KEYS[1])
end
return 0
"#;

fn redis_error(err: redis::RedisError) -> CoreError {
    CoreError::cache(err.to_string())
}

fn ttl_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

/// Redis backed cache shared by every gateway process.
///
/// Uses a [`ConnectionManager`], which multiplexes one connection and
/// reconnects transparently after failures.
#[derive(Clone)]
pub struct RedisCache {
    conn: ConnectionManager,
    unlock_script: Arc<redis::Script>,
}

impl std::fmt::Debug for RedisCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisCache").finish_non_exhaustive()
    }
}

impl RedisCache {
    /// Connects to the Redis server at `url`.
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(redis_error)?;
        let conn = ConnectionManager::new(client).await.map_err(redis_error)?;
        info!("connected to redis");

        Ok(Self { conn, unlock_script: Arc::new(redis::Script::new(DELETE_IF_EQUALS)) })
    }
}

#[async_trait::async_trait]
impl SharedCache for RedisCache {
    async fn incr(&self, key: &str) -> Result<i64> {
        let mut conn = self.conn.clone();
        let value: i64 =
            redis::cmd("INCR").arg(key).query_async(&mut conn).await.map_err(redis_error)?;
        Ok(value)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("PEXPIRE")
            .arg(key)
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(())
    }

    async fn set_nx(&self, key: &str, value: &str, ttl: Duration) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(key)
            .arg(value)
            .arg("NX")
            .arg("PX")
            .arg(ttl_millis(ttl))
            .query_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(reply.is_some())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let value: Option<String> =
            redis::cmd("GET").arg(key).query_async(&mut conn).await.map_err(redis_error)?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("DEL").arg(key).query_async(&mut conn).await.map_err(redis_error)?;
        Ok(())
    }

    async fn delete_if_equals(&self, key: &str, expected: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .unlock_script
            .key(key)
            .arg(expected)
            .invoke_async(&mut conn)
            .await
            .map_err(redis_error)?;
        Ok(removed == 1)
    }
}
