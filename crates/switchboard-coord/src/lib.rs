//! Coordination primitives over a shared cache.
//!
//! Rate limiting, deduplication and advisory locking are stateless wrappers
//! around a [`SharedCache`]. They add no in-process locking of their own, so
//! every process pointed at the same cache observes the same decisions.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cache;
pub mod dedup;
pub mod lock;
pub mod rate_limit;

pub use cache::{MemoryCache, RedisCache, SharedCache};
pub use dedup::Deduplicator;
pub use lock::DistributedLock;
pub use rate_limit::{RateLimitConfig, RateLimitDecision, RateLimiter};
