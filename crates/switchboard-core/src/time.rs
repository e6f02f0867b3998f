//! Clock abstraction for backoff sleeps, deadlines and time windows.
//!
//! Production code runs on [`RealClock`]. Tests inject a [`TestClock`] whose
//! `sleep` advances virtual time instantly and records the requested
//! duration, so retry sequences can be asserted without waiting.

use std::{
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use chrono::{DateTime, Utc};

/// Source of time for every timing decision in the gateway.
pub trait Clock: Send + Sync + std::fmt::Debug {
    /// Monotonic instant for measuring elapsed time and deadlines.
    fn now(&self) -> Instant;

    /// Wall clock time for timestamps and time windows.
    fn now_system(&self) -> SystemTime;

    /// Suspends for `duration`.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>>;

    /// Wall clock time as a UTC datetime.
    fn now_utc(&self) -> DateTime<Utc> {
        DateTime::<Utc>::from(self.now_system())
    }

    /// Wall clock time in whole milliseconds since the Unix epoch.
    fn unix_millis(&self) -> u64 {
        let since_epoch = self.now_system().duration_since(UNIX_EPOCH).unwrap_or_default();
        u64::try_from(since_epoch.as_millis()).unwrap_or(u64::MAX)
    }
}

/// Clock backed by the operating system and tokio timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct RealClock;

impl RealClock {
    /// Creates a real clock.
    pub fn new() -> Self {
        Self
    }
}

impl Clock for RealClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    fn now_system(&self) -> SystemTime {
        SystemTime::now()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Deterministic clock for tests.
///
/// Clones share the same virtual time.
#[derive(Debug, Clone)]
pub struct TestClock {
    offset_ns: Arc<AtomicU64>,
    base_instant: Instant,
    base_system: SystemTime,
    sleeps: Arc<Mutex<Vec<Duration>>>,
}

fn saturating_nanos(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

impl TestClock {
    /// Creates a clock starting at the current wall time.
    pub fn new() -> Self {
        Self::starting_at(SystemTime::now())
    }

    /// Creates a clock starting at `start`.
    pub fn starting_at(start: SystemTime) -> Self {
        Self {
            offset_ns: Arc::new(AtomicU64::new(0)),
            base_instant: Instant::now(),
            base_system: start,
            sleeps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Advances virtual time.
    pub fn advance(&self, duration: Duration) {
        self.offset_ns.fetch_add(saturating_nanos(duration), Ordering::AcqRel);
    }

    /// Virtual time elapsed since creation.
    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.offset_ns.load(Ordering::Acquire))
    }

    /// Every duration passed to `sleep`, in call order.
    pub fn sleeps(&self) -> Vec<Duration> {
        self.sleeps.lock().map(|sleeps| sleeps.clone()).unwrap_or_default()
    }
}

impl Default for TestClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TestClock {
    fn now(&self) -> Instant {
        self.base_instant + self.elapsed()
    }

    fn now_system(&self) -> SystemTime {
        self.base_system + self.elapsed()
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
        if let Ok(mut sleeps) = self.sleeps.lock() {
            sleeps.push(duration);
        }
        self.advance(duration);
        Box::pin(tokio::task::yield_now())
    }
}
