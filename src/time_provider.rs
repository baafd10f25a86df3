//! Time abstraction for testable liveness and recency logic
//!
//! Staleness decisions compare wall-clock timestamps, so tests need a
//! clock they can move by hand instead of sleeping through `T_stale`.

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::sleep as tokio_sleep;

/// Trait for providing time-related functionality
#[async_trait]
pub trait TimeProvider: Send + Sync + std::fmt::Debug {
    /// Current wall-clock time
    #[must_use]
    fn now(&self) -> DateTime<Utc>;

    /// Sleep for the specified duration
    async fn sleep(&self, duration: Duration);
}

/// Real clock for production use
#[derive(Debug, Clone, Default)]
pub struct RealTimeProvider;

impl RealTimeProvider {
    /// Creates a new real time provider
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl TimeProvider for RealTimeProvider {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio_sleep(duration).await;
    }
}

/// Hand-advanced clock for tests.
///
/// `sleep` yields once instead of waiting, so sweeper loops spin fast
/// while `now()` only moves when the test calls `advance`.
#[derive(Debug, Clone)]
pub struct MockTimeProvider {
    current: Arc<Mutex<DateTime<Utc>>>,
}

impl MockTimeProvider {
    /// Creates a mock clock starting at the given instant
    #[must_use]
    pub fn starting_at(start: DateTime<Utc>) -> Self {
        Self {
            current: Arc::new(Mutex::new(start)),
        }
    }

    /// Creates a mock clock starting at the real current time
    #[must_use]
    pub fn new() -> Self {
        Self::starting_at(Utc::now())
    }

    /// Moves the clock forward by whole seconds
    pub fn advance_secs(&self, secs: i64) {
        let mut current = self.current.lock().expect("clock mutex poisoned");
        *current += ChronoDuration::seconds(secs);
    }
}

impl Default for MockTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TimeProvider for MockTimeProvider {
    fn now(&self) -> DateTime<Utc> {
        *self.current.lock().expect("clock mutex poisoned")
    }

    async fn sleep(&self, _duration: Duration) {
        // Yield so other tasks (the code under test) can make progress.
        tokio_sleep(Duration::from_millis(1)).await;
    }
}

/// Type alias for shared time provider
pub type SharedTimeProvider = Arc<dyn TimeProvider>;

/// Create a production time provider
#[must_use]
pub fn production_time_provider() -> SharedTimeProvider {
    Arc::new(RealTimeProvider::new())
}
