//! Time provider abstraction.
//!
//! Sleeping, timeouts, and monotonic "time since start" queries go through
//! [`TimeProvider`] so the dispatcher's rate limits and schedules can be
//! exercised against any clock implementation.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

/// Error returned when a [`TimeProvider::timeout`] expires before the inner
/// future completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("operation timed out")]
pub struct Elapsed;

/// Provider trait for time operations.
///
/// `now()` is monotonic time elapsed since provider creation, suitable for
/// scheduling comparisons (flush rate limiting, periodic save deadlines).
/// It is not wall-clock time.
#[async_trait(?Send)]
pub trait TimeProvider: Clone {
    /// Sleep for the specified duration.
    async fn sleep(&self, duration: Duration);

    /// Monotonic time elapsed since provider creation.
    fn now(&self) -> Duration;

    /// Run a future with a timeout.
    ///
    /// Returns `Ok(result)` if the future completes within the timeout, or
    /// `Err(Elapsed)` if it times out.
    async fn timeout<F, T>(&self, duration: Duration, future: F) -> Result<T, Elapsed>
    where
        F: std::future::Future<Output = T>;
}

/// Real time provider using Tokio's time facilities.
#[derive(Debug, Clone)]
pub struct TokioTimeProvider {
    /// Start time for calculating elapsed duration
    start_time: std::time::Instant,
}

impl TokioTimeProvider {
    /// Create a new Tokio time provider.
    pub fn new() -> Self {
        Self {
            start_time: std::time::Instant::now(),
        }
    }
}

impl Default for TokioTimeProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait(?Send)]
impl TimeProvider for TokioTimeProvider {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }

    fn now(&self) -> Duration {
        self.start_time.elapsed()
    }

    async fn timeout<F, T>(&self, duration: Duration, future: F) -> Result<T, Elapsed>
    where
        F: std::future::Future<Output = T>,
    {
        match tokio::time::timeout(duration, future).await {
            Ok(result) => Ok(result),
            Err(_) => Err(Elapsed),
        }
    }
}
