//! Task spawning abstraction for single-threaded environments.

use async_trait::async_trait;
use std::future::Future;

/// Provider for spawning local tasks in a single-threaded context.
///
/// The dispatcher spawns one long-lived task per control loop (dispatch,
/// accept-or-connect) plus one per connection. All of them are `!Send`
/// futures, so spawning goes through `spawn_local` and callers must be
/// running inside a `tokio::task::LocalSet` (or equivalent).
#[async_trait(?Send)]
pub trait TaskProvider: Clone {
    /// Spawn a named task that runs on the current thread.
    ///
    /// The name is used for diagnostics only.
    fn spawn_task<F>(&self, name: &str, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + 'static;

    /// Yield control to allow other tasks to run.
    async fn yield_now(&self);
}

/// Real task provider using `tokio::task::spawn_local`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioTaskProvider;

#[async_trait(?Send)]
impl TaskProvider for TokioTaskProvider {
    fn spawn_task<F>(&self, name: &str, future: F) -> tokio::task::JoinHandle<()>
    where
        F: Future<Output = ()> + 'static,
    {
        tracing::debug!(task = name, "spawning background task");
        tokio::task::spawn_local(future)
    }

    async fn yield_now(&self) {
        tokio::task::yield_now().await;
    }
}
