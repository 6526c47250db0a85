//! Core environment context trait for the AVL engine.

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// The central interface for time and task scheduling.
///
/// Abstracts the "real world" clock so the matching engine and the timeout
/// supervisor can run either live (tokio) or against a virtual clock while
/// replaying recorded AVL data.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time` and the system clock
/// - **Replay**: `SimContext` (in `avl_sim`) - manually advanced virtual clock
#[async_trait]
pub trait AvlContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time used to judge AVL report freshness.
    ///
    /// In replay, this is derived from virtual clock + epoch offset.
    fn system_time(&self) -> SystemTime;

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In replay: advances the virtual clock
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Returns the logical clock as epoch milliseconds.
    ///
    /// All engine timestamps (AVL times, event times) use this unit.
    fn epoch_millis(&self) -> i64 {
        self.system_time()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as i64)
            .unwrap_or(0)
    }
}
