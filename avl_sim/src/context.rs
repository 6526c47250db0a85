//! Simulation context implementing AvlContext for deterministic replay.

use async_trait::async_trait;
use avl_env::AvlContext;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::trace;

/// Virtual time 0 maps to 2024-01-01 00:00:00 UTC.
pub const SIM_EPOCH_MS: i64 = 1_704_067_200_000;

/// Simulation context backed by a manually advanced clock.
///
/// `sleep` advances virtual time instead of waiting, so a supervisor loop
/// driven by this context covers hours of service in microseconds.
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Current virtual time (nanoseconds since simulation start)
    virtual_time_ns: Arc<Mutex<u64>>,

    /// Epoch offset (virtual time 0 maps to this wall-clock time)
    epoch: SystemTime,
}

impl SimContext {
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            virtual_time_ns: Arc::new(Mutex::new(0)),
            epoch: UNIX_EPOCH + Duration::from_millis(SIM_EPOCH_MS as u64),
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    pub fn seed(&self) -> u64 {
        self.seed
    }

    /// Advances virtual time by the given duration.
    pub fn advance_time(&self, duration: Duration) {
        let mut time = self.virtual_time_ns.lock().unwrap_or_else(|e| e.into_inner());
        *time += duration.as_nanos() as u64;
    }

    /// Moves the clock to an epoch instant. The clock never runs backwards;
    /// earlier instants are ignored.
    pub fn set_epoch_millis(&self, epoch_ms: i64) {
        let target_ns = (epoch_ms - SIM_EPOCH_MS).max(0) as u64 * 1_000_000;
        let mut time = self.virtual_time_ns.lock().unwrap_or_else(|e| e.into_inner());
        if target_ns > *time {
            *time = target_ns;
        } else if target_ns < *time {
            trace!(epoch_ms, "ignoring backwards clock move");
        }
    }

    /// Returns the current virtual time in nanoseconds.
    pub fn time_ns(&self) -> u64 {
        *self.virtual_time_ns.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            virtual_time_ns: Arc::clone(&self.virtual_time_ns),
            epoch: self.epoch,
        }
    }
}

#[async_trait]
impl AvlContext for SimContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.time_ns())
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    async fn sleep(&self, duration: Duration) {
        // Sleeping is how virtual time moves forward
        self.advance_time(duration);
        tokio::task::yield_now().await;
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        trace!(task = name, "spawning simulated task");
        tokio::spawn(future);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_context_time() {
        let ctx = SimContext::new(42);
        assert_eq!(ctx.now(), Duration::ZERO);
        assert_eq!(ctx.epoch_millis(), SIM_EPOCH_MS);

        ctx.advance_time(Duration::from_secs(1));
        assert_eq!(ctx.now(), Duration::from_secs(1));

        ctx.advance_time(Duration::from_millis(500));
        assert_eq!(ctx.epoch_millis(), SIM_EPOCH_MS + 1500);
    }

    #[test]
    fn test_set_epoch_never_goes_backwards() {
        let ctx = SimContext::new(1);
        ctx.set_epoch_millis(SIM_EPOCH_MS + 60_000);
        assert_eq!(ctx.epoch_millis(), SIM_EPOCH_MS + 60_000);
        ctx.set_epoch_millis(SIM_EPOCH_MS + 1_000);
        assert_eq!(ctx.epoch_millis(), SIM_EPOCH_MS + 60_000);
    }

    #[test]
    fn test_sim_context_clone_shares_time() {
        let ctx1 = SimContext::new(42);
        let ctx2 = ctx1.clone();

        ctx1.advance_time(Duration::from_secs(5));
        assert_eq!(ctx1.now(), ctx2.now());
        assert_eq!(ctx2.seed(), 42);
    }

    #[tokio::test]
    async fn test_sleep_advances_virtual_time() {
        let ctx = SimContext::new(7);
        ctx.sleep(Duration::from_secs(30)).await;
        assert_eq!(ctx.now(), Duration::from_secs(30));
    }
}
