//! Core environment context trait for HazardWatch engines.

use async_trait::async_trait;
use std::future::Future;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::EnvError;

/// The central interface for Environment Interaction.
///
/// This trait abstracts the "real world" so that the corroboration engine can
/// run in both production (tokio) and simulation (virtual clock) environments.
///
/// # Implementations
///
/// - **Production**: `TokioContext` - wraps `tokio::time`, thread RNG
/// - **Simulation**: `SimContext` - manual virtual clock, `ChaCha8Rng(seed)`
///
/// # Determinism
///
/// For simulation testing, every source of non-determinism the engine touches
/// (wall clock, backoff jitter) is routed through this trait.
#[async_trait]
pub trait HazardContext: Send + Sync + 'static {
    /// Returns the current monotonic time since context creation.
    fn now(&self) -> Duration;

    /// Returns the wall-clock time used to stamp reports on receipt.
    ///
    /// In simulation, this is derived from virtual clock + epoch offset.
    fn system_time(&self) -> SystemTime;

    /// Wall-clock time as Unix milliseconds.
    fn now_millis(&self) -> Result<i64, EnvError> {
        unix_millis(self.system_time())
    }

    /// Suspends execution for the given duration.
    ///
    /// In production: wraps `tokio::time::sleep`
    /// In simulation: advances nothing, only yields to the scheduler
    async fn sleep(&self, duration: Duration);

    /// Spawns a background task.
    fn spawn<F>(&self, name: &str, future: F)
    where
        F: Future<Output = ()> + Send + 'static;

    /// Returns a uniformly random duration in `[0, max]`.
    ///
    /// Used to de-synchronise retries of contending report units.
    fn jitter(&self, max: Duration) -> Duration;

    /// Returns the context's seed (for logging/debugging).
    ///
    /// In production, returns 0 (not seeded).
    fn seed(&self) -> u64;
}

/// Converts a wall-clock instant to Unix milliseconds.
pub fn unix_millis(time: SystemTime) -> Result<i64, EnvError> {
    let since_epoch = time
        .duration_since(UNIX_EPOCH)
        .map_err(|e| EnvError::Clock(format!("system time before Unix epoch: {}", e)))?;
    i64::try_from(since_epoch.as_millis())
        .map_err(|_| EnvError::Clock("system time out of range".to_string()))
}
