//! Simulation context implementing HazardContext for deterministic testing.

use async_trait::async_trait;
use hazardwatch_env::HazardContext;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Simulation context backed by deterministic time and RNG.
///
/// This implements `HazardContext` using:
/// - A virtual clock that only moves when a scenario advances it
/// - A seeded ChaCha8 RNG for backoff jitter
/// - Simulated sleep that yields to the scheduler without moving the clock
pub struct SimContext {
    /// Master seed for this simulation
    seed: u64,

    /// Current virtual time (nanoseconds since simulation start)
    virtual_time_ns: Arc<Mutex<u64>>,

    /// Deterministic RNG for jitter
    rng: Arc<Mutex<ChaCha8Rng>>,

    /// Epoch offset (virtual time 0 maps to this wall-clock time)
    epoch: SystemTime,
}

impl SimContext {
    /// Creates a new SimContext with the given seed.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            virtual_time_ns: Arc::new(Mutex::new(0)),
            rng: Arc::new(Mutex::new(ChaCha8Rng::seed_from_u64(seed))),
            epoch: UNIX_EPOCH + Duration::from_secs(1704067200), // 2024-01-01 00:00:00 UTC
        }
    }

    /// Creates an Arc-wrapped context for sharing.
    pub fn shared(seed: u64) -> Arc<Self> {
        Arc::new(Self::new(seed))
    }

    /// Advances virtual time by the given duration.
    pub fn advance_time(&self, duration: Duration) {
        let mut time = self
            .virtual_time_ns
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *time = time.saturating_add(duration.as_nanos() as u64);
    }

    /// Returns the current virtual time in nanoseconds.
    pub fn time_ns(&self) -> u64 {
        *self
            .virtual_time_ns
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Derives a scenario-local RNG from the master seed.
    pub fn derive_rng(&self, stream: u64) -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(self.seed.wrapping_mul(0x9e3779b97f4a7c15) ^ stream)
    }
}

impl Clone for SimContext {
    fn clone(&self) -> Self {
        Self {
            seed: self.seed,
            virtual_time_ns: Arc::clone(&self.virtual_time_ns),
            rng: Arc::clone(&self.rng),
            epoch: self.epoch,
        }
    }
}

#[async_trait]
impl HazardContext for SimContext {
    fn now(&self) -> Duration {
        Duration::from_nanos(self.time_ns())
    }

    fn system_time(&self) -> SystemTime {
        self.epoch + self.now()
    }

    async fn sleep(&self, _duration: Duration) {
        // Time is scenario-driven; waiting units just let others run
        tokio::task::yield_now().await;
    }

    fn spawn<F>(&self, name: &str, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        tracing::debug!(task = name, "Spawning simulated task");
        tokio::spawn(future);
    }

    fn jitter(&self, max: Duration) -> Duration {
        let max_nanos = max.as_nanos().min(u64::MAX as u128) as u64;
        if max_nanos == 0 {
            return Duration::ZERO;
        }
        let mut rng = self.rng.lock().unwrap_or_else(PoisonError::into_inner);
        Duration::from_nanos(rng.gen_range(0..=max_nanos))
    }

    fn seed(&self) -> u64 {
        self.seed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sim_context_time() {
        let ctx = SimContext::new(42);
        assert_eq!(ctx.now(), Duration::ZERO);

        ctx.advance_time(Duration::from_secs(1));
        assert_eq!(ctx.now(), Duration::from_secs(1));

        ctx.advance_time(Duration::from_millis(500));
        assert_eq!(ctx.now(), Duration::from_millis(1500));
    }

    #[test]
    fn test_sim_context_wall_clock() {
        let ctx = SimContext::new(42);
        assert_eq!(ctx.now_millis().unwrap(), 1_704_067_200_000);

        ctx.advance_time(Duration::from_secs(3_600));
        assert_eq!(ctx.now_millis().unwrap(), 1_704_067_200_000 + 3_600_000);
    }

    #[test]
    fn test_sim_context_deterministic_jitter() {
        let ctx1 = SimContext::new(42);
        let ctx2 = SimContext::new(42);
        let max = Duration::from_millis(50);

        let a: Vec<Duration> = (0..16).map(|_| ctx1.jitter(max)).collect();
        let b: Vec<Duration> = (0..16).map(|_| ctx2.jitter(max)).collect();

        // Same seed = same jitter sequence
        assert_eq!(a, b);
        assert!(a.iter().all(|d| *d <= max));
        assert_eq!(ctx1.jitter(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn test_sim_context_seed() {
        let ctx = SimContext::new(12345);
        assert_eq!(ctx.seed(), 12345);
    }

    #[test]
    fn test_sim_context_clone_shares_time() {
        let ctx1 = SimContext::new(42);
        let ctx2 = ctx1.clone();

        ctx1.advance_time(Duration::from_secs(5));

        // Both should see the same time
        assert_eq!(ctx1.now(), ctx2.now());
    }

    #[tokio::test]
    async fn test_sim_sleep_does_not_move_clock() {
        let ctx = SimContext::new(7);
        ctx.sleep(Duration::from_secs(60)).await;
        assert_eq!(ctx.now(), Duration::ZERO);
    }
}
