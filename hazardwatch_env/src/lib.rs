//! HazardWatch Environment Abstraction Layer
//!
//! This crate provides the "Sans-IO" abstraction allowing the corroboration
//! engine to run in both **Production** (tokio) and **Simulation** (virtual
//! clock) environments.
//!
//! # Core Concept
//!
//! The engine never reads the clock or an RNG directly:
//! - Time (`now()`, `system_time()`, `sleep()`)
//! - Randomness (`jitter()` for contention backoff)
//! - Background work (`spawn()`)
//!
//! In simulation all of it is derived from a single 64-bit seed and a manual
//! clock, so a failing scenario is reproducible from its seed.
//!
//! # Example
//!
//! ```ignore
//! use hazardwatch_env::{HazardContext, TokioContext};
//!
//! async fn sweep_loop<Ctx: HazardContext>(ctx: &Ctx, engine: &Engine) {
//!     loop {
//!         engine.sweep_expired();
//!         ctx.sleep(Duration::from_secs(60)).await;
//!     }
//! }
//! ```

mod context;
mod error;
mod tokio_impl;

pub use context::{unix_millis, HazardContext};
pub use error::EnvError;
pub use tokio_impl::TokioContext;
