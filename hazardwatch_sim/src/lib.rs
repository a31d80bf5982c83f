//! HazardWatch Deterministic Simulation Testing (DST) Harness
//!
//! This crate provides a controlled environment where the corroboration
//! engine is driven by simulated citizens and checked against its invariants.
//!
//! # Core Principle
//!
//! All sources of non-determinism the engine sees are intercepted:
//! - **Time**: a virtual clock that scenarios advance explicitly
//! - **Randomness**: report placement and backoff jitter derive from one seed
//!
//! Thread scheduling is left to tokio, so scenarios assert properties that
//! must hold under every interleaving rather than exact outcomes.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     ScenarioRunner                          │
//! │  ┌──────────────┐   ┌──────────────┐   ┌──────────────┐     │
//! │  │  citizen #1  │   │  citizen #2  │   │  citizen #K  │ ... │
//! │  └──────┬───────┘   └──────┬───────┘   └──────┬───────┘     │
//! │         └──────── submit (tokio tasks) ───────┘             │
//! │                            │                                │
//! │              ┌─────────────▼─────────────┐                  │
//! │              │ HazardEngine<SimContext>  │                  │
//! │              └─────────────┬─────────────┘                  │
//! │                            │                                │
//! │              ┌─────────────▼─────────────┐                  │
//! │              │  Invariant checks         │                  │
//! │              └───────────────────────────┘                  │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use hazardwatch_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42, 24).run(ScenarioId::FlashMob);
//! assert!(result.passed);
//! ```

mod context;
mod runner;
pub mod scenarios;

pub use context::SimContext;
pub use runner::{ScenarioError, ScenarioMetrics, ScenarioResult, ScenarioRunner, SimEngine};
