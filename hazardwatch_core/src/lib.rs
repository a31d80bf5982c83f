//! HazardWatch Core - Corroboration Engine for Crowd-Sourced Road Hazards
//!
//! This library solves three problems of citizen hazard reporting:
//! 1. **Duplicate Pothole Problem**: many photos of one hazard collapse into a
//!    single cluster via H3 bucketing + haversine gating
//! 2. **Lone Reporter Problem**: a hazard only reaches the public map once
//!    independent reporters corroborate it
//! 3. **Concurrent Crowd Problem**: simultaneous reports of one spot are
//!    serialized by H3 region locks, so no two clusters race into existence

pub mod geodesy;
pub mod hazard_ingest;
pub mod hazard_space;
pub mod hazard_matching;
pub mod hazard_lifecycle;
pub mod hazard_store;
pub mod engine_runtime;

// Re-export key types for convenience
pub use engine_runtime::{EngineConfig, HazardEngine, Submission, SubmitError};
pub use geodesy::{haversine_m, GeoPoint};
pub use hazard_ingest::{resolve_location, IngestError, LocationMethod, Report, ReportCandidate};
pub use hazard_lifecycle::ClusterStatus;
pub use hazard_matching::{ClusterSummary, HazardCluster, VerifiedHazard};
pub use hazard_store::{HazardStore, MemoryStore, SledStore, StoreError};
