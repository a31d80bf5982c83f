//! Scenario runner - drives the engine through stress scenarios and checks
//! the corroboration invariants at the end of each.

use crate::context::SimContext;
use crate::scenarios::ScenarioId;

use h3o::Resolution;
use hazardwatch_core::hazard_space::{cell_at, SpatialError};
use hazardwatch_core::{
    haversine_m, ClusterStatus, EngineConfig, GeoPoint, HazardEngine, HazardStore, MemoryStore,
    ReportCandidate, StoreError, Submission, SubmitError,
};
use hazardwatch_env::HazardContext;
use rand::Rng;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

/// The engine as wired for simulation.
pub type SimEngine = HazardEngine<SimContext, MemoryStore>;

/// Resubmissions a simulated client attempts on retryable errors.
const MAX_CLIENT_RETRIES: u64 = 32;

const HOUR: Duration = Duration::from_secs(3_600);

/// Scenario anchor (New Delhi).
const CITY_CENTER: GeoPoint = GeoPoint {
    lat: 28.6139,
    lng: 77.2090,
};

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("assertion failed: {0}")]
    Assertion(String),

    #[error(transparent)]
    Submit(#[from] SubmitError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Spatial(#[from] SpatialError),

    #[error("runtime error: {0}")]
    Runtime(String),
}

fn check(condition: bool, message: impl FnOnce() -> String) -> Result<(), ScenarioError> {
    if condition {
        Ok(())
    } else {
        Err(ScenarioError::Assertion(message()))
    }
}

/// Results from running a scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioResult {
    /// Scenario that was run
    #[serde(serialize_with = "serialize_scenario")]
    pub scenario: ScenarioId,

    /// Seed used
    pub seed: u64,

    /// Whether scenario passed all assertions
    pub passed: bool,

    /// Failure message if any
    pub failure_reason: Option<String>,

    /// Metrics collected during run
    pub metrics: ScenarioMetrics,
}

fn serialize_scenario<S: serde::Serializer>(id: &ScenarioId, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_str(id.name())
}

/// Metrics collected during scenario execution.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioMetrics {
    /// Reports accepted by the engine
    pub reports_submitted: u64,

    /// Client resubmissions after retryable errors
    pub resubmissions: u64,

    pub clusters_live: usize,
    pub clusters_verified: usize,
    pub clusters_merged: usize,
    pub clusters_expired: usize,
}

/// Runs engine scenarios.
pub struct ScenarioRunner {
    /// Configuration seed
    seed: u64,

    /// Reports per burst
    burst_size: usize,

    config: EngineConfig,
}

impl ScenarioRunner {
    /// Creates a new scenario runner.
    pub fn new(seed: u64, burst_size: usize) -> Self {
        Self {
            seed,
            burst_size: burst_size.max(2),
            config: EngineConfig {
                lock_max_attempts: 64,
                ..Default::default()
            },
        }
    }

    /// Overrides the engine configuration.
    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Runs a scenario and returns the result.
    pub fn run(&self, scenario: ScenarioId) -> ScenarioResult {
        info!("Starting scenario: {} (seed={})", scenario.name(), self.seed);

        let mut metrics = ScenarioMetrics::default();
        let outcome = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(4)
            .enable_all()
            .build()
            .map_err(|e| ScenarioError::Runtime(e.to_string()))
            .and_then(|runtime| runtime.block_on(self.run_async(scenario, &mut metrics)));

        let failure_reason = outcome.err().map(|e| e.to_string());
        if let Some(reason) = &failure_reason {
            warn!("{} (seed={}) failed: {}", scenario.name(), self.seed, reason);
        }

        ScenarioResult {
            scenario,
            seed: self.seed,
            passed: failure_reason.is_none(),
            failure_reason,
            metrics,
        }
    }

    async fn run_async(
        &self,
        scenario: ScenarioId,
        metrics: &mut ScenarioMetrics,
    ) -> Result<(), ScenarioError> {
        let context = SimContext::shared(self.seed);
        let engine = Arc::new(HazardEngine::new(
            Arc::clone(&context),
            MemoryStore::new(),
            self.config.clone(),
        )?);

        match scenario {
            ScenarioId::FlashMob => self.run_flash_mob(&engine, metrics).await?,
            ScenarioId::SelfVerify => self.run_self_verify(&engine, metrics).await?,
            ScenarioId::BoundaryRace => self.run_boundary_race(&engine, metrics).await?,
            ScenarioId::StaleSpot => self.run_stale_spot(&engine, metrics).await?,
            ScenarioId::CitySpread => self.run_city_spread(&engine, metrics).await?,
        }

        record_final_state(&engine, metrics)?;
        check_index_consistency(&engine)
    }

    /// DST-001: FlashMob - K reporters hit one spot at the same instant.
    ///
    /// **Assertion**: exactly one live cluster, VERIFIED, with all K members.
    async fn run_flash_mob(
        &self,
        engine: &Arc<SimEngine>,
        metrics: &mut ScenarioMetrics,
    ) -> Result<(), ScenarioError> {
        let mut rng = engine.context().derive_rng(1);
        let spot = random_spot(&mut rng, 3_000.0);

        let candidates = (0..self.burst_size)
            .map(|i| {
                let p = offset(spot, rng.gen_range(-5.0..5.0), rng.gen_range(-5.0..5.0));
                candidate(p, &format!("mob-{}", i)).with_description("Pothole")
            })
            .collect();
        submit_all(engine, candidates, metrics).await?;

        let live = engine.store().list_live()?;
        check(live.len() == 1, || format!("expected 1 live cluster, found {}", live.len()))?;
        let cluster = &live[0];
        check(cluster.status == ClusterStatus::Verified, || {
            format!("cluster is {}", cluster.status)
        })?;
        check(cluster.members.len() == self.burst_size, || {
            format!("cluster has {} of {} reports", cluster.members.len(), self.burst_size)
        })?;

        let feed = engine.verified_hazards();
        check(feed.len() == 1 && feed[0].report_count == self.burst_size, || {
            format!("feed out of sync: {:?}", feed)
        })?;

        info!("✓ FlashMob: {} reports → 1 verified hazard", self.burst_size);
        Ok(())
    }

    /// DST-002: SelfVerify - one session cannot corroborate itself.
    async fn run_self_verify(
        &self,
        engine: &Arc<SimEngine>,
        metrics: &mut ScenarioMetrics,
    ) -> Result<(), ScenarioError> {
        let mut rng = engine.context().derive_rng(2);
        let spot = random_spot(&mut rng, 3_000.0);

        let candidates = (0..self.burst_size)
            .map(|_| {
                let p = offset(spot, rng.gen_range(-10.0..10.0), rng.gen_range(-10.0..10.0));
                candidate(p, "spammer")
            })
            .collect();
        submit_all(engine, candidates, metrics).await?;

        let live = engine.store().list_live()?;
        check(live.len() == 1, || format!("expected 1 live cluster, found {}", live.len()))?;
        check(live[0].status == ClusterStatus::Pending, || {
            format!("single session reached {}", live[0].status)
        })?;
        check(engine.verified_hazards().is_empty(), || {
            "self-reported hazard reached the map".to_string()
        })?;
        Ok(())
    }

    /// DST-003: BoundaryRace - concurrent reports on both sides of a cell edge.
    ///
    /// **Assertion**: a single surviving cluster holds every report.
    async fn run_boundary_race(
        &self,
        engine: &Arc<SimEngine>,
        metrics: &mut ScenarioMetrics,
    ) -> Result<(), ScenarioError> {
        let mut rng = engine.context().derive_rng(3);
        let start = random_spot(&mut rng, 3_000.0);
        let edge = find_cell_edge(start, self.config.h3_resolution)?;
        debug!("Cell edge at {:?}", edge);

        let candidates: Vec<ReportCandidate> = (0..self.burst_size)
            .map(|i| {
                let side = if i % 2 == 0 { -8.0 } else { 8.0 };
                let p = offset(edge, rng.gen_range(-5.0..5.0), side);
                candidate(p, &format!("edge-{}", i))
            })
            .collect();

        let cells: HashSet<_> = candidates
            .iter()
            .filter_map(|c| c.lat.zip(c.lng))
            .filter_map(|(lat, lng)| cell_at(GeoPoint::new(lat, lng), self.config.h3_resolution).ok())
            .collect();
        debug!("Reports span {} cells", cells.len());

        let submissions = submit_all(engine, candidates, metrics).await?;

        let live = engine.store().list_live()?;
        check(live.len() == 1, || {
            format!("edge split the hazard into {} clusters", live.len())
        })?;
        check(live[0].members.len() == submissions.len(), || {
            format!("{} of {} reports in survivor", live[0].members.len(), submissions.len())
        })?;
        Ok(())
    }

    /// DST-004: StaleSpot - idle clusters expire, by sweep or lazily.
    async fn run_stale_spot(
        &self,
        engine: &Arc<SimEngine>,
        metrics: &mut ScenarioMetrics,
    ) -> Result<(), ScenarioError> {
        let context = Arc::clone(engine.context());
        let mut rng = context.derive_rng(4);
        let spot = random_spot(&mut rng, 3_000.0);

        let swept = submit_with_retry(engine, candidate(spot, "a"), metrics).await?;

        context.advance_time(HOUR * 72);
        check(engine.sweep_expired().await? == 0, || "expired at the window edge".into())?;

        context.advance_time(HOUR);
        let expired = engine.sweep_expired().await?;
        check(expired == 1, || format!("sweep expired {} clusters", expired))?;

        let fresh = submit_with_retry(engine, candidate(spot, "b"), metrics).await?;
        check(fresh.cluster_id != swept.cluster_id, || "report revived an expired cluster".into())?;
        check(fresh.status == ClusterStatus::Pending && fresh.report_count == 1, || {
            format!("fresh cluster is {} with {} reports", fresh.status, fresh.report_count)
        })?;

        // Idle again, then reported with no sweep in between
        context.advance_time(HOUR * 73);
        let again = submit_with_retry(engine, candidate(spot, "c"), metrics).await?;
        check(again.cluster_id != fresh.cluster_id, || "matched a stale cluster".into())?;

        let stale = engine
            .cluster(fresh.cluster_id)?
            .ok_or_else(|| ScenarioError::Assertion("stale cluster vanished".into()))?;
        check(stale.status == ClusterStatus::Expired, || {
            format!("examined stale cluster is {}", stale.status)
        })?;
        check(engine.sweep_expired().await? == 0, || "nothing left to sweep".into())?;
        Ok(())
    }

    /// DST-005: CitySpread - parallel load across a city with hotspots.
    ///
    /// **Assertion**: every report lives in exactly one live cluster and no two
    /// PENDING clusters are within the match radius of each other.
    async fn run_city_spread(
        &self,
        engine: &Arc<SimEngine>,
        metrics: &mut ScenarioMetrics,
    ) -> Result<(), ScenarioError> {
        let mut rng = engine.context().derive_rng(5);
        let total = self.burst_size * 4;
        let hotspots: Vec<GeoPoint> = (0..(total / 4).max(1))
            .map(|_| random_spot(&mut rng, 4_000.0))
            .collect();
        let sessions = (total / 2).max(2);

        let candidates = (0..total)
            .map(|_| {
                let hotspot = hotspots[rng.gen_range(0..hotspots.len())];
                let p = offset(hotspot, rng.gen_range(-40.0..40.0), rng.gen_range(-40.0..40.0));
                candidate(p, &format!("citizen-{}", rng.gen_range(0..sessions)))
            })
            .collect();
        let submissions = submit_all(engine, candidates, metrics).await?;

        let live = engine.store().list_live()?;
        let mut seen = HashSet::new();
        for cluster in &live {
            for report in &cluster.members {
                check(seen.insert(report.id), || format!("report {} in two clusters", report.id))?;
            }
        }
        for submission in &submissions {
            check(seen.contains(&submission.report_id), || {
                format!("report {} lost", submission.report_id)
            })?;
        }
        check(seen.len() == submissions.len(), || {
            format!("{} members for {} reports", seen.len(), submissions.len())
        })?;

        let radius = self.config.match_radius_m;
        let pending: Vec<_> = live
            .iter()
            .filter(|c| c.status == ClusterStatus::Pending)
            .collect();
        for (i, a) in pending.iter().enumerate() {
            for b in &pending[i + 1..] {
                let d = haversine_m(a.centroid, b.centroid);
                check(d > radius, || {
                    format!("PENDING clusters {} and {} only {:.1} m apart", a.id, b.id, d)
                })?;
            }
        }

        info!(
            "✓ CitySpread: {} reports → {} live clusters ({} pending)",
            submissions.len(),
            live.len(),
            pending.len()
        );
        Ok(())
    }
}

// ============================================================================
// CLIENT HELPERS
// ============================================================================

fn candidate(point: GeoPoint, session: &str) -> ReportCandidate {
    ReportCandidate::at(point.lat, point.lng).with_session(session)
}

/// Submit like a well-behaved client: back off and resubmit on retryable errors.
async fn submit_with_retry(
    engine: &SimEngine,
    candidate: ReportCandidate,
    metrics: &mut ScenarioMetrics,
) -> Result<Submission, ScenarioError> {
    let (submission, retries) = submit_counting_retries(engine, candidate).await?;
    metrics.reports_submitted += 1;
    metrics.resubmissions += retries;
    Ok(submission)
}

async fn submit_counting_retries(
    engine: &SimEngine,
    candidate: ReportCandidate,
) -> Result<(Submission, u64), ScenarioError> {
    let mut retries = 0;
    loop {
        match engine.submit(candidate.clone()).await {
            Ok(submission) => return Ok((submission, retries)),
            Err(e) if e.is_retryable() && retries < MAX_CLIENT_RETRIES => {
                retries += 1;
                debug!("Resubmitting after: {}", e);
                engine.context().sleep(Duration::from_millis(50)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Submit every candidate concurrently, one task per report.
async fn submit_all(
    engine: &Arc<SimEngine>,
    candidates: Vec<ReportCandidate>,
    metrics: &mut ScenarioMetrics,
) -> Result<Vec<Submission>, ScenarioError> {
    let handles: Vec<_> = candidates
        .into_iter()
        .map(|candidate| {
            let engine = Arc::clone(engine);
            tokio::spawn(async move { submit_counting_retries(&engine, candidate).await })
        })
        .collect();

    let mut submissions = Vec::with_capacity(handles.len());
    for handle in handles {
        let (submission, retries) = handle
            .await
            .map_err(|e| ScenarioError::Runtime(e.to_string()))??;
        metrics.reports_submitted += 1;
        metrics.resubmissions += retries;
        submissions.push(submission);
    }
    Ok(submissions)
}

// ============================================================================
// GEOMETRY HELPERS
// ============================================================================

/// Offset a point by meters north/east (small-distance approximation).
fn offset(p: GeoPoint, north_m: f64, east_m: f64) -> GeoPoint {
    let dlat = north_m / 111_195.0;
    let dlng = east_m / (111_195.0 * p.lat.to_radians().cos());
    GeoPoint::new(p.lat + dlat, p.lng + dlng)
}

fn random_spot<R: Rng>(rng: &mut R, spread_m: f64) -> GeoPoint {
    offset(
        CITY_CENTER,
        rng.gen_range(-spread_m..spread_m),
        rng.gen_range(-spread_m..spread_m),
    )
}

/// Walk east from `start` in 1 m steps to the first H3 cell edge.
fn find_cell_edge(start: GeoPoint, resolution: Resolution) -> Result<GeoPoint, ScenarioError> {
    let home = cell_at(start, resolution)?;
    for step in 1..=5_000 {
        let p = offset(start, 0.0, step as f64);
        if cell_at(p, resolution)? != home {
            return Ok(offset(start, 0.0, step as f64 - 0.5));
        }
    }
    Err(ScenarioError::Assertion("no cell edge within 5 km".into()))
}

// ============================================================================
// FINAL CHECKS
// ============================================================================

fn record_final_state(engine: &SimEngine, metrics: &mut ScenarioMetrics) -> Result<(), ScenarioError> {
    let store = engine.store();
    metrics.clusters_verified = store.list_by_status(ClusterStatus::Verified)?.len();
    metrics.clusters_merged = store.list_by_status(ClusterStatus::Merged)?.len();
    metrics.clusters_expired = store.list_by_status(ClusterStatus::Expired)?.len();
    metrics.clusters_live = store.list_live()?.len();
    Ok(())
}

/// Index, store and feed must agree once the engine is idle.
fn check_index_consistency(engine: &SimEngine) -> Result<(), ScenarioError> {
    let live = engine.store().list_live()?.len();
    let indexed = engine.index_stats().total_entries;
    check(live == indexed, || format!("{} live clusters but {} indexed", live, indexed))?;

    let verified = engine.store().list_by_status(ClusterStatus::Verified)?.len();
    let feed = engine.verified_hazards().len();
    check(verified == feed, || format!("{} verified clusters but {} in feed", verified, feed))
}
