//! Engine Runtime - Orchestrates the hazard engines with environment context.
//!
//! This module is the integration layer between the pure engines (ingest,
//! space, matching, lifecycle) and the environment abstraction
//! (HazardContext) plus a [`HazardStore`].
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                        HazardEngine                          │
//! │  ┌────────────────────────────────────────────────────────┐  │
//! │  │            Context: HazardContext                      │  │
//! │  │  • now_millis() → receipt / processing timestamps      │  │
//! │  │  • sleep() + jitter() → lock backoff                   │  │
//! │  └────────────────────────────────────────────────────────┘  │
//! │                                                              │
//! │  submit ──► INGEST ──► region lock ──► MATCHING ──► commit   │
//! │                         (H3 cells)     (copies)     │        │
//! │                                                     ▼        │
//! │                              SpatialIndex + feed snapshot    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Concurrency
//!
//! Each report is one unit. A unit locks every H3 cell within twice the match
//! radius of its report (all-or-nothing, so overlapping units serialize and
//! disjoint ones run in parallel), computes a [`MatchPlan`] on copies, commits
//! it to the store, then updates the index and the map-feed snapshot.
//!
//! # Usage
//!
//! ```ignore
//! use hazardwatch_core::{EngineConfig, HazardEngine, MemoryStore};
//! use hazardwatch_env::TokioContext;
//!
//! let engine = HazardEngine::new(TokioContext::shared(), MemoryStore::new(), EngineConfig::default())?;
//! let submission = engine.submit(ReportCandidate::at(28.6139, 77.2090)).await?;
//! ```

use h3o::{CellIndex, Resolution};
use hazardwatch_env::{EnvError, HazardContext};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::geodesy::{haversine_m, GeoPoint};
use crate::hazard_ingest::{validate, IngestError, Report, ReportCandidate};
use crate::hazard_lifecycle::ClusterStatus;
use crate::hazard_matching::{
    ClusterMatcher, ClusterSource, HazardCluster, IndexChange, MatchError, MatchKind, MatchPlan,
    MatchingConfig, VerifiedHazard,
};
use crate::hazard_space::{cell_at, SpatialError, SpatialIndex, SpatialIndexStats};
use crate::hazard_store::{HazardStore, StoreError};

/// Upper bound on region widenings / restarts within one unit.
const MAX_UNIT_RESTARTS: u32 = 16;

/// Upper bound on `mergedInto` hops when resolving a cluster.
const MAX_MERGE_HOPS: usize = 64;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for a HazardEngine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// H3 resolution for spatial bucketing (default: 9)
    pub h3_resolution: Resolution,

    /// "Same spot" distance in meters (default: 50)
    pub match_radius_m: f64,

    /// "Same time" window and PENDING idle limit in ms (default: 72 h)
    pub match_window_ms: i64,

    /// Distinct reporters needed for VERIFIED (default: 2)
    pub verify_threshold: usize,

    /// Default radius for the "nearby" map filter (default: 2 km)
    pub nearby_radius_m: f64,

    /// Lock attempts per round before the unit is requeued (default: 8)
    pub lock_max_attempts: u32,

    /// First backoff sleep between lock attempts (default: 2 ms)
    pub lock_backoff_base: Duration,

    /// Backoff ceiling (default: 100 ms)
    pub lock_backoff_max: Duration,

    /// Requeues before `Contention` is surfaced (default: 3)
    pub retry_cap: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            h3_resolution: Resolution::Nine,
            match_radius_m: 50.0,
            match_window_ms: 72 * 3_600_000,
            verify_threshold: 2,
            nearby_radius_m: 2_000.0,
            lock_max_attempts: 8,
            lock_backoff_base: Duration::from_millis(2),
            lock_backoff_max: Duration::from_millis(100),
            retry_cap: 3,
        }
    }
}

impl EngineConfig {
    pub fn matching(&self) -> MatchingConfig {
        MatchingConfig {
            h3_resolution: self.h3_resolution,
            match_radius_m: self.match_radius_m,
            match_window_ms: self.match_window_ms,
            verify_threshold: self.verify_threshold,
        }
    }

    /// Region reach: join candidates plus merge candidates of the moved centroid.
    pub fn lock_reach_m(&self) -> f64 {
        2.0 * self.match_radius_m
    }
}

// ============================================================================
// ERRORS / RESULTS
// ============================================================================

/// Errors surfaced by engine operations.
#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("Report rejected: {0}")]
    Validation(#[from] IngestError),

    #[error("Region still busy after {attempts} lock attempts")]
    Contention { attempts: u32 },

    #[error("Storage failure: {0}")]
    Storage(#[from] StoreError),

    #[error("Environment failure: {0}")]
    Environment(#[from] EnvError),
}

impl SubmitError {
    /// Whether resubmitting the same candidate may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SubmitError::Contention { .. } | SubmitError::Storage(_))
    }
}

impl From<SpatialError> for SubmitError {
    fn from(e: SpatialError) -> Self {
        SubmitError::Validation(IngestError::InvalidCoordinate(e.to_string()))
    }
}

/// Why a unit stopped before committing.
#[derive(Debug)]
enum UnitAbort {
    /// Needs a cell it does not hold: widen and restart
    RegionMiss(CellIndex),
    /// Index disagreed with the store: repair and restart
    StaleRead(Uuid),
    Failed(SubmitError),
}

impl From<MatchError> for UnitAbort {
    fn from(e: MatchError) -> Self {
        match e {
            MatchError::RegionMiss(cell) => UnitAbort::RegionMiss(cell),
            MatchError::StaleRead(id) => UnitAbort::StaleRead(id),
            MatchError::Storage(e) => UnitAbort::Failed(e.into()),
            MatchError::Spatial(e) => UnitAbort::Failed(e.into()),
        }
    }
}

/// Outcome of an accepted report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Submission {
    pub report_id: Uuid,
    pub cluster_id: Uuid,
    pub status: ClusterStatus,
    pub report_count: usize,
    /// True when the report joined an existing cluster
    pub joined: bool,
    /// Clusters folded into `cluster_id` by this report
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub merged: Vec<Uuid>,
}

// ============================================================================
// REGION LOCKS
// ============================================================================

/// Result of one backoff step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffResult {
    /// How long to sleep now
    pub sleep: Duration,
    /// Base for the following step
    pub next: Duration,
}

/// Exponential backoff with additive jitter, capped at `max`.
///
/// `jitter` should be drawn from `[0, current / 2]`.
pub fn compute_backoff(current: Duration, max: Duration, jitter: Duration) -> BackoffResult {
    let sleep = current.saturating_add(jitter);
    let next = current.saturating_mul(2).min(max);
    BackoffResult { sleep, next }
}

/// Cell-granular mutual exclusion between processing units.
#[derive(Debug, Default)]
pub struct RegionLocks {
    held: Mutex<HashSet<CellIndex>>,
}

impl RegionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Take every cell in `cells`, or none of them.
    pub fn try_acquire(&self, cells: &BTreeSet<CellIndex>) -> Option<RegionGuard<'_>> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if cells.iter().any(|cell| held.contains(cell)) {
            return None;
        }
        held.extend(cells.iter().copied());
        Some(RegionGuard {
            locks: self,
            cells: cells.clone(),
        })
    }

    /// Number of cells currently locked.
    pub fn held_count(&self) -> usize {
        self.held.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Releases its cells on drop.
#[derive(Debug)]
pub struct RegionGuard<'a> {
    locks: &'a RegionLocks,
    cells: BTreeSet<CellIndex>,
}

impl RegionGuard<'_> {
    pub fn cells(&self) -> &BTreeSet<CellIndex> {
        &self.cells
    }

    pub fn covers(&self, cell: CellIndex) -> bool {
        self.cells.contains(&cell)
    }
}

impl Drop for RegionGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock().unwrap_or_else(PoisonError::into_inner);
        for cell in &self.cells {
            held.remove(cell);
        }
    }
}

/// Index-backed cluster reads, confined to a locked region.
struct RegionView<'a, S: HazardStore> {
    index: &'a SpatialIndex,
    store: &'a S,
    guard: &'a RegionGuard<'a>,
}

impl<S: HazardStore> ClusterSource for RegionView<'_, S> {
    fn nearby(&self, point: GeoPoint, radius_m: f64) -> Result<Vec<HazardCluster>, MatchError> {
        if let Some(miss) = self
            .index
            .region(point, radius_m)?
            .into_iter()
            .find(|cell| !self.guard.covers(*cell))
        {
            return Err(MatchError::RegionMiss(miss));
        }

        let mut clusters = Vec::new();
        for (id, cell) in self.index.candidates(point, radius_m)? {
            let cluster = self.store.get(&id)?.ok_or(MatchError::StaleRead(id))?;
            if cluster.cell != cell || !cluster.status.is_live() {
                return Err(MatchError::StaleRead(id));
            }
            clusters.push(cluster);
        }
        Ok(clusters)
    }
}

// ============================================================================
// HAZARD ENGINE
// ============================================================================

/// The corroboration engine.
///
/// Generic over the context and the store, so the same engine runs in
/// production (tokio + sled) or simulation (virtual clock + memory).
pub struct HazardEngine<Ctx, S>
where
    Ctx: HazardContext,
    S: HazardStore,
{
    context: Arc<Ctx>,
    store: S,
    config: EngineConfig,
    matcher: ClusterMatcher,

    /// Live clusters by centroid cell
    index: RwLock<SpatialIndex>,

    locks: RegionLocks,

    /// VERIFIED clusters; replaced wholesale after each relevant commit
    feed: RwLock<Arc<Vec<VerifiedHazard>>>,
}

impl<Ctx, S> HazardEngine<Ctx, S>
where
    Ctx: HazardContext,
    S: HazardStore,
{
    /// Creates an engine, rebuilding the index and feed from `store`.
    pub fn new(context: Arc<Ctx>, store: S, config: EngineConfig) -> Result<Self, SubmitError> {
        let mut index = SpatialIndex::new(config.h3_resolution);
        let mut feed = Vec::new();
        let mut recelled = Vec::new();

        for mut cluster in store.list_live()? {
            // Resolution changed since the cluster was written
            if cluster.cell.resolution() != config.h3_resolution {
                cluster.cell = cell_at(cluster.centroid, config.h3_resolution)?;
                recelled.push(cluster.clone());
            }
            index.insert(cluster.cell, cluster.id);
            feed.extend(cluster.verified_view());
        }
        if !recelled.is_empty() {
            store.commit(&recelled)?;
        }
        feed.sort_by_key(|h| h.id);

        info!(
            clusters = index.len(),
            verified = feed.len(),
            "Hazard engine ready"
        );

        Ok(Self {
            context,
            store,
            matcher: ClusterMatcher::new(config.matching()),
            config,
            index: RwLock::new(index),
            locks: RegionLocks::new(),
            feed: RwLock::new(Arc::new(feed)),
        })
    }

    pub fn context(&self) -> &Arc<Ctx> {
        &self.context
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Ingest one report candidate.
    ///
    /// Validation failures return immediately with no side effects. Lock
    /// contention is retried internally up to `retry_cap` requeues.
    pub async fn submit(&self, candidate: ReportCandidate) -> Result<Submission, SubmitError> {
        let received_at = self.context.now_millis()?;
        let report = validate(candidate, received_at)?;

        let mut region = self
            .read_index()
            .region(report.position, self.config.lock_reach_m())?;
        let mut attempts = 0u32;
        let mut rounds = 0u32;
        let mut restarts = 0u32;

        loop {
            let Some(guard) = self.acquire(&region, &mut attempts).await else {
                rounds += 1;
                if rounds > self.config.retry_cap {
                    warn!(report_id = %report.id, attempts, "Giving up on contended region");
                    return Err(SubmitError::Contention { attempts });
                }
                debug!(report_id = %report.id, rounds, "Region busy, requeueing report");
                let pause = self.config.lock_backoff_max;
                self.context
                    .sleep(pause + self.context.jitter(pause / 2))
                    .await;
                continue;
            };

            let aborted = match self.run_unit(&report, &guard) {
                Ok(submission) => return Ok(submission),
                Err(UnitAbort::Failed(e)) => return Err(e),
                Err(abort) => abort,
            };

            restarts += 1;
            if restarts > MAX_UNIT_RESTARTS {
                warn!(report_id = %report.id, restarts, "Unit kept restarting");
                return Err(SubmitError::Contention { attempts });
            }
            match aborted {
                UnitAbort::RegionMiss(cell) => {
                    debug!(report_id = %report.id, %cell, "Widening locked region");
                    region.extend(cell.grid_disk_safe(1));
                }
                UnitAbort::StaleRead(id) => self.repair_index(id)?,
                UnitAbort::Failed(_) => {}
            }
        }
    }

    /// Acquire `region`, backing off between attempts.
    async fn acquire(
        &self,
        region: &BTreeSet<CellIndex>,
        attempts: &mut u32,
    ) -> Option<RegionGuard<'_>> {
        let mut backoff = self.config.lock_backoff_base;
        for attempt in 0..self.config.lock_max_attempts {
            *attempts += 1;
            if let Some(guard) = self.locks.try_acquire(region) {
                return Some(guard);
            }
            if attempt + 1 == self.config.lock_max_attempts {
                break;
            }
            let step = compute_backoff(
                backoff,
                self.config.lock_backoff_max,
                self.context.jitter(backoff / 2),
            );
            self.context.sleep(step.sleep).await;
            backoff = step.next;
        }
        None
    }

    /// The critical section of one unit. Runs with `guard` held.
    fn run_unit(&self, report: &Report, guard: &RegionGuard<'_>) -> Result<Submission, UnitAbort> {
        let now = self
            .context
            .now_millis()
            .map_err(|e| UnitAbort::Failed(e.into()))?;

        let plan = {
            let index = self.read_index();
            let view = RegionView {
                index: &index,
                store: &self.store,
                guard,
            };
            self.matcher.process(report.clone(), &view, now)?
        };

        for change in &plan.index_changes {
            let target = match change {
                IndexChange::Insert { cell, .. } => Some(*cell),
                IndexChange::Move { to, .. } => Some(*to),
                IndexChange::Remove { .. } => None,
            };
            if let Some(cell) = target.filter(|cell| !guard.covers(*cell)) {
                return Err(UnitAbort::RegionMiss(cell));
            }
        }

        let submission = Self::submission(&plan)?;
        if let Err(e) = self.store.commit(&plan.changed) {
            warn!(report_id = %report.id, error = %e, "Commit failed, report not applied");
            return Err(UnitAbort::Failed(e.into()));
        }
        self.apply_index(&plan.index_changes);
        self.publish(&plan.changed);

        info!(
            report_id = %submission.report_id,
            cluster_id = %submission.cluster_id,
            status = %submission.status,
            reports = submission.report_count,
            "Report accepted"
        );
        Ok(submission)
    }

    fn submission(plan: &MatchPlan) -> Result<Submission, UnitAbort> {
        let cluster = plan
            .cluster()
            .ok_or(UnitAbort::StaleRead(plan.cluster_id))?;
        Ok(Submission {
            report_id: plan.report_id,
            cluster_id: cluster.id,
            status: cluster.status,
            report_count: cluster.report_count(),
            joined: matches!(plan.kind, MatchKind::Joined { .. }),
            merged: plan.merged.clone(),
        })
    }

    fn apply_index(&self, changes: &[IndexChange]) {
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        for change in changes {
            match *change {
                IndexChange::Insert { id, cell } => index.insert(cell, id),
                IndexChange::Move { id, from, to } => index.rebucket(id, from, to),
                IndexChange::Remove { id, cell } => {
                    index.remove(cell, id);
                }
            }
        }
    }

    /// Swap in a new feed snapshot if any committed cluster is VERIFIED.
    fn publish(&self, changed: &[HazardCluster]) {
        if !changed.iter().any(|c| c.status == ClusterStatus::Verified) {
            return;
        }
        let ids: HashSet<Uuid> = changed.iter().map(|c| c.id).collect();
        let mut feed = self.feed.write().unwrap_or_else(PoisonError::into_inner);
        let mut next: Vec<VerifiedHazard> = feed
            .iter()
            .filter(|h| !ids.contains(&h.id))
            .cloned()
            .collect();
        next.extend(changed.iter().filter_map(HazardCluster::verified_view));
        next.sort_by_key(|h| h.id);
        *feed = Arc::new(next);
    }

    /// Re-sync one index entry with the store.
    fn repair_index(&self, id: Uuid) -> Result<(), SubmitError> {
        let stored = self.store.get(&id)?;
        let mut index = self.index.write().unwrap_or_else(PoisonError::into_inner);
        index.purge(&id);
        if let Some(cluster) = stored.filter(|c| c.status.is_live()) {
            index.insert(cluster.cell, id);
        }
        warn!(cluster_id = %id, "Repaired stale index entry");
        Ok(())
    }

    fn read_index(&self) -> std::sync::RwLockReadGuard<'_, SpatialIndex> {
        self.index.read().unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Current VERIFIED hazards. Never blocks on processing units.
    pub fn verified_hazards(&self) -> Arc<Vec<VerifiedHazard>> {
        Arc::clone(&self.feed.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// VERIFIED hazards within `radius_m` of `point`, nearest first.
    pub fn verified_near(&self, point: GeoPoint, radius_m: f64) -> Vec<VerifiedHazard> {
        let mut near: Vec<(f64, VerifiedHazard)> = self
            .verified_hazards()
            .iter()
            .map(|h| (haversine_m(point, GeoPoint::new(h.lat, h.lng)), h))
            .filter(|(d, _)| *d <= radius_m)
            .map(|(d, h)| (d, h.clone()))
            .collect();
        near.sort_by(|a, b| a.0.total_cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));
        near.into_iter().map(|(_, h)| h).collect()
    }

    /// Look up a cluster, following `mergedInto` to the survivor.
    pub fn cluster(&self, id: Uuid) -> Result<Option<HazardCluster>, SubmitError> {
        let mut current = id;
        for _ in 0..MAX_MERGE_HOPS {
            let Some(cluster) = self.store.get(&current)? else {
                return Ok(None);
            };
            match (cluster.status, cluster.merged_into) {
                (ClusterStatus::Merged, Some(next)) => current = next,
                _ => return Ok(Some(cluster)),
            }
        }
        warn!(cluster_id = %id, "Merge chain too long");
        Ok(None)
    }

    pub fn index_stats(&self) -> SpatialIndexStats {
        self.read_index().stats()
    }

    // ------------------------------------------------------------------
    // Maintenance
    // ------------------------------------------------------------------

    /// Expire every PENDING cluster idle beyond the window.
    ///
    /// Each cluster is re-read under its region lock; busy regions are
    /// skipped until the next sweep. Returns the number expired.
    pub async fn sweep_expired(&self) -> Result<usize, SubmitError> {
        let now = self.context.now_millis()?;
        let lifecycle = self.matcher.lifecycle();
        let stale: Vec<(Uuid, GeoPoint)> = self
            .store
            .list_by_status(ClusterStatus::Pending)?
            .into_iter()
            .filter(|c| lifecycle.is_stale(c, now))
            .map(|c| (c.id, c.centroid))
            .collect();

        let mut expired = 0;
        for (id, centroid) in stale {
            let region = self.read_index().region(centroid, 0.0)?;
            let mut attempts = 0;
            let Some(guard) = self.acquire(&region, &mut attempts).await else {
                debug!(cluster_id = %id, "Region busy, expiry deferred");
                continue;
            };

            let now = self.context.now_millis()?;
            let Some(mut cluster) = self.store.get(&id)? else {
                continue;
            };
            if !guard.covers(cluster.cell) || !lifecycle.expire_if_stale(&mut cluster, now) {
                continue;
            }
            self.store.commit(std::slice::from_ref(&cluster))?;
            self.index
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(cluster.cell, id);
            expired += 1;
        }

        if expired > 0 {
            info!(expired, "Expiry sweep finished");
        }
        Ok(expired)
    }

    /// Run `sweep_expired` every `interval`, forever.
    pub async fn run_sweeper(self: Arc<Self>, interval: Duration) {
        loop {
            self.context.sleep(interval).await;
            if let Err(e) = self.sweep_expired().await {
                warn!(error = %e, "Expiry sweep failed");
            }
        }
    }
}
