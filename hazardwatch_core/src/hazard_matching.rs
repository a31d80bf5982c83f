//! The "MATCHING" Engine - Report-to-Cluster Association
//!
//! Solves the "Duplicate Pothole" problem: many citizens photograph the same
//! hazard, and each photo must land in one cluster describing that hazard.
//!
//! This module implements the per-report pipeline:
//! 1. Spatial Pruning (H3 cell + k-ring, via a [`ClusterSource`])
//! 2. Gating (haversine distance ≤ radius, `lastReportAt` within window)
//! 3. Selection (nearest; ties → most recent activity → lowest ID)
//! 4. Join or Create, then Merge of PENDING neighbours (younger into older)
//!
//! The matcher never mutates shared state. It works on copies and returns a
//! [`MatchPlan`]; the caller persists the plan and applies its index changes.

use h3o::{CellIndex, Resolution};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use crate::geodesy::{haversine_m, mean_point, GeoPoint};
use crate::hazard_ingest::Report;
use crate::hazard_lifecycle::{ClusterStatus, VerificationStateMachine};
use crate::hazard_space::{cell_at, SpatialError};
use crate::hazard_store::StoreError;

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the ClusterMatcher
#[derive(Debug, Clone)]
pub struct MatchingConfig {
    /// H3 resolution used to bucket centroids (default: Resolution::Nine ~174m cells)
    pub h3_resolution: Resolution,

    /// Max centroid distance for a report to join a cluster (default: 50 m)
    pub match_radius_m: f64,

    /// Max gap between a report and a cluster's last activity (default: 72 h)
    pub match_window_ms: i64,

    /// Distinct reporters needed for verification (default: 2)
    pub verify_threshold: usize,
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            h3_resolution: Resolution::Nine,
            match_radius_m: 50.0,
            match_window_ms: 72 * 3_600_000,
            verify_threshold: 2,
        }
    }
}

// ============================================================================
// HAZARD CLUSTER
// ============================================================================

/// A group of reports judged to describe one physical hazard.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HazardCluster {
    pub id: Uuid,

    /// Equal-weight mean of all member coordinates
    pub centroid: GeoPoint,

    /// Member reports, ordered by arrival (by timestamp after a merge)
    pub members: Vec<Report>,

    pub status: ClusterStatus,

    /// Unix ms
    pub created_at: i64,
    pub verified_at: Option<i64>,
    pub last_report_at: i64,

    /// Survivor pointer, set once the cluster is MERGED
    pub merged_into: Option<Uuid>,

    /// H3 cell of the current centroid
    pub cell: CellIndex,
}

impl HazardCluster {
    /// Create a new PENDING cluster with `report` as its sole member.
    pub fn from_report(report: Report, cell: CellIndex, created_at: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            centroid: report.position,
            last_report_at: report.timestamp,
            members: vec![report],
            status: ClusterStatus::Pending,
            created_at,
            verified_at: None,
            merged_into: None,
            cell,
        }
    }

    /// Append a report and recompute the centroid.
    pub fn absorb(&mut self, report: Report) {
        self.last_report_at = self.last_report_at.max(report.timestamp);
        self.members.push(report);
        self.recompute_centroid();
    }

    /// Move every member of `other` into this cluster.
    ///
    /// The union is stable-sorted by report timestamp; `other` is left empty.
    pub fn absorb_cluster(&mut self, other: &mut HazardCluster) {
        let mut members = std::mem::take(&mut self.members);
        members.append(&mut other.members);
        members.sort_by_key(|r| r.timestamp);
        self.members = members;
        self.last_report_at = self.last_report_at.max(other.last_report_at);
        self.recompute_centroid();
    }

    pub fn recompute_centroid(&mut self) {
        if let Some(centroid) = mean_point(self.members.iter().map(|r| r.position)) {
            self.centroid = centroid;
        }
    }

    /// Independent reporters: distinct session IDs, plus one per report
    /// submitted without a session.
    pub fn distinct_reporters(&self) -> usize {
        self.members
            .iter()
            .map(Report::reporter_key)
            .collect::<HashSet<_>>()
            .len()
    }

    pub fn report_count(&self) -> usize {
        self.members.len()
    }

    /// Map-feed view. `None` unless the cluster is VERIFIED.
    pub fn verified_view(&self) -> Option<VerifiedHazard> {
        if self.status != ClusterStatus::Verified {
            return None;
        }
        Some(VerifiedHazard {
            id: self.id,
            lat: self.centroid.lat,
            lng: self.centroid.lng,
            description: self
                .members
                .iter()
                .find_map(|r| r.description.clone())
                .unwrap_or_default(),
            image_preview: self.members.iter().find_map(|r| r.image_ref.clone()),
            report_count: self.members.len(),
        })
    }

    pub fn summary(&self) -> ClusterSummary {
        ClusterSummary {
            id: self.id,
            lat: self.centroid.lat,
            lng: self.centroid.lng,
            status: self.status,
            report_count: self.members.len(),
            distinct_reporters: self.distinct_reporters(),
            created_at: self.created_at,
            verified_at: self.verified_at,
            last_report_at: self.last_report_at,
            merged_into: self.merged_into,
        }
    }
}

/// Read-only view over a VERIFIED cluster, as served to the map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifiedHazard {
    pub id: Uuid,
    pub lat: f64,
    pub lng: f64,
    pub description: String,
    pub image_preview: Option<String>,
    pub report_count: usize,
}

/// Status view of any cluster.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSummary {
    pub id: Uuid,
    pub lat: f64,
    pub lng: f64,
    pub status: ClusterStatus,
    pub report_count: usize,
    pub distinct_reporters: usize,
    pub created_at: i64,
    pub verified_at: Option<i64>,
    pub last_report_at: i64,
    pub merged_into: Option<Uuid>,
}

// ============================================================================
// SOURCE / PLAN
// ============================================================================

/// Where the matcher reads candidate clusters from.
pub trait ClusterSource {
    /// Live clusters whose centroid may lie within `radius_m` of `point`.
    ///
    /// Supersets are fine; the matcher filters by exact distance.
    fn nearby(&self, point: GeoPoint, radius_m: f64) -> Result<Vec<HazardCluster>, MatchError>;
}

/// Errors that abort a matching unit.
#[derive(Debug, Clone, Error)]
pub enum MatchError {
    /// A candidate lies in a cell the unit does not hold
    #[error("Cell {0} is outside the locked region")]
    RegionMiss(CellIndex),

    /// Index and store disagree about a cluster
    #[error("Stale read of cluster {0}")]
    StaleRead(Uuid),

    #[error(transparent)]
    Storage(#[from] StoreError),

    #[error(transparent)]
    Spatial(#[from] SpatialError),
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatchKind {
    Joined { distance_m: f64 },
    Created,
}

/// Spatial index maintenance implied by a plan.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexChange {
    Insert { id: Uuid, cell: CellIndex },
    Move { id: Uuid, from: CellIndex, to: CellIndex },
    Remove { id: Uuid, cell: CellIndex },
}

/// The outcome of matching one report, ready to be committed.
#[derive(Debug, Clone)]
pub struct MatchPlan {
    pub report_id: Uuid,

    /// Cluster that holds the report once the plan is applied
    pub cluster_id: Uuid,

    pub kind: MatchKind,

    /// Some cluster in this plan entered VERIFIED
    pub promoted: bool,

    /// Clusters absorbed into a survivor
    pub merged: Vec<Uuid>,

    /// Stale clusters expired along the way
    pub expired: Vec<Uuid>,

    /// Final state of every modified cluster, sorted by ID
    pub changed: Vec<HazardCluster>,

    pub index_changes: Vec<IndexChange>,
}

impl MatchPlan {
    /// The cluster that holds the report.
    pub fn cluster(&self) -> Option<&HazardCluster> {
        self.changed.iter().find(|c| c.id == self.cluster_id)
    }
}

/// Copies of every cluster a unit has read, plus which ones it modified.
#[derive(Default)]
struct WorkingSet {
    clusters: BTreeMap<Uuid, HazardCluster>,
    /// Cell under which each loaded cluster was indexed
    indexed: HashMap<Uuid, CellIndex>,
    dirty: BTreeSet<Uuid>,
}

impl WorkingSet {
    /// Merge freshly read clusters in, keeping existing working copies.
    /// Returns the IDs in read order.
    fn load(&mut self, fetched: Vec<HazardCluster>) -> Vec<Uuid> {
        fetched
            .into_iter()
            .map(|cluster| {
                let id = cluster.id;
                self.indexed.entry(id).or_insert(cluster.cell);
                self.clusters.entry(id).or_insert(cluster);
                id
            })
            .collect()
    }

    fn get(&self, id: &Uuid) -> Result<&HazardCluster, MatchError> {
        self.clusters.get(id).ok_or(MatchError::StaleRead(*id))
    }

    fn get_mut(&mut self, id: &Uuid) -> Result<&mut HazardCluster, MatchError> {
        self.dirty.insert(*id);
        self.clusters.get_mut(id).ok_or(MatchError::StaleRead(*id))
    }

    fn insert_new(&mut self, cluster: HazardCluster) {
        self.dirty.insert(cluster.id);
        self.clusters.insert(cluster.id, cluster);
    }

    /// Drop a cluster that was created in this unit and never committed.
    fn discard(&mut self, id: &Uuid) {
        self.dirty.remove(id);
        self.clusters.remove(id);
    }

    fn was_indexed(&self, id: &Uuid) -> bool {
        self.indexed.contains_key(id)
    }

    fn into_changes(self) -> (Vec<HazardCluster>, Vec<IndexChange>) {
        let mut changed = Vec::with_capacity(self.dirty.len());
        let mut index_changes = Vec::new();

        for id in &self.dirty {
            let Some(cluster) = self.clusters.get(id) else {
                continue;
            };
            match (self.indexed.get(id), cluster.status.is_live()) {
                (None, true) => index_changes.push(IndexChange::Insert {
                    id: *id,
                    cell: cluster.cell,
                }),
                (Some(&from), true) if from != cluster.cell => {
                    index_changes.push(IndexChange::Move {
                        id: *id,
                        from,
                        to: cluster.cell,
                    })
                }
                (Some(&cell), false) => index_changes.push(IndexChange::Remove { id: *id, cell }),
                _ => {}
            }
            changed.push(cluster.clone());
        }

        (changed, index_changes)
    }
}

// ============================================================================
// CLUSTER MATCHER (The Engine)
// ============================================================================

/// Decides join / create / merge for each incoming report.
#[derive(Debug, Clone)]
pub struct ClusterMatcher {
    config: MatchingConfig,
    lifecycle: VerificationStateMachine,
}

impl ClusterMatcher {
    pub fn new(config: MatchingConfig) -> Self {
        let lifecycle = VerificationStateMachine::new(config.verify_threshold, config.match_window_ms);
        Self { config, lifecycle }
    }

    pub fn with_defaults() -> Self {
        Self::new(MatchingConfig::default())
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    pub fn lifecycle(&self) -> &VerificationStateMachine {
        &self.lifecycle
    }

    /// Whether `cluster` may absorb `report` (radius + time window).
    ///
    /// Returns the distance when it passes.
    pub fn gate(&self, cluster: &HazardCluster, report: &Report) -> Option<f64> {
        if !cluster.status.is_live() {
            return None;
        }
        if !self.within_window(report.timestamp, cluster.last_report_at) {
            return None;
        }
        let distance = haversine_m(report.position, cluster.centroid);
        (distance <= self.config.match_radius_m).then_some(distance)
    }

    /// |a - b| within the match window, without overflowing on extreme inputs.
    fn within_window(&self, a: i64, b: i64) -> bool {
        a.abs_diff(b) <= self.config.match_window_ms.max(0).unsigned_abs()
    }

    /// Select the best cluster for a report.
    ///
    /// Nearest wins; ties go to the most recent `last_report_at`, then to the
    /// lowest cluster ID, so the result does not depend on candidate order.
    pub fn select_best_match<'a, I>(&self, candidates: I, report: &Report) -> Option<(Uuid, f64)>
    where
        I: IntoIterator<Item = &'a HazardCluster>,
    {
        candidates
            .into_iter()
            .filter_map(|c| self.gate(c, report).map(|d| (c, d)))
            .min_by(|(a, da), (b, db)| {
                da.total_cmp(db)
                    .then_with(|| b.last_report_at.cmp(&a.last_report_at))
                    .then_with(|| a.id.cmp(&b.id))
            })
            .map(|(c, d)| (c.id, d))
    }

    /// Process one validated report.
    ///
    /// **Stage 1:** Spatial Pruning (candidates from `source`)
    /// **Stage 2:** Lazy expiry + gating (radius, window)
    /// **Stage 3:** Join the best match or create a new cluster
    /// **Stage 4:** Verification, then merging of PENDING neighbours
    pub fn process<S>(&self, report: Report, source: &S, now: i64) -> Result<MatchPlan, MatchError>
    where
        S: ClusterSource + ?Sized,
    {
        let radius = self.config.match_radius_m;
        let report_id = report.id;
        let mut work = WorkingSet::default();
        let mut expired = Vec::new();

        // Stages 1 & 2
        let candidate_ids = work.load(source.nearby(report.position, radius)?);
        for id in &candidate_ids {
            if self.lifecycle.is_stale(work.get(id)?, now) {
                self.lifecycle.expire_if_stale(work.get_mut(id)?, now);
                expired.push(*id);
            }
        }

        let best = {
            let candidates = candidate_ids
                .iter()
                .filter_map(|id| work.clusters.get(id));
            self.select_best_match(candidates, &report)
        };

        // Stage 3
        let (mut target_id, kind) = match best {
            Some((id, distance_m)) => {
                let cluster = work.get_mut(&id)?;
                cluster.absorb(report);
                cluster.cell = cell_at(cluster.centroid, self.config.h3_resolution)?;
                debug!(cluster_id = %id, distance_m, "Report joined cluster");
                (id, MatchKind::Joined { distance_m })
            }
            None => {
                let cell = cell_at(report.position, self.config.h3_resolution)?;
                let cluster = HazardCluster::from_report(report, cell, now);
                let id = cluster.id;
                work.insert_new(cluster);
                debug!(cluster_id = %id, "Report opened new cluster");
                (id, MatchKind::Created)
            }
        };

        // Stage 4
        let mut promoted = self.lifecycle.evaluate(work.get_mut(&target_id)?, now);
        let mut merged = Vec::new();

        while work.get(&target_id)?.status == ClusterStatus::Pending {
            let Some(other_id) = self.find_merge_partner(&mut work, target_id, source, now, &mut expired)?
            else {
                break;
            };

            let (survivor_id, loser_id) = older_first(work.get(&target_id)?, work.get(&other_id)?);
            let mut loser = work.get(&loser_id)?.clone();
            let survivor = work.get_mut(&survivor_id)?;
            survivor.absorb_cluster(&mut loser);
            survivor.cell = cell_at(survivor.centroid, self.config.h3_resolution)?;

            if work.was_indexed(&loser_id) {
                self.lifecycle
                    .mark_merged(&mut loser, survivor_id, now)
                    .map_err(|_| MatchError::StaleRead(loser_id))?;
                *work.get_mut(&loser_id)? = loser;
                merged.push(loser_id);
            } else {
                // Opened by this very report: never visible, nothing to tombstone
                work.discard(&loser_id);
            }

            info!(survivor = %survivor_id, absorbed = %loser_id, "Merged duplicate clusters");
            target_id = survivor_id;
            promoted |= self.lifecycle.evaluate(work.get_mut(&target_id)?, now);
        }

        let (changed, index_changes) = work.into_changes();
        Ok(MatchPlan {
            report_id,
            cluster_id: target_id,
            kind,
            promoted,
            merged,
            expired,
            changed,
            index_changes,
        })
    }

    /// Nearest other PENDING cluster within radius of the target's centroid.
    ///
    /// Also requires overlapping activity windows, so a hazard reported months
    /// apart at the same spot is not folded into an old pending cluster.
    fn find_merge_partner<S>(
        &self,
        work: &mut WorkingSet,
        target_id: Uuid,
        source: &S,
        now: i64,
        expired: &mut Vec<Uuid>,
    ) -> Result<Option<Uuid>, MatchError>
    where
        S: ClusterSource + ?Sized,
    {
        let (centroid, target_last) = {
            let target = work.get(&target_id)?;
            (target.centroid, target.last_report_at)
        };
        let ids = work.load(source.nearby(centroid, self.config.match_radius_m)?);

        let mut best: Option<(Uuid, f64)> = None;
        for id in ids {
            if id == target_id {
                continue;
            }
            let cluster = work.get(&id)?;
            if cluster.status != ClusterStatus::Pending {
                continue;
            }
            if self.lifecycle.is_stale(cluster, now) {
                self.lifecycle.expire_if_stale(work.get_mut(&id)?, now);
                expired.push(id);
                continue;
            }
            if !self.within_window(cluster.last_report_at, target_last) {
                continue;
            }
            let distance = haversine_m(centroid, cluster.centroid);
            if distance > self.config.match_radius_m {
                continue;
            }
            let closer = match best {
                None => true,
                Some((best_id, best_d)) => match distance.total_cmp(&best_d) {
                    Ordering::Less => true,
                    Ordering::Equal => id < best_id,
                    Ordering::Greater => false,
                },
            };
            if closer {
                best = Some((id, distance));
            }
        }
        Ok(best.map(|(id, _)| id))
    }
}

/// Returns `(older, younger)` IDs: earlier `created_at` survives, lower ID on ties.
pub fn older_first(a: &HazardCluster, b: &HazardCluster) -> (Uuid, Uuid) {
    if (a.created_at, a.id) <= (b.created_at, b.id) {
        (a.id, b.id)
    } else {
        (b.id, a.id)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hazard_ingest::{validate, ReportCandidate};
    use approx::assert_relative_eq;

    const HOUR_MS: i64 = 3_600_000;
    const T0: i64 = 1_704_067_200_000;
    const ORIGIN: GeoPoint = GeoPoint {
        lat: 28.6139,
        lng: 77.2090,
    };

    /// Returns every live cluster; the matcher does the distance filtering.
    struct VecSource(Vec<HazardCluster>);

    impl ClusterSource for VecSource {
        fn nearby(&self, _point: GeoPoint, _radius_m: f64) -> Result<Vec<HazardCluster>, MatchError> {
            Ok(self.0.iter().filter(|c| c.status.is_live()).cloned().collect())
        }
    }

    fn east_of_origin(meters: f64) -> GeoPoint {
        let dlng = meters / (111_194.93 * ORIGIN.lat.to_radians().cos());
        GeoPoint::new(ORIGIN.lat, ORIGIN.lng + dlng)
    }

    fn report(point: GeoPoint, session: &str, ts: i64) -> Report {
        validate(
            ReportCandidate::at(point.lat, point.lng)
                .with_session(session)
                .with_timestamp(ts),
            ts,
        )
        .unwrap()
    }

    fn cluster(point: GeoPoint, session: &str, ts: i64) -> HazardCluster {
        let cell = cell_at(point, Resolution::Nine).unwrap();
        HazardCluster::from_report(report(point, session, ts), cell, ts)
    }

    #[test]
    fn test_matcher_creation() {
        let matcher = ClusterMatcher::with_defaults();
        assert_eq!(matcher.config().match_radius_m, 50.0);
        assert_eq!(matcher.config().match_window_ms, 72 * HOUR_MS);
        assert_eq!(matcher.lifecycle().verify_threshold(), 2);
    }

    #[test]
    fn test_process_creates_new_cluster() {
        let matcher = ClusterMatcher::with_defaults();
        let r = report(ORIGIN, "a", T0);
        let report_id = r.id;

        let plan = matcher.process(r, &VecSource(vec![]), T0).unwrap();

        assert_eq!(plan.kind, MatchKind::Created);
        assert!(!plan.promoted);
        assert_eq!(plan.changed.len(), 1);
        let cluster = plan.cluster().unwrap();
        assert_eq!(cluster.status, ClusterStatus::Pending);
        assert_eq!(cluster.members.len(), 1);
        assert_eq!(cluster.members[0].id, report_id);
        assert_eq!(cluster.centroid, ORIGIN);
        assert!(matches!(plan.index_changes[..], [IndexChange::Insert { .. }]));
    }

    #[test]
    fn test_process_joins_and_verifies() {
        let matcher = ClusterMatcher::with_defaults();
        let existing = cluster(ORIGIN, "a", T0);
        let existing_id = existing.id;

        let b = report(GeoPoint::new(28.6140, 77.2091), "b", T0 + HOUR_MS);
        let plan = matcher
            .process(b, &VecSource(vec![existing]), T0 + HOUR_MS)
            .unwrap();

        assert_eq!(plan.cluster_id, existing_id);
        assert!(matches!(plan.kind, MatchKind::Joined { distance_m } if distance_m < 50.0));
        assert!(plan.promoted);

        let cluster = plan.cluster().unwrap();
        assert_eq!(cluster.status, ClusterStatus::Verified);
        assert_eq!(cluster.verified_at, Some(T0 + HOUR_MS));
        assert_eq!(cluster.members.len(), 2);
        assert_eq!(cluster.last_report_at, T0 + HOUR_MS);
        assert_relative_eq!(cluster.centroid.lat, 28.61395, epsilon = 1e-9);
        assert_relative_eq!(cluster.centroid.lng, 77.20905, epsilon = 1e-9);
    }

    #[test]
    fn test_process_far_report_creates_separate_cluster() {
        let matcher = ClusterMatcher::with_defaults();
        let existing = cluster(ORIGIN, "a", T0);

        let far = report(GeoPoint::new(28.4595, 77.0266), "b", T0);
        let plan = matcher.process(far, &VecSource(vec![existing.clone()]), T0).unwrap();

        assert_eq!(plan.kind, MatchKind::Created);
        assert_ne!(plan.cluster_id, existing.id);
        assert_eq!(plan.cluster().unwrap().status, ClusterStatus::Pending);
    }

    #[test]
    fn test_process_just_outside_radius() {
        let matcher = ClusterMatcher::with_defaults();
        let existing = cluster(ORIGIN, "a", T0);

        let plan = matcher
            .process(report(east_of_origin(55.0), "b", T0), &VecSource(vec![existing]), T0)
            .unwrap();
        assert_eq!(plan.kind, MatchKind::Created);
    }

    #[test]
    fn test_process_outside_window_creates_new() {
        let matcher = ClusterMatcher::with_defaults();
        let existing = cluster(ORIGIN, "a", T0);
        let existing_id = existing.id;

        // Old report backfilled with a timestamp far before the cluster's activity
        let old = report(ORIGIN, "b", T0 - 80 * HOUR_MS);
        let plan = matcher.process(old, &VecSource(vec![existing]), T0).unwrap();

        assert_eq!(plan.kind, MatchKind::Created);
        assert_ne!(plan.cluster_id, existing_id);
        assert!(plan.merged.is_empty());
    }

    #[test]
    fn test_gate_handles_extreme_timestamps() {
        let matcher = ClusterMatcher::with_defaults();
        let mut existing = cluster(ORIGIN, "a", T0);

        // Reports built directly, skipping the ingest bounds
        let mut early = report(ORIGIN, "b", T0);
        early.timestamp = i64::MIN;
        assert_eq!(matcher.gate(&existing, &early), None);

        existing.last_report_at = i64::MAX;
        assert_eq!(matcher.gate(&existing, &early), None);

        let mut late = report(ORIGIN, "c", T0);
        late.timestamp = i64::MAX;
        assert!(matcher.gate(&existing, &late).is_some());

        let plan = matcher
            .process(early, &VecSource(vec![existing]), T0)
            .unwrap();
        assert_eq!(plan.kind, MatchKind::Created);
    }

    #[test]
    fn test_process_lazily_expires_stale_cluster() {
        let matcher = ClusterMatcher::with_defaults();
        let existing = cluster(ORIGIN, "a", T0);
        let existing_id = existing.id;

        let now = T0 + 73 * HOUR_MS;
        let plan = matcher
            .process(report(ORIGIN, "b", now), &VecSource(vec![existing]), now)
            .unwrap();

        assert_eq!(plan.kind, MatchKind::Created);
        assert_eq!(plan.expired, vec![existing_id]);
        let expired = plan.changed.iter().find(|c| c.id == existing_id).unwrap();
        assert_eq!(expired.status, ClusterStatus::Expired);
        assert!(plan
            .index_changes
            .iter()
            .any(|c| matches!(c, IndexChange::Remove { id, .. } if *id == existing_id)));
    }

    #[test]
    fn test_verified_cluster_keeps_absorbing() {
        let matcher = ClusterMatcher::with_defaults();
        let mut existing = cluster(ORIGIN, "a", T0);
        existing.absorb(report(ORIGIN, "b", T0 + 1));
        assert!(matcher.lifecycle().evaluate(&mut existing, T0 + 1));
        let existing_id = existing.id;

        let now = T0 + 100 * HOUR_MS;
        let late = report(ORIGIN, "c", T0 + 70 * HOUR_MS);
        let plan = matcher.process(late, &VecSource(vec![existing]), now).unwrap();

        assert_eq!(plan.cluster_id, existing_id);
        assert!(!plan.promoted);
        let cluster = plan.cluster().unwrap();
        assert_eq!(cluster.status, ClusterStatus::Verified);
        assert_eq!(cluster.verified_at, Some(T0 + 1));
        assert_eq!(cluster.last_report_at, T0 + 70 * HOUR_MS);
        assert_eq!(cluster.members.len(), 3);
    }

    #[test]
    fn test_select_prefers_nearest() {
        let matcher = ClusterMatcher::with_defaults();
        let near = cluster(east_of_origin(10.0), "a", T0);
        let far = cluster(east_of_origin(30.0), "b", T0);
        let r = report(ORIGIN, "c", T0);

        let (id, d) = matcher.select_best_match([&far, &near], &r).unwrap();
        assert_eq!(id, near.id);
        assert_relative_eq!(d, 10.0, epsilon = 0.01);
    }

    #[test]
    fn test_select_tie_breaks() {
        let matcher = ClusterMatcher::with_defaults();
        let r = report(ORIGIN, "z", T0 + 10);

        // Same distance: most recent activity wins
        let older = cluster(east_of_origin(20.0), "a", T0);
        let recent = cluster(east_of_origin(20.0), "b", T0 + 5);
        let (id, _) = matcher.select_best_match([&older, &recent], &r).unwrap();
        assert_eq!(id, recent.id);
        let (id, _) = matcher.select_best_match([&recent, &older], &r).unwrap();
        assert_eq!(id, recent.id);

        // Same distance and activity: lowest ID wins
        let mut x = cluster(east_of_origin(20.0), "a", T0);
        let mut y = x.clone();
        x.id = Uuid::from_u128(1);
        y.id = Uuid::from_u128(2);
        let (id, _) = matcher.select_best_match([&y, &x], &r).unwrap();
        assert_eq!(id, x.id);
    }

    #[test]
    fn test_select_ignores_terminal_clusters() {
        let matcher = ClusterMatcher::with_defaults();
        let mut expired = cluster(ORIGIN, "a", T0);
        expired.status = ClusterStatus::Expired;
        assert!(matcher
            .select_best_match([&expired], &report(ORIGIN, "b", T0))
            .is_none());
    }

    #[test]
    fn test_join_triggers_merge_of_younger_into_older() {
        let matcher = ClusterMatcher::with_defaults();
        let older = cluster(ORIGIN, "a", T0);
        let younger = cluster(east_of_origin(62.0), "b", T0 + 1);
        let (older_id, younger_id) = (older.id, younger.id);

        // Joins the younger cluster (30 m vs 32 m), dragging its centroid to 47 m
        let r = report(east_of_origin(32.0), "b", T0 + 2);
        let plan = matcher
            .process(r, &VecSource(vec![older, younger]), T0 + 2)
            .unwrap();

        assert!(matches!(plan.kind, MatchKind::Joined { .. }));
        assert_eq!(plan.cluster_id, older_id);
        assert_eq!(plan.merged, vec![younger_id]);
        assert!(plan.promoted);

        let survivor = plan.cluster().unwrap();
        assert_eq!(survivor.status, ClusterStatus::Verified);
        assert_eq!(survivor.members.len(), 3);
        assert!(survivor.members.windows(2).all(|w| w[0].timestamp <= w[1].timestamp));
        assert_relative_eq!(
            haversine_m(survivor.centroid, east_of_origin(94.0 / 3.0)),
            0.0,
            epsilon = 0.05
        );

        let loser = plan.changed.iter().find(|c| c.id == younger_id).unwrap();
        assert_eq!(loser.status, ClusterStatus::Merged);
        assert_eq!(loser.merged_into, Some(older_id));
        assert!(loser.members.is_empty());
        assert!(plan
            .index_changes
            .iter()
            .any(|c| matches!(c, IndexChange::Remove { id, .. } if *id == younger_id)));
    }

    #[test]
    fn test_verified_target_does_not_merge() {
        let matcher = ClusterMatcher::with_defaults();
        let pending = cluster(ORIGIN, "a", T0);
        let mut verified = cluster(east_of_origin(40.0), "b", T0 + 1);
        verified.absorb(report(east_of_origin(40.0), "c", T0 + 1));
        matcher.lifecycle().evaluate(&mut verified, T0 + 1);
        let verified_id = verified.id;

        let r = report(east_of_origin(45.0), "d", T0 + 2);
        let plan = matcher
            .process(r, &VecSource(vec![pending, verified]), T0 + 2)
            .unwrap();

        assert_eq!(plan.cluster_id, verified_id);
        assert!(plan.merged.is_empty());
        assert_eq!(plan.changed.len(), 1);
    }

    #[test]
    fn test_centroid_is_order_independent() {
        let points: Vec<GeoPoint> = (0..6).map(|i| east_of_origin(i as f64 * 7.0)).collect();
        let forward: Vec<Report> = points
            .iter()
            .enumerate()
            .map(|(i, p)| report(*p, &format!("s{}", i), T0 + i as i64))
            .collect();

        let build = |order: &[Report]| {
            let mut c = HazardCluster::from_report(
                order[0].clone(),
                cell_at(order[0].position, Resolution::Nine).unwrap(),
                T0,
            );
            for r in &order[1..] {
                c.absorb(r.clone());
            }
            c.centroid
        };

        let mut backward = forward.clone();
        backward.reverse();
        let a = build(&forward);
        let b = build(&backward);
        assert_relative_eq!(a.lat, b.lat, epsilon = 1e-12);
        assert_relative_eq!(a.lng, b.lng, epsilon = 1e-12);

        let expected = mean_point(points).unwrap();
        assert_relative_eq!(a.lng, expected.lng, epsilon = 1e-12);
    }

    #[test]
    fn test_verified_view() {
        let mut c = cluster(ORIGIN, "a", T0);
        assert!(c.verified_view().is_none());

        let r = validate(
            ReportCandidate::at(ORIGIN.lat, ORIGIN.lng)
                .with_session("b")
                .with_description("Fallen tree on main road")
                .with_image("img/abc.jpg"),
            T0,
        )
        .unwrap();
        c.absorb(r);
        c.status = ClusterStatus::Verified;

        let view = c.verified_view().unwrap();
        assert_eq!(view.description, "Fallen tree on main road");
        assert_eq!(view.image_preview.as_deref(), Some("img/abc.jpg"));
        assert_eq!(view.report_count, 2);

        let json = serde_json::to_value(&view).unwrap();
        assert!(json.get("imagePreview").is_some());
    }

    #[test]
    fn test_older_first() {
        let a = cluster(ORIGIN, "a", T0);
        let b = cluster(ORIGIN, "b", T0 + 1);
        assert_eq!(older_first(&a, &b), (a.id, b.id));
        assert_eq!(older_first(&b, &a), (a.id, b.id));
    }
}
