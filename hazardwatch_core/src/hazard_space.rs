//! The "SPACE" Engine - H3 Grid Buckets for Cluster Lookup
//!
//! Solves the "who is near P" problem without scanning every cluster:
//! - H3 hexagonal cells partition the globe into ~174 m buckets (resolution 9)
//! - Each bucket holds the IDs of clusters whose centroid lies inside it
//! - A lookup scans P's cell plus the surrounding k-ring, so a centroid just
//!   across a cell edge is never missed
//!
//! The index only narrows the search. Exact distance filtering happens in the
//! matcher with the shared haversine function.

use h3o::{CellIndex, LatLng, Resolution};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap, HashSet};
use thiserror::Error;
use uuid::Uuid;

use crate::geodesy::GeoPoint;

/// Safety margin on the local hexagon size (neighbouring cells differ slightly).
const CELL_SIZE_SLACK: f64 = 0.9;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SpatialError {
    #[error("Invalid coordinates: {0}")]
    InvalidCoordinates(String),
}

/// Convert WGS84 coordinates to an H3 cell index.
pub fn cell_at(point: GeoPoint, resolution: Resolution) -> Result<CellIndex, SpatialError> {
    let latlng = LatLng::new(point.lat, point.lng)
        .map_err(|e| SpatialError::InvalidCoordinates(format!("{:?}", e)))?;
    Ok(latlng.to_cell(resolution))
}

/// Edge length of a regular hexagon with the same area as `cell`.
fn local_edge_m(cell: CellIndex) -> f64 {
    (2.0 * cell.area_m2() / (3.0 * 3f64.sqrt())).sqrt()
}

/// Number of cell rings around `cell` that cover every point within
/// `reach_m` of any point inside `cell`.
///
/// A point sits at most one circumradius (= edge `e`) from its cell center,
/// and two cell centers k rings apart are at least `1.5·e·k` apart.
pub fn ring_for_reach(cell: CellIndex, reach_m: f64) -> u32 {
    let edge = local_edge_m(cell);
    let spacing = 1.5 * edge * CELL_SIZE_SLACK;
    let k = ((2.0 * edge + reach_m.max(0.0)) / spacing).floor();
    (k as u32).max(1)
}

/// Cell → cluster-ID buckets.
///
/// Terminal clusters (EXPIRED, MERGED) are never kept in the index.
#[derive(Debug)]
pub struct SpatialIndex {
    /// Maps H3 cells to the set of cluster IDs whose centroid is in that cell
    buckets: HashMap<CellIndex, HashSet<Uuid>>,

    /// H3 resolution level
    /// Resolution 9: ~174m edge length (default)
    /// Resolution 10: ~66m edge length
    resolution: Resolution,
}

impl SpatialIndex {
    pub fn new(resolution: Resolution) -> Self {
        Self {
            buckets: HashMap::new(),
            resolution,
        }
    }

    pub fn resolution(&self) -> Resolution {
        self.resolution
    }

    pub fn cell_for(&self, point: GeoPoint) -> Result<CellIndex, SpatialError> {
        cell_at(point, self.resolution)
    }

    /// Insert a cluster into a bucket.
    pub fn insert(&mut self, cell: CellIndex, cluster_id: Uuid) {
        self.buckets.entry(cell).or_default().insert(cluster_id);
    }

    /// Remove a cluster from a bucket. Returns false if it was not there.
    pub fn remove(&mut self, cell: CellIndex, cluster_id: Uuid) -> bool {
        let Some(set) = self.buckets.get_mut(&cell) else {
            return false;
        };
        let removed = set.remove(&cluster_id);
        // Clean up empty cells
        if set.is_empty() {
            self.buckets.remove(&cell);
        }
        removed
    }

    /// Move a cluster if its centroid crossed a cell boundary.
    pub fn rebucket(&mut self, cluster_id: Uuid, old_cell: CellIndex, new_cell: CellIndex) {
        if old_cell != new_cell {
            self.remove(old_cell, cluster_id);
            self.insert(new_cell, cluster_id);
        }
    }

    /// Drop `cluster_id` from every bucket. Returns the number of entries removed.
    pub fn purge(&mut self, cluster_id: &Uuid) -> usize {
        let mut removed = 0;
        self.buckets.retain(|_, set| {
            if set.remove(cluster_id) {
                removed += 1;
            }
            !set.is_empty()
        });
        removed
    }

    /// Whether `cluster_id` is currently bucketed under `cell`.
    pub fn contains(&self, cell: CellIndex, cluster_id: &Uuid) -> bool {
        self.buckets
            .get(&cell)
            .is_some_and(|set| set.contains(cluster_id))
    }

    /// Candidate clusters that may lie within `radius_m` of `point`.
    ///
    /// Returns `(cluster_id, cell)` pairs sorted by ID. May contain false
    /// positives, never false negatives.
    pub fn candidates(
        &self,
        point: GeoPoint,
        radius_m: f64,
    ) -> Result<Vec<(Uuid, CellIndex)>, SpatialError> {
        let mut found = Vec::new();
        for cell in self.region(point, radius_m)? {
            if let Some(ids) = self.buckets.get(&cell) {
                found.extend(ids.iter().map(|id| (*id, cell)));
            }
        }
        found.sort_by_key(|(id, _)| *id);
        Ok(found)
    }

    /// The set of cells that can hold a centroid within `reach_m` of `point`.
    ///
    /// Sorted, so callers that lock cells get a deterministic order.
    pub fn region(&self, point: GeoPoint, reach_m: f64) -> Result<BTreeSet<CellIndex>, SpatialError> {
        let center = self.cell_for(point)?;
        let k = ring_for_reach(center, reach_m);
        Ok(center.grid_disk_safe(k).collect())
    }

    /// Total number of indexed clusters.
    pub fn len(&self) -> usize {
        self.buckets.values().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Get statistics about the spatial index.
    pub fn stats(&self) -> SpatialIndexStats {
        let total_cells = self.buckets.len();
        let total_entries = self.len();
        let avg_per_cell = if total_cells > 0 {
            total_entries as f64 / total_cells as f64
        } else {
            0.0
        };

        SpatialIndexStats {
            total_cells,
            total_entries,
            avg_per_cell,
            resolution: self.resolution,
        }
    }
}

/// Statistics about the spatial index.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpatialIndexStats {
    pub total_cells: usize,
    pub total_entries: usize,
    pub avg_per_cell: f64,
    pub resolution: Resolution,
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELHI: GeoPoint = GeoPoint {
        lat: 28.6139,
        lng: 77.2090,
    };

    /// Offset a point by meters north/east (small-distance approximation).
    fn offset(p: GeoPoint, north_m: f64, east_m: f64) -> GeoPoint {
        let dlat = north_m / 111_195.0;
        let dlng = east_m / (111_195.0 * p.lat.to_radians().cos());
        GeoPoint::new(p.lat + dlat, p.lng + dlng)
    }

    #[test]
    fn test_spatial_index_creation() {
        let index = SpatialIndex::new(Resolution::Nine);
        assert!(index.is_empty());
        assert_eq!(index.stats().total_entries, 0);
    }

    #[test]
    fn test_insert_and_remove() {
        let mut index = SpatialIndex::new(Resolution::Nine);
        let cell = index.cell_for(DELHI).unwrap();
        let id = Uuid::new_v4();

        index.insert(cell, id);
        assert!(index.contains(cell, &id));
        assert_eq!(index.len(), 1);

        assert!(index.remove(cell, id));
        assert!(!index.remove(cell, id));
        assert!(index.is_empty());
    }

    #[test]
    fn test_rebucket_moves_cluster() {
        let mut index = SpatialIndex::new(Resolution::Nine);
        let old_cell = index.cell_for(DELHI).unwrap();
        let new_cell = index.cell_for(offset(DELHI, 2_000.0, 0.0)).unwrap();
        assert_ne!(old_cell, new_cell);

        let id = Uuid::new_v4();
        index.insert(old_cell, id);
        index.rebucket(id, old_cell, new_cell);

        assert!(!index.contains(old_cell, &id));
        assert!(index.contains(new_cell, &id));
        assert_eq!(index.stats().total_cells, 1);
    }

    #[test]
    fn test_purge_removes_everywhere() {
        let mut index = SpatialIndex::new(Resolution::Nine);
        let a = index.cell_for(DELHI).unwrap();
        let b = index.cell_for(offset(DELHI, 2_000.0, 0.0)).unwrap();
        let id = Uuid::new_v4();
        let other = Uuid::new_v4();
        index.insert(a, id);
        index.insert(b, id);
        index.insert(b, other);

        assert_eq!(index.purge(&id), 2);
        assert_eq!(index.len(), 1);
        assert!(index.contains(b, &other));
        assert_eq!(index.purge(&id), 0);
    }

    #[test]
    fn test_ring_for_match_radius_is_one() {
        let cell = cell_at(DELHI, Resolution::Nine).unwrap();
        assert_eq!(ring_for_reach(cell, 50.0), 1);
        assert_eq!(ring_for_reach(cell, 100.0), 1);
        assert!(ring_for_reach(cell, 2_000.0) > 1);
    }

    #[test]
    fn test_region_is_cell_plus_neighbours() {
        let index = SpatialIndex::new(Resolution::Nine);
        let region = index.region(DELHI, 50.0).unwrap();
        // Hexagon + 6 neighbours
        assert_eq!(region.len(), 7);
        assert!(region.contains(&index.cell_for(DELHI).unwrap()));
    }

    #[test]
    fn test_candidates_never_miss_nearby_centroids() {
        let mut index = SpatialIndex::new(Resolution::Nine);

        // Sweep query points around the spot in 10 m steps, and put a
        // centroid up to 50 m away in 8 directions from each.
        for north in (-200..=200).step_by(10) {
            for east in (-200..=200).step_by(40) {
                let query = offset(DELHI, north as f64, east as f64);
                for (dn, de) in [
                    (50.0, 0.0),
                    (-50.0, 0.0),
                    (0.0, 50.0),
                    (0.0, -50.0),
                    (35.0, 35.0),
                    (-35.0, 35.0),
                    (35.0, -35.0),
                    (-35.0, -35.0),
                ] {
                    let centroid = offset(query, dn, de);
                    let cell = index.cell_for(centroid).unwrap();
                    let id = Uuid::new_v4();
                    index.insert(cell, id);

                    let found = index.candidates(query, 50.0).unwrap();
                    assert!(
                        found.iter().any(|(c, _)| *c == id),
                        "centroid {:?} missed from query {:?}",
                        centroid,
                        query
                    );
                    index.remove(cell, id);
                }
            }
        }
    }

    #[test]
    fn test_candidates_exclude_far_clusters() {
        let mut index = SpatialIndex::new(Resolution::Nine);
        let far = GeoPoint::new(28.4595, 77.0266);
        let id = Uuid::new_v4();
        index.insert(index.cell_for(far).unwrap(), id);

        assert!(index.candidates(DELHI, 50.0).unwrap().is_empty());
    }

    #[test]
    fn test_candidates_sorted_by_id() {
        let mut index = SpatialIndex::new(Resolution::Nine);
        let cell = index.cell_for(DELHI).unwrap();
        for _ in 0..10 {
            index.insert(cell, Uuid::new_v4());
        }
        let found = index.candidates(DELHI, 50.0).unwrap();
        assert_eq!(found.len(), 10);
        assert!(found.windows(2).all(|w| w[0].0 < w[1].0));
    }

    #[test]
    fn test_invalid_coordinates() {
        let index = SpatialIndex::new(Resolution::Nine);
        assert!(index.cell_for(GeoPoint::new(f64::NAN, 0.0)).is_err());
    }
}
