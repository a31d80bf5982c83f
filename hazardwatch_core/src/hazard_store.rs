//! Cluster persistence.
//!
//! The engine treats storage as a map from cluster ID to the latest cluster
//! record. A commit carries every cluster touched by one report and must land
//! all-or-nothing, so a crash or error never leaves half a merge behind.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::hazard_lifecycle::ClusterStatus;
use crate::hazard_matching::HazardCluster;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum StoreError {
    #[error("Storage error: {0}")]
    Backend(String),

    #[error("Corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Trait for cluster storage
///
/// Implementations must be thread-safe; `commit` must be atomic.
pub trait HazardStore: Send + Sync {
    fn get(&self, id: &Uuid) -> Result<Option<HazardCluster>, StoreError>;

    /// All clusters in `status`, sorted by ID.
    fn list_by_status(&self, status: ClusterStatus) -> Result<Vec<HazardCluster>, StoreError>;

    /// PENDING and VERIFIED clusters.
    fn list_live(&self) -> Result<Vec<HazardCluster>, StoreError> {
        let mut live = self.list_by_status(ClusterStatus::Pending)?;
        live.extend(self.list_by_status(ClusterStatus::Verified)?);
        Ok(live)
    }

    /// Upsert every cluster, all-or-nothing.
    fn commit(&self, clusters: &[HazardCluster]) -> Result<(), StoreError>;

    /// Number of stored clusters, terminal ones included.
    fn len(&self) -> Result<usize, StoreError>;

    fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.len()? == 0)
    }
}

impl<S: HazardStore + ?Sized> HazardStore for Arc<S> {
    fn get(&self, id: &Uuid) -> Result<Option<HazardCluster>, StoreError> {
        (**self).get(id)
    }

    fn list_by_status(&self, status: ClusterStatus) -> Result<Vec<HazardCluster>, StoreError> {
        (**self).list_by_status(status)
    }

    fn commit(&self, clusters: &[HazardCluster]) -> Result<(), StoreError> {
        (**self).commit(clusters)
    }

    fn len(&self) -> Result<usize, StoreError> {
        (**self).len()
    }
}

// ============================================================================
// IN-MEMORY STORE
// ============================================================================

/// Volatile store, lost on restart.
#[derive(Debug, Default)]
pub struct MemoryStore {
    clusters: RwLock<HashMap<Uuid, HazardCluster>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl HazardStore for MemoryStore {
    fn get(&self, id: &Uuid) -> Result<Option<HazardCluster>, StoreError> {
        let clusters = self.clusters.read().unwrap_or_else(PoisonError::into_inner);
        Ok(clusters.get(id).cloned())
    }

    fn list_by_status(&self, status: ClusterStatus) -> Result<Vec<HazardCluster>, StoreError> {
        let clusters = self.clusters.read().unwrap_or_else(PoisonError::into_inner);
        let mut found: Vec<HazardCluster> = clusters
            .values()
            .filter(|c| c.status == status)
            .cloned()
            .collect();
        found.sort_by_key(|c| c.id);
        Ok(found)
    }

    fn commit(&self, batch: &[HazardCluster]) -> Result<(), StoreError> {
        let mut clusters = self.clusters.write().unwrap_or_else(PoisonError::into_inner);
        for cluster in batch {
            clusters.insert(cluster.id, cluster.clone());
        }
        Ok(())
    }

    fn len(&self) -> Result<usize, StoreError> {
        Ok(self.clusters.read().unwrap_or_else(PoisonError::into_inner).len())
    }
}

// ============================================================================
// SLED STORE (persistent)
// ============================================================================

const CLUSTER_PREFIX: &[u8] = b"c/";
const STATUS_PREFIX: u8 = b's';

fn cluster_key(id: &Uuid) -> Vec<u8> {
    let mut key = CLUSTER_PREFIX.to_vec();
    key.extend_from_slice(id.as_bytes());
    key
}

fn status_prefix(status: ClusterStatus) -> [u8; 3] {
    [STATUS_PREFIX, status.code(), b'/']
}

fn status_key(status: ClusterStatus, id: &Uuid) -> Vec<u8> {
    let mut key = status_prefix(status).to_vec();
    key.extend_from_slice(id.as_bytes());
    key
}

/// Sled-based persistent cluster store
///
/// Layout in a single tree:
/// - `c/<uuid>` → cluster record (JSON)
/// - `s<status>/<uuid>` → empty, secondary index by status
pub struct SledStore {
    db: sled::Db,
}

impl SledStore {
    /// Open a persistent store at the given path
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = sled::open(path)
            .map_err(|e| StoreError::Backend(format!("Failed to open sled DB: {}", e)))?;
        Ok(Self { db })
    }

    /// Create a temporary store, removed on drop
    pub fn open_temp() -> Result<Self, StoreError> {
        let config = sled::Config::new().temporary(true);
        let db = config
            .open()
            .map_err(|e| StoreError::Backend(format!("Failed to open temp DB: {}", e)))?;
        Ok(Self { db })
    }

    fn decode(key: &[u8], bytes: &[u8]) -> Result<HazardCluster, StoreError> {
        serde_json::from_slice(bytes).map_err(|e| StoreError::Corrupt {
            key: String::from_utf8_lossy(key).into_owned(),
            reason: e.to_string(),
        })
    }
}

impl HazardStore for SledStore {
    fn get(&self, id: &Uuid) -> Result<Option<HazardCluster>, StoreError> {
        let key = cluster_key(id);
        let value = self
            .db
            .get(&key)
            .map_err(|e| StoreError::Backend(format!("Get failed: {}", e)))?;
        value.map(|bytes| Self::decode(&key, &bytes)).transpose()
    }

    fn list_by_status(&self, status: ClusterStatus) -> Result<Vec<HazardCluster>, StoreError> {
        let prefix = status_prefix(status);
        let mut found = Vec::new();
        for result in self.db.scan_prefix(prefix) {
            let (key, _) =
                result.map_err(|e| StoreError::Backend(format!("Iteration failed: {}", e)))?;
            let id = Uuid::from_slice(&key[prefix.len()..]).map_err(|e| StoreError::Corrupt {
                key: String::from_utf8_lossy(&key).into_owned(),
                reason: e.to_string(),
            })?;
            if let Some(cluster) = self.get(&id)? {
                found.push(cluster);
            }
        }
        found.sort_by_key(|c| c.id);
        Ok(found)
    }

    fn commit(&self, clusters: &[HazardCluster]) -> Result<(), StoreError> {
        let mut batch = sled::Batch::default();
        for cluster in clusters {
            if let Some(previous) = self.get(&cluster.id)? {
                if previous.status != cluster.status {
                    batch.remove(status_key(previous.status, &cluster.id));
                }
            }
            let bytes = serde_json::to_vec(cluster)
                .map_err(|e| StoreError::Backend(format!("Encode failed: {}", e)))?;
            batch.insert(cluster_key(&cluster.id), bytes);
            batch.insert(status_key(cluster.status, &cluster.id), Vec::<u8>::new());
        }

        self.db
            .apply_batch(batch)
            .map_err(|e| StoreError::Backend(format!("Batch failed: {}", e)))?;
        self.db
            .flush()
            .map_err(|e| StoreError::Backend(format!("Flush failed: {}", e)))?;
        debug!(clusters = clusters.len(), "Committed cluster batch");
        Ok(())
    }

    fn len(&self) -> Result<usize, StoreError> {
        let mut count = 0;
        for result in self.db.scan_prefix(CLUSTER_PREFIX) {
            result.map_err(|e| StoreError::Backend(format!("Iteration failed: {}", e)))?;
            count += 1;
        }
        Ok(count)
    }
}
