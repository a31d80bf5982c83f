//! The "LIFECYCLE" Engine - Verification State Machine
//!
//! ```text
//!             distinct reporters >= threshold
//!   PENDING ───────────────────────────────────► VERIFIED (sticky, never expires)
//!      │  │
//!      │  └── idle > window ──► EXPIRED
//!      └──── absorbed by an older PENDING neighbour ──► MERGED
//! ```
//!
//! Every state but PENDING is terminal. Promotion is a single field write on
//! a cluster copy that is persisted atomically, so readers see a cluster
//! either PENDING or VERIFIED, never in between.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::hazard_matching::HazardCluster;

/// Lifecycle state of a hazard cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClusterStatus {
    Pending,
    Verified,
    Expired,
    Merged,
}

impl ClusterStatus {
    pub const ALL: [ClusterStatus; 4] = [
        ClusterStatus::Pending,
        ClusterStatus::Verified,
        ClusterStatus::Expired,
        ClusterStatus::Merged,
    ];

    /// Live clusters are indexed and can absorb new reports.
    pub fn is_live(self) -> bool {
        matches!(self, ClusterStatus::Pending | ClusterStatus::Verified)
    }

    /// No further transitions are possible from a terminal state.
    pub fn is_terminal(self) -> bool {
        !matches!(self, ClusterStatus::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ClusterStatus::Pending => "PENDING",
            ClusterStatus::Verified => "VERIFIED",
            ClusterStatus::Expired => "EXPIRED",
            ClusterStatus::Merged => "MERGED",
        }
    }

    /// Stable one-byte tag used as a storage key prefix.
    pub fn code(self) -> u8 {
        match self {
            ClusterStatus::Pending => 0,
            ClusterStatus::Verified => 1,
            ClusterStatus::Expired => 2,
            ClusterStatus::Merged => 3,
        }
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("Illegal transition {from} -> {to} for cluster {cluster_id}")]
pub struct TransitionError {
    pub cluster_id: Uuid,
    pub from: ClusterStatus,
    pub to: ClusterStatus,
}

/// Decides and applies status transitions.
#[derive(Debug, Clone)]
pub struct VerificationStateMachine {
    /// Distinct reporters needed for PENDING → VERIFIED
    verify_threshold: usize,

    /// Idle time after which a PENDING cluster expires (ms)
    expiry_window_ms: i64,
}

impl VerificationStateMachine {
    pub fn new(verify_threshold: usize, expiry_window_ms: i64) -> Self {
        Self {
            verify_threshold: verify_threshold.max(1),
            expiry_window_ms,
        }
    }

    pub fn verify_threshold(&self) -> usize {
        self.verify_threshold
    }

    /// Whether `from → to` is an allowed transition.
    pub fn can_transition(from: ClusterStatus, to: ClusterStatus) -> bool {
        matches!(
            (from, to),
            (
                ClusterStatus::Pending,
                ClusterStatus::Verified | ClusterStatus::Expired | ClusterStatus::Merged
            )
        )
    }

    /// Apply a transition, leaving the cluster untouched if it is illegal.
    pub fn transition(
        &self,
        cluster: &mut HazardCluster,
        to: ClusterStatus,
        at: i64,
    ) -> Result<(), TransitionError> {
        if !Self::can_transition(cluster.status, to) {
            return Err(TransitionError {
                cluster_id: cluster.id,
                from: cluster.status,
                to,
            });
        }
        if to == ClusterStatus::Verified {
            cluster.verified_at = Some(at);
        }
        cluster.status = to;
        Ok(())
    }

    /// Re-evaluate a cluster after its membership changed.
    ///
    /// Returns true if the cluster was promoted to VERIFIED by this call.
    pub fn evaluate(&self, cluster: &mut HazardCluster, now: i64) -> bool {
        if cluster.status != ClusterStatus::Pending {
            return false;
        }
        let reporters = cluster.distinct_reporters();
        if reporters < self.verify_threshold {
            return false;
        }
        if self.transition(cluster, ClusterStatus::Verified, now).is_err() {
            return false;
        }
        info!(
            cluster_id = %cluster.id,
            reporters,
            members = cluster.members.len(),
            "Hazard verified"
        );
        true
    }

    /// A PENDING cluster is stale once nothing joined it within the window.
    pub fn is_stale(&self, cluster: &HazardCluster, now: i64) -> bool {
        cluster.status == ClusterStatus::Pending
            && now.saturating_sub(cluster.last_report_at) > self.expiry_window_ms
    }

    /// Expire the cluster if stale. Returns true if it transitioned.
    pub fn expire_if_stale(&self, cluster: &mut HazardCluster, now: i64) -> bool {
        if !self.is_stale(cluster, now) {
            return false;
        }
        if self.transition(cluster, ClusterStatus::Expired, now).is_err() {
            return false;
        }
        info!(
            cluster_id = %cluster.id,
            idle_ms = now.saturating_sub(cluster.last_report_at),
            "Hazard cluster expired"
        );
        true
    }

    /// Mark `loser` as absorbed into `survivor_id`.
    pub fn mark_merged(
        &self,
        loser: &mut HazardCluster,
        survivor_id: Uuid,
        at: i64,
    ) -> Result<(), TransitionError> {
        self.transition(loser, ClusterStatus::Merged, at)?;
        loser.merged_into = Some(survivor_id);
        Ok(())
    }
}
