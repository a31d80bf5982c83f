//! The "INGEST" Gate - Report Normalization
//!
//! Turns a loosely-typed submission into a strictly validated [`Report`]:
//! - Coordinates are mandatory and range-checked
//! - Timestamp defaults to receipt time
//! - Every accepted report gets a fresh UUID
//!
//! The gate is pure: it never touches the index or the store, so a rejected
//! report leaves no trace anywhere in the engine.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::geodesy::GeoPoint;

// ============================================================================
// INPUT (boundary payload)
// ============================================================================

/// Where the coordinates of a report came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationMethod {
    /// GPS tags embedded in the photo
    PhotoExif,
    /// Browser / device geolocation at submission time
    DeviceGps,
    #[default]
    Unknown,
}

/// A report candidate as received from a client.
///
/// Everything is optional here; [`validate`] decides what is acceptable.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportCandidate {
    pub lat: Option<f64>,
    pub lng: Option<f64>,
    pub description: Option<String>,
    pub image_ref: Option<String>,
    /// Unix milliseconds; receipt time is used when absent
    pub timestamp: Option<i64>,
    pub source_session_id: Option<String>,
    #[serde(default)]
    pub location_method: LocationMethod,
}

impl ReportCandidate {
    /// Candidate at a coordinate with every optional field empty.
    pub fn at(lat: f64, lng: f64) -> Self {
        Self {
            lat: Some(lat),
            lng: Some(lng),
            ..Default::default()
        }
    }

    pub fn with_session(mut self, session: impl Into<String>) -> Self {
        self.source_session_id = Some(session.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp_ms: i64) -> Self {
        self.timestamp = Some(timestamp_ms);
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_image(mut self, image_ref: impl Into<String>) -> Self {
        self.image_ref = Some(image_ref.into());
        self
    }

    /// Applies the outcome of coordinate resolution.
    ///
    /// An unresolved location clears any coordinates, which makes the gate
    /// reject the candidate instead of guessing.
    pub fn with_location(mut self, resolved: Option<ResolvedLocation>) -> Self {
        match resolved {
            Some(loc) => {
                self.lat = Some(loc.point.lat);
                self.lng = Some(loc.point.lng);
                self.location_method = loc.method;
            }
            None => {
                self.lat = None;
                self.lng = None;
                self.location_method = LocationMethod::Unknown;
            }
        }
        self
    }
}

// ============================================================================
// COORDINATE RESOLUTION
// ============================================================================

/// Coordinates chosen for a report along with their provenance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedLocation {
    pub point: GeoPoint,
    pub method: LocationMethod,
}

/// Picks the coordinate source for a report.
///
/// Photo EXIF position wins; the device position is the fallback. `None`
/// means "unresolved".
pub fn resolve_location(
    photo_exif: Option<GeoPoint>,
    device: Option<GeoPoint>,
) -> Option<ResolvedLocation> {
    photo_exif
        .map(|point| ResolvedLocation {
            point,
            method: LocationMethod::PhotoExif,
        })
        .or_else(|| {
            device.map(|point| ResolvedLocation {
                point,
                method: LocationMethod::DeviceGps,
            })
        })
}

// ============================================================================
// OUTPUT (validated record)
// ============================================================================

/// A validated hazard report. Immutable once accepted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Report {
    pub id: Uuid,
    pub position: GeoPoint,
    /// Unix milliseconds
    pub timestamp: i64,
    pub description: Option<String>,
    pub image_ref: Option<String>,
    pub location_method: LocationMethod,
    pub origin_session_id: Option<String>,
}

/// Identity used when counting independent reporters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ReporterKey {
    Session(String),
    /// No session tracked: every such report counts on its own
    Anonymous(Uuid),
}

impl Report {
    pub fn reporter_key(&self) -> ReporterKey {
        match &self.origin_session_id {
            Some(session) => ReporterKey::Session(session.clone()),
            None => ReporterKey::Anonymous(self.id),
        }
    }
}

// ============================================================================
// VALIDATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Error)]
pub enum IngestError {
    #[error("Missing coordinate: {0}")]
    MissingCoordinate(&'static str),

    #[error("Invalid coordinate: {0}")]
    InvalidCoordinate(String),

    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
}

/// How far a client clock may run ahead of the server's.
pub const MAX_CLOCK_SKEW_MS: i64 = 5 * 60 * 1_000;

/// Validates a candidate and normalizes it into a [`Report`].
///
/// # Arguments
/// * `candidate` - The raw submission
/// * `received_at` - Receipt time (Unix ms), used when the candidate has no timestamp
pub fn validate(candidate: ReportCandidate, received_at: i64) -> Result<Report, IngestError> {
    let (lat, lng) = match (candidate.lat, candidate.lng) {
        (Some(lat), Some(lng)) => (lat, lng),
        (None, _) => return Err(IngestError::MissingCoordinate("lat")),
        (_, None) => return Err(IngestError::MissingCoordinate("lng")),
    };

    if !lat.is_finite() || !(-90.0..=90.0).contains(&lat) {
        return Err(IngestError::InvalidCoordinate(format!(
            "latitude {} outside -90..90",
            lat
        )));
    }
    if !lng.is_finite() || !(-180.0..=180.0).contains(&lng) {
        return Err(IngestError::InvalidCoordinate(format!(
            "longitude {} outside -180..180",
            lng
        )));
    }

    let timestamp = candidate.timestamp.unwrap_or(received_at);
    if timestamp < 0 {
        return Err(IngestError::InvalidTimestamp(format!(
            "{} is before the Unix epoch",
            timestamp
        )));
    }
    if timestamp > received_at.saturating_add(MAX_CLOCK_SKEW_MS) {
        return Err(IngestError::InvalidTimestamp(format!(
            "{} is ahead of receipt time {}",
            timestamp, received_at
        )));
    }

    Ok(Report {
        id: Uuid::new_v4(),
        position: GeoPoint::new(lat, lng),
        timestamp,
        description: non_blank(candidate.description),
        image_ref: non_blank(candidate.image_ref),
        location_method: candidate.location_method,
        origin_session_id: non_blank(candidate.source_session_id),
    })
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    const RECEIVED_AT: i64 = 1_704_067_200_000;

    #[test]
    fn test_validate_accepts_and_defaults_timestamp() {
        let report = validate(ReportCandidate::at(28.6139, 77.2090), RECEIVED_AT).unwrap();
        assert_eq!(report.position, GeoPoint::new(28.6139, 77.2090));
        assert_eq!(report.timestamp, RECEIVED_AT);
        assert_eq!(report.location_method, LocationMethod::Unknown);
        assert!(report.description.is_none());
    }

    #[test]
    fn test_validate_keeps_client_timestamp() {
        let candidate = ReportCandidate::at(1.0, 2.0).with_timestamp(42);
        assert_eq!(validate(candidate, RECEIVED_AT).unwrap().timestamp, 42);
    }

    #[test]
    fn test_validate_timestamp_bounds() {
        let skewed = ReportCandidate::at(1.0, 2.0).with_timestamp(RECEIVED_AT + MAX_CLOCK_SKEW_MS);
        assert_eq!(
            validate(skewed, RECEIVED_AT).unwrap().timestamp,
            RECEIVED_AT + MAX_CLOCK_SKEW_MS
        );

        // 2100-01-01
        let future = ReportCandidate::at(1.0, 2.0).with_timestamp(4_102_444_800_000);
        assert!(matches!(
            validate(future, RECEIVED_AT),
            Err(IngestError::InvalidTimestamp(_))
        ));

        for ts in [-1, i64::MIN] {
            let candidate = ReportCandidate::at(1.0, 2.0).with_timestamp(ts);
            assert!(matches!(
                validate(candidate, RECEIVED_AT),
                Err(IngestError::InvalidTimestamp(_))
            ));
        }
        let max = ReportCandidate::at(1.0, 2.0).with_timestamp(i64::MAX);
        assert!(validate(max, i64::MAX).is_ok());
    }

    #[test]
    fn test_validate_assigns_fresh_ids() {
        let a = validate(ReportCandidate::at(1.0, 2.0), RECEIVED_AT).unwrap();
        let b = validate(ReportCandidate::at(1.0, 2.0), RECEIVED_AT).unwrap();
        assert_ne!(a.id, b.id);
    }

    #[test]
    fn test_validate_rejects_missing_coordinates() {
        let no_lat = ReportCandidate {
            lng: Some(77.0),
            ..Default::default()
        };
        assert_eq!(
            validate(no_lat, RECEIVED_AT),
            Err(IngestError::MissingCoordinate("lat"))
        );

        let no_lng = ReportCandidate {
            lat: Some(28.0),
            ..Default::default()
        };
        assert_eq!(
            validate(no_lng, RECEIVED_AT),
            Err(IngestError::MissingCoordinate("lng"))
        );
    }

    #[test]
    fn test_validate_rejects_out_of_range() {
        for (lat, lng) in [(90.5, 0.0), (-91.0, 0.0), (0.0, 180.1), (0.0, -200.0)] {
            assert!(
                validate(ReportCandidate::at(lat, lng), RECEIVED_AT).is_err(),
                "({}, {}) should be rejected",
                lat,
                lng
            );
        }
        assert!(validate(ReportCandidate::at(f64::NAN, 0.0), RECEIVED_AT).is_err());
    }

    #[test]
    fn test_validate_accepts_range_edges() {
        assert!(validate(ReportCandidate::at(90.0, 180.0), RECEIVED_AT).is_ok());
        assert!(validate(ReportCandidate::at(-90.0, -180.0), RECEIVED_AT).is_ok());
    }

    #[test]
    fn test_validate_trims_optional_text() {
        let candidate = ReportCandidate::at(1.0, 2.0)
            .with_description("  Pothole near the bus stop  ")
            .with_image("   ")
            .with_session("");
        let report = validate(candidate, RECEIVED_AT).unwrap();
        assert_eq!(report.description.as_deref(), Some("Pothole near the bus stop"));
        assert!(report.image_ref.is_none());
        assert!(report.origin_session_id.is_none());
    }

    #[test]
    fn test_reporter_key() {
        let anon = validate(ReportCandidate::at(1.0, 2.0), RECEIVED_AT).unwrap();
        assert_eq!(anon.reporter_key(), ReporterKey::Anonymous(anon.id));

        let tracked = validate(ReportCandidate::at(1.0, 2.0).with_session("s-1"), RECEIVED_AT).unwrap();
        assert_eq!(tracked.reporter_key(), ReporterKey::Session("s-1".into()));
    }

    #[test]
    fn test_resolve_location_prefers_photo() {
        let photo = GeoPoint::new(1.0, 1.0);
        let device = GeoPoint::new(2.0, 2.0);

        let resolved = resolve_location(Some(photo), Some(device)).unwrap();
        assert_eq!(resolved.point, photo);
        assert_eq!(resolved.method, LocationMethod::PhotoExif);

        let fallback = resolve_location(None, Some(device)).unwrap();
        assert_eq!(fallback.method, LocationMethod::DeviceGps);

        assert!(resolve_location(None, None).is_none());
    }

    #[test]
    fn test_unresolved_location_is_rejected() {
        let candidate = ReportCandidate::at(1.0, 2.0).with_location(None);
        assert!(validate(candidate, RECEIVED_AT).is_err());

        let resolved = resolve_location(None, Some(GeoPoint::new(3.0, 4.0)));
        let report = validate(ReportCandidate::default().with_location(resolved), RECEIVED_AT).unwrap();
        assert_eq!(report.location_method, LocationMethod::DeviceGps);
        assert_eq!(report.position, GeoPoint::new(3.0, 4.0));
    }
}
