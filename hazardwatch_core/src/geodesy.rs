//! Great-circle distance shared by "same spot" matching and "nearby" filtering.
//!
//! Both the cluster matcher and the map-feed proximity filter call
//! [`haversine_m`], so the two notions of closeness cannot drift apart.

use nalgebra::Vector2;
use serde::{Deserialize, Serialize};

/// Mean Earth radius used by the haversine formula (meters).
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// A WGS84 surface coordinate in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// True when both components are finite and inside the WGS84 ranges.
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }

    /// Haversine distance to another point in meters.
    #[inline]
    pub fn distance_m(&self, other: &GeoPoint) -> f64 {
        haversine_m(*self, *other)
    }

    #[inline]
    fn to_vector(self) -> Vector2<f64> {
        Vector2::new(self.lat, self.lng)
    }
}

/// Haversine great-circle distance in meters.
///
/// ```text
/// a = sin²(Δφ/2) + cos φ1 · cos φ2 · sin²(Δλ/2)
/// c = 2 · atan2(√a, √(1−a))
/// d = R · c
/// ```
pub fn haversine_m(a: GeoPoint, b: GeoPoint) -> f64 {
    let phi1 = a.lat.to_radians();
    let phi2 = b.lat.to_radians();
    let d_phi = (b.lat - a.lat).to_radians();
    let d_lambda = (b.lng - a.lng).to_radians();

    let h = (d_phi / 2.0).sin().powi(2)
        + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());

    EARTH_RADIUS_M * c
}

/// Equal-weight coordinate-wise mean of a set of points.
///
/// Returns `None` for an empty set. Hazard clusters are a few dozen meters
/// across, so the plain arithmetic mean is used rather than a spherical one.
/// Longitudes are unwrapped around the first point before averaging, so a
/// cluster straddling ±180° stays where its members are.
pub fn mean_point<I>(points: I) -> Option<GeoPoint>
where
    I: IntoIterator<Item = GeoPoint>,
{
    let mut points = points.into_iter();
    let first = points.next()?;

    let mut count = 1usize;
    let sum: Vector2<f64> = points
        .inspect(|_| count += 1)
        .map(|p| GeoPoint::new(p.lat, first.lng + wrap_lng(p.lng - first.lng)).to_vector())
        .fold(first.to_vector(), |acc, v| acc + v);

    let mean = sum / count as f64;
    Some(GeoPoint::new(mean.x, wrap_lng(mean.y)))
}

/// Longitude folded into [-180, 180].
fn wrap_lng(lng: f64) -> f64 {
    if (-180.0..=180.0).contains(&lng) {
        lng
    } else {
        (lng + 180.0).rem_euclid(360.0) - 180.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_haversine_zero_distance() {
        let p = GeoPoint::new(28.6139, 77.2090);
        assert_eq!(haversine_m(p, p), 0.0);
    }

    #[test]
    fn test_haversine_close_reports() {
        // Two phone photos of the same pothole near Connaught Place
        let a = GeoPoint::new(28.6139, 77.2090);
        let b = GeoPoint::new(28.6140, 77.2091);
        let d = a.distance_m(&b);
        assert!(d > 10.0 && d < 20.0, "distance was {}", d);
        assert_relative_eq!(d, haversine_m(b, a), epsilon = 1e-9);
    }

    #[test]
    fn test_haversine_cross_city() {
        // Gurugram vs central Delhi
        let c = GeoPoint::new(28.4595, 77.0266);
        let centroid = GeoPoint::new(28.6139, 77.2090);
        let d = c.distance_m(&centroid);
        assert!(d > 24_000.0 && d < 25_500.0, "distance was {}", d);
    }

    #[test]
    fn test_haversine_one_degree_latitude() {
        let a = GeoPoint::new(0.0, 0.0);
        let b = GeoPoint::new(1.0, 0.0);
        assert_relative_eq!(haversine_m(a, b), 111_194.93, epsilon = 0.1);
    }

    #[test]
    fn test_point_validity() {
        assert!(GeoPoint::new(90.0, 180.0).is_valid());
        assert!(GeoPoint::new(-90.0, -180.0).is_valid());
        assert!(!GeoPoint::new(90.01, 0.0).is_valid());
        assert!(!GeoPoint::new(0.0, -180.5).is_valid());
        assert!(!GeoPoint::new(f64::NAN, 0.0).is_valid());
        assert!(!GeoPoint::new(0.0, f64::INFINITY).is_valid());
    }

    #[test]
    fn test_mean_point() {
        assert!(mean_point(Vec::new()).is_none());

        let mean = mean_point(vec![
            GeoPoint::new(10.0, 20.0),
            GeoPoint::new(12.0, 22.0),
            GeoPoint::new(14.0, 27.0),
        ])
        .unwrap();
        assert_relative_eq!(mean.lat, 12.0, epsilon = 1e-12);
        assert_relative_eq!(mean.lng, 23.0, epsilon = 1e-12);
    }

    #[test]
    fn test_mean_point_across_antimeridian() {
        let east = GeoPoint::new(-17.0, 179.99995);
        let west = GeoPoint::new(-17.0, -179.99995);

        for points in [vec![east, west], vec![west, east]] {
            let mean = mean_point(points).unwrap();
            assert!(mean.is_valid());
            assert_relative_eq!(mean.lat, -17.0, epsilon = 1e-12);
            assert!(mean.lng.abs() > 179.9999);
            assert!(haversine_m(mean, east) < 10.0);
            assert!(haversine_m(mean, west) < 10.0);
        }
    }
}
