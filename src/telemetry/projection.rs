// Local East-North-Up projection of GPS fixes

use serde::{Deserialize, Serialize};

use crate::errors::LaptraceError;
use crate::track::geometry::Point2D;

/// WGS84 equatorial radius in meters
pub const EARTH_RADIUS_M: f64 = 6_378_137.0;

const DTOR: f64 = std::f64::consts::PI / 180.0;
const RTOD: f64 = 180.0 / std::f64::consts::PI;

/// A GPS fix in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lon: f64,
}

impl GeoPoint {
    pub fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lon.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lon)
    }

    pub fn validate(&self) -> Result<(), LaptraceError> {
        if self.is_valid() {
            Ok(())
        } else {
            Err(LaptraceError::InvalidCoordinate {
                lat: self.lat,
                lon: self.lon,
            })
        }
    }
}

/// Equirectangular local tangent plane anchored at a fixed point.
///
/// Distances are scaled by the anchor's latitude only, which keeps the error
/// well under a meter across a circuit a few kilometers wide. The projector
/// holds no state besides the anchor, so projecting the same fix twice gives
/// the same result.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LocalProjector {
    anchor: GeoPoint,
    meters_per_rad_lon: f64,
}

impl LocalProjector {
    /// Create a projector centred on `anchor`.
    ///
    /// # Arguments
    /// * `anchor` - The fix that becomes the origin of the local frame
    ///
    /// # Returns
    /// `InvalidCoordinate` when the anchor is out of range, non-finite or at a pole
    pub fn new(anchor: GeoPoint) -> Result<Self, LaptraceError> {
        anchor.validate()?;
        let meters_per_rad_lon = EARTH_RADIUS_M * (anchor.lat * DTOR).cos();
        if meters_per_rad_lon <= 1e-6 {
            return Err(LaptraceError::InvalidCoordinate {
                lat: anchor.lat,
                lon: anchor.lon,
            });
        }
        Ok(Self {
            anchor,
            meters_per_rad_lon,
        })
    }

    pub fn anchor(&self) -> GeoPoint {
        self.anchor
    }

    /// Project a fix into meters east (x) and north (y) of the anchor
    pub fn project(&self, point: GeoPoint) -> Result<Point2D, LaptraceError> {
        point.validate()?;
        let mut dlon = point.lon - self.anchor.lon;
        // Take the short way round across the antimeridian
        if dlon > 180.0 {
            dlon -= 360.0;
        } else if dlon < -180.0 {
            dlon += 360.0;
        }
        Ok(Point2D::new(
            dlon * DTOR * self.meters_per_rad_lon,
            (point.lat - self.anchor.lat) * DTOR * EARTH_RADIUS_M,
        ))
    }

    /// Inverse of [`LocalProjector::project`]
    pub fn unproject(&self, point: Point2D) -> GeoPoint {
        let mut lon = self.anchor.lon + point.x / self.meters_per_rad_lon * RTOD;
        if lon > 180.0 {
            lon -= 360.0;
        } else if lon < -180.0 {
            lon += 360.0;
        }
        GeoPoint::new(self.anchor.lat + point.y / EARTH_RADIUS_M * RTOD, lon)
    }

    /// Project a stream of timed fixes, dropping the invalid ones.
    ///
    /// # Returns
    /// The projected positions and the number of fixes that were rejected
    pub fn project_fixes(&self, fixes: &[(f64, GeoPoint)]) -> (Vec<(f64, Point2D)>, usize) {
        let mut invalid = 0;
        let positions = fixes
            .iter()
            .filter_map(|(t, fix)| match self.project(*fix) {
                Ok(point) => Some((*t, point)),
                Err(_) => {
                    invalid += 1;
                    None
                }
            })
            .collect();
        (positions, invalid)
    }
}

/// Pair independently timestamped latitude and longitude series into fixes.
///
/// Each latitude sample takes the longitude at the same instant, interpolated
/// between the surrounding longitude samples when they are no further apart than
/// `gap_tolerance_s`. Latitudes outside the longitude series' time range are dropped.
pub fn pair_fixes(
    latitudes: &[(f64, f64)],
    longitudes: &[(f64, f64)],
    gap_tolerance_s: f64,
) -> Vec<(f64, GeoPoint)> {
    let mut fixes = Vec::with_capacity(latitudes.len());
    let mut cursor = 0;
    for &(t, lat) in latitudes {
        while cursor + 1 < longitudes.len() && longitudes[cursor + 1].0 <= t {
            cursor += 1;
        }
        let Some(&(t0, lon0)) = longitudes.get(cursor) else {
            break;
        };
        if t0 == t {
            fixes.push((t, GeoPoint::new(lat, lon0)));
            continue;
        }
        if t0 > t {
            continue;
        }
        let Some(&(t1, lon1)) = longitudes.get(cursor + 1) else {
            break;
        };
        if t1 - t0 <= gap_tolerance_s {
            let lon = lon0 + (lon1 - lon0) * (t - t0) / (t1 - t0);
            fixes.push((t, GeoPoint::new(lat, lon)));
        }
    }
    fixes
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sonoma() -> GeoPoint {
        GeoPoint::new(38.1614, -122.4549)
    }

    #[test]
    fn test_anchor_projects_to_origin() {
        let projector = LocalProjector::new(sonoma()).unwrap();
        let origin = projector.project(sonoma()).unwrap();
        assert_eq!(origin, Point2D::new(0.0, 0.0));
    }

    #[test]
    fn test_axes_point_east_and_north() {
        let projector = LocalProjector::new(sonoma()).unwrap();
        let north = projector
            .project(GeoPoint::new(sonoma().lat + 0.001, sonoma().lon))
            .unwrap();
        assert!(north.y > 100.0 && north.y < 120.0);
        assert!(north.x.abs() < 1e-9);

        let east = projector
            .project(GeoPoint::new(sonoma().lat, sonoma().lon + 0.001))
            .unwrap();
        // One millidegree of longitude shrinks with cos(latitude)
        assert!(east.x > 80.0 && east.x < 95.0);
        assert!(east.y.abs() < 1e-9);
    }

    #[test]
    fn test_invalid_coordinates_are_rejected() {
        let projector = LocalProjector::new(sonoma()).unwrap();
        for bad in [
            GeoPoint::new(91.0, 0.0),
            GeoPoint::new(0.0, -180.5),
            GeoPoint::new(f64::NAN, 0.0),
            GeoPoint::new(0.0, f64::INFINITY),
        ] {
            assert!(matches!(
                projector.project(bad),
                Err(LaptraceError::InvalidCoordinate { .. })
            ));
        }
        assert!(LocalProjector::new(GeoPoint::new(90.0, 0.0)).is_err());
    }

    #[test]
    fn test_project_fixes_counts_invalid() {
        let projector = LocalProjector::new(sonoma()).unwrap();
        let fixes = vec![
            (0.0, sonoma()),
            (0.1, GeoPoint::new(200.0, 0.0)),
            (0.2, sonoma()),
        ];
        let (positions, invalid) = projector.project_fixes(&fixes);
        assert_eq!(positions.len(), 2);
        assert_eq!(invalid, 1);
        assert_eq!(positions[1].0, 0.2);
    }

    #[test]
    fn test_pair_fixes_interpolates_longitude() {
        let lat = vec![(0.0, 38.0), (0.05, 38.1), (0.2, 38.2), (5.0, 38.3)];
        let lon = vec![(0.0, -122.0), (0.1, -122.1), (0.2, -122.2), (2.0, -122.3)];
        let fixes = pair_fixes(&lat, &lon, 0.5);
        assert_eq!(fixes.len(), 3);
        assert_eq!(fixes[0].1, GeoPoint::new(38.0, -122.0));
        assert!((fixes[1].1.lon - -122.05).abs() < 1e-9);
        assert_eq!(fixes[2].1, GeoPoint::new(38.2, -122.2));
    }

    #[test]
    fn test_pair_fixes_skips_wide_gaps() {
        let lat = vec![(1.0, 38.0)];
        let lon = vec![(0.0, -122.0), (2.0, -122.1)];
        assert!(pair_fixes(&lat, &lon, 0.5).is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(500))]

        #[test]
        fn prop_round_trip_near_anchor(
            anchor_lat in -70.0f64..70.0,
            anchor_lon in -179.0f64..179.0,
            dlat in -0.03f64..0.03,
            dlon in -0.03f64..0.03,
        ) {
            let projector = LocalProjector::new(GeoPoint::new(anchor_lat, anchor_lon)).unwrap();
            let point = GeoPoint::new(anchor_lat + dlat, anchor_lon + dlon);
            let back = projector.unproject(projector.project(point).unwrap());
            prop_assert!((back.lat - point.lat).abs() < 1e-6);
            prop_assert!((back.lon - point.lon).abs() < 1e-6);
        }
    }
}
