//! WGS-84 geodesy: geodetic <-> ECEF and the local ENU basis.
//!
//! All angles are degrees at the API boundary; heights are metres above the
//! ellipsoid. Latitude must lie in [-90, 90] and longitude in [-180, 180).

use nalgebra::{Matrix3, Vector3};

use crate::error::{GeoSplatError, Result};

pub mod wgs84 {
    /// Semi-major axis (equatorial radius) in meters.
    pub const A: f64 = 6_378_137.0;

    /// Flattening factor (1 / 298.257223563).
    pub const F: f64 = 1.0 / 298.257_223_563;

    /// First eccentricity squared.
    pub const E2: f64 = F * (2.0 - F);

    /// Semi-minor axis (polar radius) in meters.
    pub const B: f64 = A * (1.0 - F);

    /// Second eccentricity squared.
    pub const E2P: f64 = (A * A - B * B) / (B * B);
}

/// Reject latitude/longitude outside the geodetic domain.
pub fn check_lat_lon(lat_deg: f64, lon_deg: f64) -> Result<()> {
    if !(-90.0..=90.0).contains(&lat_deg) {
        return Err(GeoSplatError::Domain {
            name: "latitude",
            value: lat_deg,
            min: -90.0,
            max: 90.0,
        });
    }

    if !(-180.0..180.0).contains(&lon_deg) {
        return Err(GeoSplatError::Domain {
            name: "longitude",
            value: lon_deg,
            min: -180.0,
            max: 180.0,
        });
    }

    Ok(())
}

/// Prime vertical radius of curvature at a latitude (radians).
#[inline]
fn prime_vertical_radius(sin_lat: f64) -> f64 {
    wgs84::A / (1.0 - wgs84::E2 * sin_lat * sin_lat).sqrt()
}

/// Geodetic (lat, lon, h) to ECEF metres.
pub fn geodetic_to_ecef(lat_deg: f64, lon_deg: f64, h_m: f64) -> Result<Vector3<f64>> {
    check_lat_lon(lat_deg, lon_deg)?;
    if !h_m.is_finite() {
        return Err(GeoSplatError::Domain {
            name: "height",
            value: h_m,
            min: f64::MIN,
            max: f64::MAX,
        });
    }

    let (sin_lat, cos_lat) = lat_deg.to_radians().sin_cos();
    let (sin_lon, cos_lon) = lon_deg.to_radians().sin_cos();

    let n = prime_vertical_radius(sin_lat);

    Ok(Vector3::new(
        (n + h_m) * cos_lat * cos_lon,
        (n + h_m) * cos_lat * sin_lon,
        (n * (1.0 - wgs84::E2) + h_m) * sin_lat,
    ))
}

/// ECEF metres to geodetic `(lat_deg, lon_deg, h_m)`.
///
/// Bowring's formula seeds the latitude, which is then refined by fixed-point
/// iteration; a single Bowring step drifts by millimetres above ~1000 km.
/// Longitude is folded into [-180, 180).
pub fn ecef_to_geodetic(x: f64, y: f64, z: f64) -> (f64, f64, f64) {
    const MAX_ITER: usize = 10;
    const LAT_TOLERANCE_RAD: f64 = 1e-14;

    let p = (x * x + y * y).sqrt();

    let mut lon = y.atan2(x).to_degrees();
    if lon >= 180.0 {
        lon -= 360.0;
    }

    // Parametric latitude seed
    let theta = (z * wgs84::A).atan2(p * wgs84::B);
    let (sin_theta, cos_theta) = theta.sin_cos();

    let mut lat = (z + wgs84::E2P * wgs84::B * sin_theta.powi(3))
        .atan2(p - wgs84::E2 * wgs84::A * cos_theta.powi(3));

    for _ in 0..MAX_ITER {
        let h = ellipsoid_height(p, z, lat);
        let n = prime_vertical_radius(lat.sin());
        let next = z.atan2(p * (1.0 - wgs84::E2 * n / (n + h)));
        let done = (next - lat).abs() < LAT_TOLERANCE_RAD;
        lat = next;
        if done {
            break;
        }
    }

    (lat.to_degrees(), lon, ellipsoid_height(p, z, lat))
}

/// Height above the ellipsoid for a point at distance `p` from the polar
/// axis, given its geodetic latitude. Well conditioned at the poles.
#[inline]
fn ellipsoid_height(p: f64, z: f64, lat: f64) -> f64 {
    let (sin_lat, cos_lat) = lat.sin_cos();
    p * cos_lat + z * sin_lat - wgs84::A * (1.0 - wgs84::E2 * sin_lat * sin_lat).sqrt()
}

/// ENU -> ECEF rotation at (lat, lon). Columns are East, North, Up in ECEF.
pub fn ecef_basis(lat_deg: f64, lon_deg: f64) -> Result<Matrix3<f64>> {
    check_lat_lon(lat_deg, lon_deg)?;

    let (sin_lat, cos_lat) = lat_deg.to_radians().sin_cos();
    let (sin_lon, cos_lon) = lon_deg.to_radians().sin_cos();

    let east = Vector3::new(-sin_lon, cos_lon, 0.0);
    let north = Vector3::new(-sin_lat * cos_lon, -sin_lat * sin_lon, cos_lat);
    let up = Vector3::new(cos_lat * cos_lon, cos_lat * sin_lon, sin_lat);

    Ok(Matrix3::from_columns(&[east, north, up]))
}

/// Great-circle distance in metres between two geodetic points on the mean sphere.
pub fn haversine_m(lat1_deg: f64, lon1_deg: f64, lat2_deg: f64, lon2_deg: f64) -> f64 {
    const MEAN_RADIUS_M: f64 = 6_371_008.8;

    let (lat1, lat2) = (lat1_deg.to_radians(), lat2_deg.to_radians());
    let d_lat = lat2 - lat1;
    let d_lon = (lon2_deg - lon1_deg).to_radians();

    let a = (d_lat * 0.5).sin().powi(2) + lat1.cos() * lat2.cos() * (d_lon * 0.5).sin().powi(2);
    2.0 * MEAN_RADIUS_M * a.sqrt().min(1.0).asin()
}
