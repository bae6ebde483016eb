//! WGS84 conversions between geodetic, Earth-centred and local frames.

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};
use tmc_core::config::GeodeticConfig;

/// WGS84 semi-major axis in metres.
pub const WGS84_A: f64 = 6_378_137.0;
/// WGS84 flattening.
pub const WGS84_F: f64 = 1.0 / 298.257_223_563;

const WGS84_E2: f64 = WGS84_F * (2.0 - WGS84_F);

/// Earth-centred, Earth-fixed position in metres.
pub type Ecef = Vector3<f64>;

/// Geodetic position: degrees and metres above the ellipsoid.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Lla {
    /// Latitude in degrees, north positive.
    pub latitude: f64,
    /// Longitude in degrees, east positive.
    pub longitude: f64,
    /// Height in metres.
    pub altitude: f64,
}

impl Lla {
    /// Create a position.
    #[must_use]
    pub const fn new(latitude: f64, longitude: f64, altitude: f64) -> Self {
        Self {
            latitude,
            longitude,
            altitude,
        }
    }
}

impl From<GeodeticConfig> for Lla {
    fn from(config: GeodeticConfig) -> Self {
        Self::new(config.latitude, config.longitude, config.altitude)
    }
}

/// Local east/north/up offset in metres.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Enu {
    /// East component.
    pub east: f64,
    /// North component.
    pub north: f64,
    /// Up component.
    pub up: f64,
}

impl Enu {
    /// Create an offset.
    #[must_use]
    pub const fn new(east: f64, north: f64, up: f64) -> Self {
        Self { east, north, up }
    }
}

/// Geodetic to ECEF.
#[must_use]
pub fn lla_to_ecef(lla: Lla) -> Ecef {
    let (sin_lat, cos_lat) = lla.latitude.to_radians().sin_cos();
    let (sin_lon, cos_lon) = lla.longitude.to_radians().sin_cos();
    let n = WGS84_A / (1.0 - WGS84_E2 * sin_lat * sin_lat).sqrt();

    Vector3::new(
        (n + lla.altitude) * cos_lat * cos_lon,
        (n + lla.altitude) * cos_lat * sin_lon,
        (n * (1.0 - WGS84_E2) + lla.altitude) * sin_lat,
    )
}

/// ECEF to geodetic, iterating on latitude until it settles.
#[must_use]
pub fn ecef_to_lla(ecef: &Ecef) -> Lla {
    let (x, y, z) = (ecef.x, ecef.y, ecef.z);
    let p = x.hypot(y);
    let longitude = y.atan2(x);

    if p < 1e-9 {
        // On the polar axis.
        let latitude = if z >= 0.0 { 90.0 } else { -90.0 };
        let b = WGS84_A * (1.0 - WGS84_F);
        return Lla::new(latitude, 0.0, z.abs() - b);
    }

    let mut latitude = z.atan2(p * (1.0 - WGS84_E2));
    let mut altitude = 0.0;
    for _ in 0..16 {
        let sin_lat = latitude.sin();
        let n = WGS84_A / (1.0 - WGS84_E2 * sin_lat * sin_lat).sqrt();
        altitude = p / latitude.cos() - n;
        let next = z.atan2(p * (1.0 - WGS84_E2 * n / (n + altitude)));
        let settled = (next - latitude).abs() < 1e-14;
        latitude = next;
        if settled {
            break;
        }
    }

    Lla::new(latitude.to_degrees(), longitude.to_degrees(), altitude)
}

/// Rotate a local offset at `reference` into ECEF and add the reference.
#[must_use]
pub fn enu_to_ecef(enu: Enu, reference: Lla) -> Ecef {
    let (sin_lat, cos_lat) = reference.latitude.to_radians().sin_cos();
    let (sin_lon, cos_lon) = reference.longitude.to_radians().sin_cos();

    let offset = Vector3::new(
        -sin_lon * enu.east - sin_lat * cos_lon * enu.north + cos_lat * cos_lon * enu.up,
        cos_lon * enu.east - sin_lat * sin_lon * enu.north + cos_lat * sin_lon * enu.up,
        cos_lat * enu.north + sin_lat * enu.up,
    );
    lla_to_ecef(reference) + offset
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn equator_prime_meridian() {
        let ecef = lla_to_ecef(Lla::new(0.0, 0.0, 0.0));
        assert!((ecef.x - WGS84_A).abs() < 1e-6);
        assert!(ecef.y.abs() < 1e-6);
        assert!(ecef.z.abs() < 1e-6);
    }

    #[test]
    fn geodetic_round_trip() {
        let site = Lla::new(-30.7130, 21.4430, 1050.0);
        let back = ecef_to_lla(&lla_to_ecef(site));
        assert!((back.latitude - site.latitude).abs() < 1e-9);
        assert!((back.longitude - site.longitude).abs() < 1e-9);
        assert!((back.altitude - site.altitude).abs() < 1e-4);
    }

    #[test]
    fn up_offset_raises_altitude() {
        let site = Lla::new(-26.8247, 116.7644, 377.0);
        let raised = ecef_to_lla(&enu_to_ecef(Enu::new(0.0, 0.0, 25.0), site));
        assert!((raised.altitude - 402.0).abs() < 1e-4);
        assert!((raised.latitude - site.latitude).abs() < 1e-9);
    }

    #[test]
    fn east_offset_moves_east() {
        let site = Lla::new(-30.7130, 21.4430, 1050.0);
        let moved = ecef_to_lla(&enu_to_ecef(Enu::new(1000.0, 0.0, 0.0), site));
        assert!(moved.longitude > site.longitude);
        let distance = (lla_to_ecef(moved) - lla_to_ecef(site)).norm();
        assert!((distance - 1000.0).abs() < 0.5);
    }
}
