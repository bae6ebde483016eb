//! The sky model capability and its built-in spherical implementation.

use chrono::{DateTime, Utc};
use nalgebra::Vector3;
use tmc_core::{TmcError, TmcResult};
use tracing::debug;

use crate::antenna::Antenna;
use crate::geodesy::{self, Ecef, Enu, Lla};
use crate::target::Target;
use crate::time::{gmst_degrees, local_sidereal_degrees, normalize_degrees};

/// Speed of light in m/s.
pub const SPEED_OF_LIGHT: f64 = 299_792_458.0;

/// Coordinate conversions needed by pointing and delay tracking.
///
/// Implementations must be cheap to call; leaf nodes invoke them on their
/// periodic tasks.
pub trait SkyModel: Send + Sync {
    /// Parse a `radec` target description.
    ///
    /// # Errors
    ///
    /// Returns `InvalidTarget` when the description cannot be parsed.
    fn to_target(&self, radec: &str) -> TmcResult<Target>;

    /// Apparent azimuth and elevation in degrees of `target` from `antenna`.
    /// Azimuth is in `[0, 360)`, measured from north through east.
    ///
    /// # Errors
    ///
    /// Returns an error when the position cannot be computed.
    fn apparent_azel(
        &self,
        target: &Target,
        at: DateTime<Utc>,
        antenna: &Antenna,
    ) -> TmcResult<(f64, f64)>;

    /// Geometric delays in seconds relative to `reference`, indexed
    /// `[antenna][timestamp]`.
    ///
    /// # Errors
    ///
    /// Returns an error when a delay cannot be computed.
    fn delays(
        &self,
        target: &Target,
        timestamps: &[DateTime<Utc>],
        antennas: &[Antenna],
        reference: &Antenna,
    ) -> TmcResult<Vec<Vec<f64>>>;

    /// One-shot preparation, called when a leaf starts.
    ///
    /// # Errors
    ///
    /// Returns an error when the preparation fails.
    fn download_ephemeris(&self) -> TmcResult<()> {
        Ok(())
    }

    /// Geodetic to ECEF.
    fn lla_to_ecef(&self, lla: Lla) -> Ecef {
        geodesy::lla_to_ecef(lla)
    }

    /// ECEF to geodetic.
    fn ecef_to_lla(&self, ecef: &Ecef) -> Lla {
        geodesy::ecef_to_lla(ecef)
    }

    /// Local offset to ECEF.
    fn enu_to_ecef(&self, enu: Enu, reference: Lla) -> Ecef {
        geodesy::enu_to_ecef(enu, reference)
    }
}

impl std::fmt::Debug for dyn SkyModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("dyn SkyModel")
    }
}

/// Sky model on a spherical sky with mean sidereal time.
///
/// Ignores precession, nutation, aberration and refraction, which is well
/// inside the tolerance of the control loop it feeds.
#[derive(Debug, Clone, Copy, Default)]
pub struct SphericalSkyModel;

impl SphericalSkyModel {
    /// Create the model.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Unit vector towards the target in ECEF at `at`.
    fn direction(target: &Target, at: DateTime<Utc>) -> Vector3<f64> {
        let gha = (gmst_degrees(at) - target.ra).to_radians();
        let (sin_dec, cos_dec) = target.dec.to_radians().sin_cos();
        Vector3::new(cos_dec * gha.cos(), -cos_dec * gha.sin(), sin_dec)
    }
}

impl SkyModel for SphericalSkyModel {
    fn to_target(&self, radec: &str) -> TmcResult<Target> {
        Target::parse(radec)
    }

    fn apparent_azel(
        &self,
        target: &Target,
        at: DateTime<Utc>,
        antenna: &Antenna,
    ) -> TmcResult<(f64, f64)> {
        let lst = local_sidereal_degrees(at, antenna.position.longitude);
        let hour_angle = (lst - target.ra).to_radians();
        let (sin_lat, cos_lat) = antenna.position.latitude.to_radians().sin_cos();
        let (sin_dec, cos_dec) = target.dec.to_radians().sin_cos();
        let (sin_ha, cos_ha) = hour_angle.sin_cos();

        let sin_el = (sin_lat * sin_dec + cos_lat * cos_dec * cos_ha).clamp(-1.0, 1.0);
        let elevation = sin_el.asin().to_degrees();
        let azimuth = (-cos_dec * sin_ha)
            .atan2(sin_dec * cos_lat - cos_dec * sin_lat * cos_ha)
            .to_degrees();

        if !azimuth.is_finite() || !elevation.is_finite() {
            return Err(TmcError::InvalidTarget(format!(
                "no position for ra {} dec {}",
                target.ra, target.dec
            )));
        }
        Ok((normalize_degrees(azimuth), elevation))
    }

    fn delays(
        &self,
        target: &Target,
        timestamps: &[DateTime<Utc>],
        antennas: &[Antenna],
        reference: &Antenna,
    ) -> TmcResult<Vec<Vec<f64>>> {
        let directions: Vec<_> = timestamps
            .iter()
            .map(|at| Self::direction(target, *at))
            .collect();

        Ok(antennas
            .iter()
            .map(|antenna| {
                let baseline = antenna.ecef - reference.ecef;
                directions
                    .iter()
                    .map(|s| -baseline.dot(s) / SPEED_OF_LIGHT)
                    .collect()
            })
            .collect())
    }

    fn download_ephemeris(&self) -> TmcResult<()> {
        debug!("spherical sky model needs no ephemeris");
        Ok(())
    }
}
