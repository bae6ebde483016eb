//! Julian dates and sidereal time.

use chrono::{DateTime, Utc};

/// Julian date of the J2000.0 epoch.
pub const J2000: f64 = 2_451_545.0;

const UNIX_EPOCH_JD: f64 = 2_440_587.5;
const SECONDS_PER_DAY: f64 = 86_400.0;

/// Julian date of a UTC instant.
#[must_use]
pub fn julian_date(at: DateTime<Utc>) -> f64 {
    UNIX_EPOCH_JD + tmc_core::clock::unix_seconds(at) / SECONDS_PER_DAY
}

/// Greenwich mean sidereal time in degrees, `[0, 360)`.
#[must_use]
pub fn gmst_degrees(at: DateTime<Utc>) -> f64 {
    let d = julian_date(at) - J2000;
    let t = d / 36_525.0;
    let gmst = 280.460_618_37 + 360.985_647_366_29 * d + 0.000_387_933 * t * t
        - t * t * t / 38_710_000.0;
    normalize_degrees(gmst)
}

/// Local mean sidereal time in degrees for an east longitude, `[0, 360)`.
#[must_use]
pub fn local_sidereal_degrees(at: DateTime<Utc>, longitude: f64) -> f64 {
    normalize_degrees(gmst_degrees(at) + longitude)
}

/// Wrap an angle into `[0, 360)`.
#[must_use]
pub fn normalize_degrees(angle: f64) -> f64 {
    let wrapped = angle.rem_euclid(360.0);
    // rem_euclid can round up to exactly 360 for tiny negative inputs.
    if wrapped >= 360.0 {
        0.0
    } else {
        wrapped
    }
}
