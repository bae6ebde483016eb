//! Sky geometry for the TMC control plane.
//!
//! Leaf nodes reach astronomy only through the [`SkyModel`] capability.
//! This crate defines it and ships [`SphericalSkyModel`], together with the
//! pieces both pointing and delay tracking need:
//!
//! - **Targets**: parsing `radec,<RA>,<Dec>` descriptions
//! - **Time**: Julian dates and mean sidereal time
//! - **Geodesy**: WGS84 geodetic, ECEF and ENU conversions
//! - **Antennas**: the static antenna table
//! - **Delays**: fifth order delay polynomials and the `delayModel` document

#![forbid(unsafe_code)]

pub mod antenna;
pub mod delay;
pub mod geodesy;
pub mod model;
pub mod target;
pub mod time;

pub use antenna::{Antenna, AntennaTable};
pub use delay::{DelayModelCalculator, DelayModelDocument};
pub use geodesy::{Ecef, Enu, Lla};
pub use model::{SkyModel, SphericalSkyModel};
pub use target::Target;
