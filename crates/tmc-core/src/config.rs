//! Configuration for a TMC deployment.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;

use crate::error::{TmcError, TmcResult};
use crate::types::Telescope;

/// Antenna table used when none is configured: four dishes around the Mid
/// array centre.
pub const DEFAULT_ANTENNA_TABLE: &str = "\
# name, ref_lat, ref_lon, ref_alt, enu_x, enu_y, enu_z
0001, -30.7130, 21.4430, 1050.0, 0.0, 0.0, 0.0
0002, -30.7130, 21.4430, 1050.0, 120.5, -35.2, 1.1
0003, -30.7130, 21.4430, 1050.0, -210.0, 88.4, -0.6
0004, -30.7130, 21.4430, 1050.0, 45.3, 310.7, 2.4
";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TmcConfig {
    /// Telescope layout.
    #[serde(default)]
    pub telescope: TelescopeConfig,

    /// Dish pointing.
    #[serde(default)]
    pub pointing: PointingConfig,

    /// Delay model publication.
    #[serde(default)]
    pub delay_model: DelayModelConfig,

    /// Command execution.
    #[serde(default)]
    pub commands: CommandConfig,

    /// Device event queues.
    #[serde(default)]
    pub events: EventConfig,

    /// Simulated sub-elements.
    #[serde(default)]
    pub simulation: SimulationConfig,

    /// Antenna positions.
    #[serde(default)]
    pub antennas: AntennaConfig,
}

impl TmcConfig {
    /// Load configuration from the default sources.
    ///
    /// Later sources override earlier ones:
    /// 1. Default values
    /// 2. `tmc.toml` in the current directory (if present)
    /// 3. Environment variables with the `TMC_` prefix
    ///
    /// # Errors
    ///
    /// Returns `Config` when a source cannot be parsed or the result is
    /// inconsistent.
    pub fn load() -> TmcResult<Self> {
        Self::from_figment(Figment::new().merge(Toml::file("tmc.toml")))
    }

    /// Load configuration from a specific TOML file, then the environment.
    ///
    /// # Errors
    ///
    /// Returns `Config` when a source cannot be parsed or the result is
    /// inconsistent.
    pub fn from_file(path: impl AsRef<Path>) -> TmcResult<Self> {
        Self::from_figment(
            Figment::new()
                .merge(Toml::file("tmc.toml"))
                .merge(Toml::file(path.as_ref())),
        )
    }

    fn from_figment(figment: Figment) -> TmcResult<Self> {
        let config: Self = figment
            .merge(Env::prefixed("TMC_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field constraints.
    ///
    /// # Errors
    ///
    /// Returns `Config` describing the first violated constraint.
    pub fn validate(&self) -> TmcResult<()> {
        if self.telescope.subarrays == 0 {
            return Err(TmcError::config("telescope.subarrays must be at least 1"));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = self.telescope.receptors.iter().find(|r| !seen.insert(*r)) {
            return Err(TmcError::config(format!("duplicate receptor id {dup}")));
        }
        if self.pointing.cadence_ms == 0 {
            return Err(TmcError::config("pointing.cadence_ms must be positive"));
        }
        if self.pointing.elevation_min >= self.pointing.elevation_max {
            return Err(TmcError::config(format!(
                "pointing elevation window [{}, {}] is empty",
                self.pointing.elevation_min, self.pointing.elevation_max
            )));
        }
        if self.delay_model.update_interval_secs == 0 {
            return Err(TmcError::config(
                "delay_model.update_interval_secs must be positive",
            ));
        }
        Ok(())
    }
}

/// Telescope layout.
#[derive(Debug, Clone, Deserialize)]
pub struct TelescopeConfig {
    /// Which telescope to deploy.
    #[serde(default)]
    pub kind: Telescope,

    /// Number of subarrays.
    #[serde(default = "default_subarrays")]
    pub subarrays: u32,

    /// Receptor ids of the dish array.
    #[serde(default = "default_receptors")]
    pub receptors: Vec<String>,

    /// Station ids of the aperture array.
    #[serde(default = "default_stations")]
    pub stations: Vec<u32>,

    /// Reference position of the aperture array, used for station beams.
    #[serde(default)]
    pub station_reference: GeodeticConfig,
}

const fn default_subarrays() -> u32 {
    1
}

fn default_receptors() -> Vec<String> {
    ["0001", "0002", "0003", "0004"]
        .into_iter()
        .map(str::to_owned)
        .collect()
}

fn default_stations() -> Vec<u32> {
    vec![1, 2, 3, 4]
}

impl Default for TelescopeConfig {
    fn default() -> Self {
        Self {
            kind: Telescope::default(),
            subarrays: default_subarrays(),
            receptors: default_receptors(),
            stations: default_stations(),
            station_reference: GeodeticConfig::default(),
        }
    }
}

/// Geodetic position in degrees and metres.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct GeodeticConfig {
    /// Latitude in degrees.
    pub latitude: f64,
    /// Longitude in degrees.
    pub longitude: f64,
    /// Height above the ellipsoid in metres.
    pub altitude: f64,
}

impl Default for GeodeticConfig {
    fn default() -> Self {
        Self {
            latitude: -26.8247,
            longitude: 116.7644,
            altitude: 377.0,
        }
    }
}

/// Dish pointing.
#[derive(Debug, Clone, Deserialize)]
pub struct PointingConfig {
    /// Desired-pointing cadence in milliseconds.
    #[serde(default = "default_cadence_ms")]
    pub cadence_ms: u64,

    /// Lowest commandable elevation in degrees.
    #[serde(default = "default_elevation_min")]
    pub elevation_min: f64,

    /// Highest commandable elevation in degrees.
    #[serde(default = "default_elevation_max")]
    pub elevation_max: f64,
}

const fn default_cadence_ms() -> u64 {
    50
}

const fn default_elevation_min() -> f64 {
    17.5
}

const fn default_elevation_max() -> f64 {
    90.0
}

impl PointingConfig {
    /// Cadence as a duration.
    #[must_use]
    pub const fn cadence(&self) -> Duration {
        Duration::from_millis(self.cadence_ms)
    }
}

impl Default for PointingConfig {
    fn default() -> Self {
        Self {
            cadence_ms: default_cadence_ms(),
            elevation_min: default_elevation_min(),
            elevation_max: default_elevation_max(),
        }
    }
}

/// Delay model publication.
#[derive(Debug, Clone, Deserialize)]
pub struct DelayModelConfig {
    /// Seconds between publications.
    #[serde(default = "default_update_interval_secs")]
    pub update_interval_secs: u64,

    /// Seconds between now and the epoch of a published model.
    #[serde(default = "default_lookahead_secs")]
    pub lookahead_secs: u64,
}

const fn default_update_interval_secs() -> u64 {
    10
}

const fn default_lookahead_secs() -> u64 {
    60
}

impl DelayModelConfig {
    /// Interval as a duration.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_secs(self.update_interval_secs)
    }
}

impl Default for DelayModelConfig {
    fn default() -> Self {
        Self {
            update_interval_secs: default_update_interval_secs(),
            lookahead_secs: default_lookahead_secs(),
        }
    }
}

/// Command execution.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CommandConfig {
    /// Budget for a composite command to reach its terminal state. No
    /// timeout when unset.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl CommandConfig {
    /// Timeout as a duration.
    #[must_use]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }
}

/// Device event queues.
#[derive(Debug, Clone, Deserialize)]
pub struct EventConfig {
    /// Capacity of each device's event queue.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

const fn default_queue_capacity() -> usize {
    1024
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
        }
    }
}

/// Simulated sub-elements.
#[derive(Debug, Clone, Deserialize)]
pub struct SimulationConfig {
    /// Time a simulated device spends in a transitional state.
    #[serde(default = "default_transition_latency_ms")]
    pub transition_latency_ms: u64,
}

const fn default_transition_latency_ms() -> u64 {
    100
}

impl SimulationConfig {
    /// Latency as a duration.
    #[must_use]
    pub const fn transition_latency(&self) -> Duration {
        Duration::from_millis(self.transition_latency_ms)
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            transition_latency_ms: default_transition_latency_ms(),
        }
    }
}

/// Antenna positions.
#[derive(Debug, Clone, Deserialize)]
pub struct AntennaConfig {
    /// Antenna table text, one record per line.
    #[serde(default = "default_antenna_table")]
    pub table: String,
}

fn default_antenna_table() -> String {
    DEFAULT_ANTENNA_TABLE.to_owned()
}

impl Default for AntennaConfig {
    fn default() -> Self {
        Self {
            table: default_antenna_table(),
        }
    }
}
