//! Core enumerations and command result types.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TmcError;

/// Implements `as_str`, `Display` and `FromStr` for a fieldless enum using the
/// wire names given in the table.
macro_rules! wire_names {
    ($ty:ident { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            /// All variants, in declaration order.
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            /// Wire name of the variant.
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $name),+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = TmcError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.to_ascii_uppercase().as_str() {
                    $($name => Ok(Self::$variant),)+
                    other => Err(TmcError::invalid_payload(format!(
                        "unknown {} value: {other}",
                        stringify!($ty)
                    ))),
                }
            }
        }
    };
}

/// Power / fault state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OpState {
    /// Device is initialising.
    Init,
    /// Device is powered off.
    Off,
    /// Device is in standby.
    Standby,
    /// Device is operational.
    On,
    /// Device has faulted.
    Fault,
    /// State cannot be determined.
    Unknown,
    /// Device is administratively disabled.
    Disable,
    /// Device is operational with an alarm raised.
    Alarm,
}

wire_names!(OpState {
    Init => "INIT",
    Off => "OFF",
    Standby => "STANDBY",
    On => "ON",
    Fault => "FAULT",
    Unknown => "UNKNOWN",
    Disable => "DISABLE",
    Alarm => "ALARM",
});

/// Observation state of a subarray or subarray leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ObsState {
    /// No resources assigned.
    Empty,
    /// Resources are being assigned or released.
    Resourcing,
    /// Resources assigned, not configured.
    Idle,
    /// Scan configuration in progress.
    Configuring,
    /// Configured and ready to scan.
    Ready,
    /// Scan in progress.
    Scanning,
    /// Abort in progress.
    Aborting,
    /// Aborted, waiting for reset or restart.
    Aborted,
    /// Reset in progress.
    Resetting,
    /// Restart in progress.
    Restarting,
    /// Observation fault.
    Fault,
}

wire_names!(ObsState {
    Empty => "EMPTY",
    Resourcing => "RESOURCING",
    Idle => "IDLE",
    Configuring => "CONFIGURING",
    Ready => "READY",
    Scanning => "SCANNING",
    Aborting => "ABORTING",
    Aborted => "ABORTED",
    Resetting => "RESETTING",
    Restarting => "RESTARTING",
    Fault => "FAULT",
});

impl ObsState {
    /// Whether this is one of the states entered while waiting for children.
    #[must_use]
    pub const fn is_transitional(self) -> bool {
        matches!(
            self,
            Self::Resourcing | Self::Configuring | Self::Aborting | Self::Resetting | Self::Restarting
        )
    }

    /// States in which the delay model is published.
    #[must_use]
    pub const fn tracks_delays(self) -> bool {
        matches!(self, Self::Configuring | Self::Ready | Self::Scanning)
    }
}

/// Health of a device or of an aggregate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthState {
    /// Fully functional.
    Ok,
    /// Functional with reduced capability.
    Degraded,
    /// Not functional.
    Failed,
    /// Health cannot be determined.
    Unknown,
}

wire_names!(HealthState {
    Ok => "OK",
    Degraded => "DEGRADED",
    Failed => "FAILED",
    Unknown => "UNKNOWN",
});

impl HealthState {
    /// Severity rank used by the aggregator (higher is worse).
    #[must_use]
    pub const fn severity(self) -> u8 {
        match self {
            Self::Ok => 0,
            Self::Unknown => 1,
            Self::Degraded => 2,
            Self::Failed => 3,
        }
    }
}

/// Dish pointing state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PointingState {
    /// Not moving.
    Ready,
    /// Slewing towards a position.
    Slew,
    /// Tracking a target.
    Track,
    /// Executing a scan pattern.
    Scan,
}

wire_names!(PointingState {
    Ready => "READY",
    Slew => "SLEW",
    Track => "TRACK",
    Scan => "SCAN",
});

/// Dish operating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DishMode {
    /// Low-power standby.
    StandbyLp,
    /// Full-power standby.
    StandbyFp,
    /// Operating.
    Operate,
    /// Stowed.
    Stow,
    /// Band configuration in progress.
    Config,
    /// Mode cannot be determined.
    Unknown,
}

wire_names!(DishMode {
    StandbyLp => "STANDBY_LP",
    StandbyFp => "STANDBY_FP",
    Operate => "OPERATE",
    Stow => "STOW",
    Config => "CONFIG",
    Unknown => "UNKNOWN",
});

/// Kind of sub-element a leaf node proxies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubElementKind {
    /// Correlator / beamformer.
    Csp,
    /// Science data processor.
    Sdp,
    /// Low station array controller.
    Mccs,
    /// Mid dish.
    Dish,
}

wire_names!(SubElementKind {
    Csp => "CSP",
    Sdp => "SDP",
    Mccs => "MCCS",
    Dish => "DISH",
});

/// Which telescope a device belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Telescope {
    /// Dish array.
    #[default]
    Mid,
    /// Aperture array.
    Low,
}

wire_names!(Telescope {
    Mid => "MID",
    Low => "LOW",
});

/// Result code returned by every command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResultCode {
    /// Completed successfully.
    Ok,
    /// Transitional state entered; the outcome arrives via obsState.
    Started,
    /// Command failed.
    Failed,
    /// Command not allowed in the current state.
    NotAllowed,
}

wire_names!(ResultCode {
    Ok => "OK",
    Started => "STARTED",
    Failed => "FAILED",
    NotAllowed => "NOT_ALLOWED",
});

impl ResultCode {
    /// Whether the code reports success (completed or started).
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Ok | Self::Started)
    }
}

/// `(ResultCode, message)` pair returned by every command.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Outcome of the command.
    pub result_code: ResultCode,
    /// Human-readable message.
    pub message: String,
}

impl CommandResponse {
    /// Create a response.
    #[must_use]
    pub fn new(result_code: ResultCode, message: impl Into<String>) -> Self {
        Self {
            result_code,
            message: message.into(),
        }
    }

    /// Completed successfully.
    #[must_use]
    pub fn ok(message: impl Into<String>) -> Self {
        Self::new(ResultCode::Ok, message)
    }

    /// Transitional state entered.
    #[must_use]
    pub fn started(message: impl Into<String>) -> Self {
        Self::new(ResultCode::Started, message)
    }

    /// Command failed.
    #[must_use]
    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ResultCode::Failed, message)
    }

    /// Build the wire response for an error.
    #[must_use]
    pub fn from_error(err: &TmcError) -> Self {
        Self::new(err.result_code(), err.to_string())
    }

    /// Whether the response reports success.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.result_code.is_success()
    }
}

impl fmt::Display for CommandResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.result_code, self.message)
    }
}
