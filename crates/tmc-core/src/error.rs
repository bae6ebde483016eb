//! Error types shared by every TMC device.

use crate::types::ResultCode;

/// Result type alias using [`TmcError`].
pub type TmcResult<T> = Result<T, TmcError>;

/// Errors that can occur while admitting, validating or executing a command.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum TmcError {
    /// The admission predicate rejected the command. No side effects.
    #[error("{command} is not allowed in state {state}")]
    NotAllowedInState {
        /// Command that was rejected.
        command: String,
        /// Human-readable description of the current state.
        state: String,
    },

    /// JSON parse error or a missing/wrong-typed key.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// Allocation conflict detected before fan-out.
    #[error("resources already allocated: {}", ids.join(", "))]
    DuplicateResource {
        /// Conflicting resource identifiers.
        ids: Vec<String>,
    },

    /// A child reported an error, or the aggregated obsState became FAULT.
    #[error("sub-element failed: {0}")]
    SubElementFailed(String),

    /// A child could not be reached at all.
    #[error("transport unavailable for {fqdn}: {reason}")]
    TransportUnavailable {
        /// Device that could not be reached.
        fqdn: String,
        /// Underlying reason.
        reason: String,
    },

    /// A remote device raised an error while executing a command.
    #[error("{fqdn} failed to execute {command}: {reason}")]
    DeviceFailed {
        /// Device that raised the error.
        fqdn: String,
        /// Command that failed.
        command: String,
        /// Error reported by the device.
        reason: String,
    },

    /// Sky coordinate cannot be parsed.
    #[error("invalid target: {0}")]
    InvalidTarget(String),

    /// Computed elevation is outside the dish limits.
    #[error("elevation {elevation:.3} deg outside limits [{min}, {max}]")]
    OutOfElevationLimits {
        /// Computed elevation in degrees.
        elevation: f64,
        /// Lower limit in degrees.
        min: f64,
        /// Upper limit in degrees.
        max: f64,
    },

    /// Behaviour documented as future work.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Terminal state not reached in the command budget.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Configuration or property error.
    #[error("configuration error: {0}")]
    Config(String),

    /// Internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

impl TmcError {
    /// Create a not-allowed error for `command` in `state`.
    #[must_use]
    pub fn not_allowed(command: impl Into<String>, state: impl std::fmt::Display) -> Self {
        Self::NotAllowedInState {
            command: command.into(),
            state: state.to_string(),
        }
    }

    /// Create an invalid payload error.
    #[must_use]
    pub fn invalid_payload(msg: impl Into<String>) -> Self {
        Self::InvalidPayload(msg.into())
    }

    /// Create a sub-element failure.
    #[must_use]
    pub fn sub_element(msg: impl Into<String>) -> Self {
        Self::SubElementFailed(msg.into())
    }

    /// Create an internal error.
    #[must_use]
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Create a configuration error.
    #[must_use]
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Map the error onto the wire result code.
    #[must_use]
    pub const fn result_code(&self) -> ResultCode {
        match self {
            Self::NotAllowedInState { .. } => ResultCode::NotAllowed,
            _ => ResultCode::Failed,
        }
    }

    /// Short kind name, used in `commandResult` documents and logs.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::NotAllowedInState { .. } => "NotAllowedInState",
            Self::InvalidPayload(_) => "InvalidPayload",
            Self::DuplicateResource { .. } => "DuplicateResource",
            Self::SubElementFailed(_) => "SubElementFailed",
            Self::TransportUnavailable { .. } => "TransportUnavailable",
            Self::DeviceFailed { .. } => "DeviceFailed",
            Self::InvalidTarget(_) => "InvalidTarget",
            Self::OutOfElevationLimits { .. } => "OutOfElevationLimits",
            Self::NotImplemented(_) => "NotImplemented",
            Self::Timeout(_) => "Timeout",
            Self::Config(_) => "Config",
            Self::Internal(_) => "Internal",
        }
    }

    /// Whether a child failure of this kind should be treated as `SubElementFailed`
    /// by the parent.
    #[must_use]
    pub const fn is_child_failure(&self) -> bool {
        matches!(
            self,
            Self::SubElementFailed(_)
                | Self::TransportUnavailable { .. }
                | Self::DeviceFailed { .. }
                | Self::NotAllowedInState { .. }
                | Self::Timeout(_)
        )
    }
}

impl From<serde_json::Error> for TmcError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidPayload(err.to_string())
    }
}

impl From<figment::Error> for TmcError {
    fn from(err: figment::Error) -> Self {
        Self::Config(err.to_string())
    }
}
