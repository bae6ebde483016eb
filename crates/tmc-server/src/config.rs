//! Configuration loading for the server binary.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tmc_core::{TmcConfig, TmcError};

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file given on the command line does not exist.
    #[error("configuration file not found: {}", .0.display())]
    MissingFile(PathBuf),

    /// A source failed to parse or the result is inconsistent.
    #[error(transparent)]
    Invalid(#[from] TmcError),
}

/// Load configuration.
///
/// Sources, later overriding earlier:
/// 1. Default values
/// 2. `tmc.toml` in the current directory (if present)
/// 3. `path` (if given; it must exist)
/// 4. Environment variables with the `TMC_` prefix, `__` between sections
///
/// # Errors
///
/// Returns `MissingFile` when `path` does not exist, `Invalid` otherwise.
pub fn load(path: Option<&Path>) -> Result<TmcConfig, ConfigError> {
    match path {
        Some(path) if !path.exists() => Err(ConfigError::MissingFile(path.to_owned())),
        Some(path) => Ok(TmcConfig::from_file(path)?),
        None => Ok(TmcConfig::load()?),
    }
}
