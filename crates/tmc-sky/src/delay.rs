//! Delay polynomials for the correlator.
//!
//! Every update samples the geometric delay at six instants around an epoch
//! in the near future and fits a fifth order polynomial in seconds relative
//! to that epoch. The published document carries one coefficient set per
//! receptor and frequency slice.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use nalgebra::{Matrix6, Vector6};
use serde::{Deserialize, Serialize};
use tmc_core::{clock, TmcError, TmcResult};
use tracing::warn;

use crate::antenna::Antenna;
use crate::model::SkyModel;
use crate::target::Target;

/// Sample offsets in seconds relative to the epoch.
pub const FIT_OFFSETS_SECS: [f64; 6] = [-25.0, -15.0, -5.0, 5.0, 15.0, 25.0];

/// Number of polynomial coefficients.
pub const POLYNOMIAL_TERMS: usize = 6;

/// Smallest step between two published epochs, in seconds.
const MIN_EPOCH_STEP: f64 = 1e-3;

/// Delay polynomial of one frequency slice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FsidDelay {
    /// Frequency slice id.
    pub fsid: u64,
    /// Coefficients `c0..c5`, seconds per second^n.
    pub delay_coeff: Vec<f64>,
}

/// Delay polynomials of one receptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceptorDelay {
    /// Receptor id.
    pub receptor: String,
    /// One entry per frequency slice.
    pub receptor_delay_details: Vec<FsidDelay>,
}

/// The `delayModel` attribute document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelayModelDocument {
    /// Epoch of the polynomials as unix seconds.
    pub epoch: f64,
    /// One entry per receptor.
    pub delay_details: Vec<ReceptorDelay>,
}

/// Fit `c0 + c1 x + ... + c5 x^5` through six samples.
///
/// # Errors
///
/// Returns `Internal` when the sample abscissae are degenerate.
pub fn fit_polynomial(x: &[f64; 6], y: &[f64; 6]) -> TmcResult<[f64; POLYNOMIAL_TERMS]> {
    let vandermonde = Matrix6::from_fn(|row, col| x[row].powi(col as i32));
    let rhs = Vector6::from_column_slice(y);
    let solution = vandermonde
        .lu()
        .solve(&rhs)
        .ok_or_else(|| TmcError::internal("delay fit matrix is singular"))?;

    let mut coefficients = [0.0; POLYNOMIAL_TERMS];
    coefficients.copy_from_slice(solution.as_slice());
    Ok(coefficients)
}

/// Evaluate a polynomial at `x`.
#[must_use]
pub fn evaluate(coefficients: &[f64], x: f64) -> f64 {
    coefficients.iter().rev().fold(0.0, |acc, c| acc * x + c)
}

/// Produces successive delay model documents for one subarray.
pub struct DelayModelCalculator {
    sky: Arc<dyn SkyModel>,
    reference: Antenna,
    lookahead: Duration,
    last_epoch: Option<f64>,
}

impl DelayModelCalculator {
    /// Create a calculator. `lookahead` is the distance from now to the
    /// epoch of each document.
    #[must_use]
    pub fn new(sky: Arc<dyn SkyModel>, reference: Antenna, lookahead: std::time::Duration) -> Self {
        Self {
            sky,
            reference,
            lookahead: Duration::from_std(lookahead).unwrap_or_else(|_| Duration::seconds(60)),
            last_epoch: None,
        }
    }

    /// Epoch of the last document produced.
    #[must_use]
    pub const fn last_epoch(&self) -> Option<f64> {
        self.last_epoch
    }

    /// Build the document for `now`. Every antenna gets the same polynomial
    /// for each of `fsids`, since the geometric delay does not depend on the
    /// frequency slice.
    ///
    /// # Errors
    ///
    /// Returns an error when the sky model or the fit fails.
    pub fn compute(
        &mut self,
        target: &Target,
        antennas: &[Antenna],
        fsids: &[u64],
        now: DateTime<Utc>,
    ) -> TmcResult<DelayModelDocument> {
        let mut epoch_time = now + self.lookahead;
        let mut epoch = clock::unix_seconds(epoch_time);
        if let Some(last) = self.last_epoch {
            if epoch <= last {
                warn!(epoch, last, "delay epoch did not advance, nudging forward");
                epoch = last + MIN_EPOCH_STEP;
                epoch_time = from_unix_seconds(epoch)?;
            }
        }

        let timestamps: Vec<_> = FIT_OFFSETS_SECS
            .iter()
            .map(|offset| epoch_time + Duration::microseconds((offset * 1e6) as i64))
            .collect();
        let delays = self
            .sky
            .delays(target, &timestamps, antennas, &self.reference)?;

        let mut delay_details = Vec::with_capacity(antennas.len());
        for (antenna, samples) in antennas.iter().zip(delays) {
            let samples: [f64; 6] = samples.try_into().map_err(|v: Vec<f64>| {
                TmcError::internal(format!(
                    "sky model returned {} delays for {}",
                    v.len(),
                    antenna.name
                ))
            })?;
            let coefficients = fit_polynomial(&FIT_OFFSETS_SECS, &samples)?;
            delay_details.push(ReceptorDelay {
                receptor: antenna.name.clone(),
                receptor_delay_details: fsids
                    .iter()
                    .map(|fsid| FsidDelay {
                        fsid: *fsid,
                        delay_coeff: coefficients.to_vec(),
                    })
                    .collect(),
            });
        }

        self.last_epoch = Some(epoch);
        Ok(DelayModelDocument {
            epoch,
            delay_details,
        })
    }
}

impl std::fmt::Debug for DelayModelCalculator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayModelCalculator")
            .field("reference", &self.reference.name)
            .field("lookahead", &self.lookahead)
            .field("last_epoch", &self.last_epoch)
            .finish_non_exhaustive()
    }
}

fn from_unix_seconds(seconds: f64) -> TmcResult<DateTime<Utc>> {
    let whole = seconds.floor();
    let nanos = ((seconds - whole) * 1e9) as u32;
    DateTime::from_timestamp(whole as i64, nanos)
        .ok_or_else(|| TmcError::internal(format!("epoch {seconds} out of range")))
}
