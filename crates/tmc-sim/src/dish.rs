//! Simulated dish master.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tmc_core::device::unknown_command;
use tmc_core::{
    names, AttrValue, AttributeStore, CommandResponse, DeviceServer, DishMode, HealthState,
    OpState, PointingState, TmcError, TmcResult,
};
use tracing::debug;

use crate::faults::{Fault, FaultTable};

/// A dish master.
///
/// Mode commands switch `dishMode` directly; `ConfigureBandN` passes
/// through `CONFIG` for the latency and settles in `OPERATE`. `Track` puts
/// the dish into `SLEW` and the first `desiredPointing` write brings it to
/// `TRACK`. Every commanded sample is recorded.
#[derive(Debug)]
pub struct SimulatedDishMaster {
    attributes: Arc<AttributeStore>,
    latency: Duration,
    band_generation: Arc<Mutex<u64>>,
    samples: Mutex<Vec<[f64; 3]>>,
    faults: FaultTable,
}

impl SimulatedDishMaster {
    /// Create a dish in `STANDBY_LP`, pointing `READY`.
    #[must_use]
    pub fn new(fqdn: &str, latency: Duration) -> Self {
        let attributes = AttributeStore::new(fqdn);
        attributes.set_op_state(OpState::Standby);
        attributes.set_health_state(HealthState::Ok);
        attributes.set(names::DISH_MODE, AttrValue::DishMode(DishMode::StandbyLp));
        attributes.set(names::POINTING_STATE, AttrValue::Pointing(PointingState::Ready));
        attributes.set(
            names::ACHIEVED_POINTING,
            AttrValue::DoubleArray(vec![0.0, 0.0, 90.0]),
        );
        Self {
            attributes: Arc::new(attributes),
            latency,
            band_generation: Arc::new(Mutex::new(0)),
            samples: Mutex::new(Vec::new()),
            faults: FaultTable::default(),
        }
    }

    /// Fault injection table.
    #[must_use]
    pub const fn faults(&self) -> &FaultTable {
        &self.faults
    }

    /// Every `[timestamp_ms, az, el]` written to `desiredPointing`.
    #[must_use]
    pub fn desired_pointing_samples(&self) -> Vec<[f64; 3]> {
        self.samples.lock().clone()
    }

    /// Number of `desiredPointing` writes received.
    #[must_use]
    pub fn sample_count(&self) -> usize {
        self.samples.lock().len()
    }

    /// Current dish mode.
    #[must_use]
    pub fn dish_mode(&self) -> Option<DishMode> {
        self.attributes
            .get(names::DISH_MODE)
            .and_then(|v| v.as_dish_mode())
    }

    /// Current pointing state.
    #[must_use]
    pub fn pointing_state(&self) -> Option<PointingState> {
        self.attributes
            .get(names::POINTING_STATE)
            .and_then(|v| v.as_pointing())
    }

    /// Overwrite the health state.
    pub fn set_health(&self, health: HealthState) {
        self.attributes.set_health_state(health);
    }

    fn set_mode(&self, mode: DishMode) {
        *self.band_generation.lock() += 1;
        self.attributes.set(names::DISH_MODE, AttrValue::DishMode(mode));
        let op = match mode {
            DishMode::StandbyLp | DishMode::StandbyFp | DishMode::Stow => OpState::Standby,
            _ => OpState::On,
        };
        self.attributes.set_op_state(op);
    }

    fn set_pointing(&self, state: PointingState) {
        self.attributes
            .set(names::POINTING_STATE, AttrValue::Pointing(state));
    }

    fn configure_band(&self) {
        let generation = {
            let mut generation = self.band_generation.lock();
            *generation += 1;
            self.attributes
                .set(names::DISH_MODE, AttrValue::DishMode(DishMode::Config));
            *generation
        };

        let attributes = self.attributes.clone();
        let current = self.band_generation.clone();
        let latency = self.latency;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            let guard = current.lock();
            if *guard == generation {
                attributes.set(names::DISH_MODE, AttrValue::DishMode(DishMode::Operate));
                attributes.set_op_state(OpState::On);
            }
            drop(guard);
        });
    }

    fn record_sample(&self, value: &AttrValue) -> TmcResult<()> {
        let sample: [f64; 3] = value
            .as_doubles()
            .and_then(|v| v.try_into().ok())
            .ok_or_else(|| {
                TmcError::invalid_payload("desiredPointing must be [timestamp, az, el]")
            })?;
        self.samples.lock().push(sample);
        self.attributes
            .set(names::ACHIEVED_POINTING, AttrValue::DoubleArray(sample.to_vec()));
        if self.pointing_state() == Some(PointingState::Slew) {
            self.set_pointing(PointingState::Track);
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceServer for SimulatedDishMaster {
    fn fqdn(&self) -> &str {
        self.attributes.owner()
    }

    fn attributes(&self) -> &AttributeStore {
        &self.attributes
    }

    async fn command_inout(&self, command: &str, _argin: Option<Value>) -> TmcResult<CommandResponse> {
        if self.faults.get(command) == Some(Fault::Reject) {
            return Err(TmcError::DeviceFailed {
                fqdn: self.fqdn().to_owned(),
                command: command.to_owned(),
                reason: "injected fault".to_owned(),
            });
        }
        debug!(fqdn = %self.fqdn(), command, "simulated dish command");

        match command {
            "SetStandbyLPMode" => {
                self.set_mode(DishMode::StandbyLp);
                self.set_pointing(PointingState::Ready);
            }
            "SetStandbyFPMode" => {
                self.set_mode(DishMode::StandbyFp);
                self.set_pointing(PointingState::Ready);
            }
            "SetOperateMode" => self.set_mode(DishMode::Operate),
            "SetStowMode" => {
                self.set_mode(DishMode::Stow);
                self.set_pointing(PointingState::Ready);
            }
            band if band.starts_with("ConfigureBand") => self.configure_band(),
            "Track" => {
                if self.dish_mode() == Some(DishMode::Stow) {
                    return Err(TmcError::not_allowed(command, DishMode::Stow));
                }
                self.set_pointing(PointingState::Slew);
            }
            "TrackStop" => self.set_pointing(PointingState::Ready),
            "Scan" => {
                if self.pointing_state() != Some(PointingState::Track) {
                    return Err(TmcError::not_allowed(
                        command,
                        self.pointing_state().map_or("UNKNOWN", PointingState::as_str),
                    ));
                }
                self.set_pointing(PointingState::Scan);
            }
            "EndScan" => {
                if self.pointing_state() == Some(PointingState::Scan) {
                    self.set_pointing(PointingState::Track);
                }
            }
            other => return Err(unknown_command(self.fqdn(), other)),
        }
        Ok(CommandResponse::ok(format!("{command} completed")))
    }

    async fn write_attribute(&self, name: &str, value: AttrValue) -> TmcResult<()> {
        if name == names::DESIRED_POINTING {
            self.record_sample(&value)?;
        }
        self.attributes.set(name, value);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const LATENCY: Duration = Duration::from_millis(100);

    #[tokio::test(start_paused = true)]
    async fn band_configuration_settles_in_operate() {
        let dish = SimulatedDishMaster::new("mid_d0001/elt/master", LATENCY);
        dish.command_inout("ConfigureBand1", None).await.unwrap();
        assert_eq!(dish.dish_mode(), Some(DishMode::Config));
        tokio::time::sleep(LATENCY * 2).await;
        assert_eq!(dish.dish_mode(), Some(DishMode::Operate));
        assert_eq!(dish.attributes().op_state(), Some(OpState::On));
    }

    #[tokio::test]
    async fn first_sample_turns_slew_into_track() {
        let dish = SimulatedDishMaster::new("mid_d0001/elt/master", LATENCY);
        dish.command_inout("Track", None).await.unwrap();
        assert_eq!(dish.pointing_state(), Some(PointingState::Slew));

        dish.write_attribute(
            names::DESIRED_POINTING,
            AttrValue::DoubleArray(vec![1.0e12, 180.0, 30.0]),
        )
        .await
        .unwrap();
        assert_eq!(dish.pointing_state(), Some(PointingState::Track));
        assert_eq!(dish.desired_pointing_samples(), vec![[1.0e12, 180.0, 30.0]]);

        dish.command_inout("TrackStop", None).await.unwrap();
        assert_eq!(dish.pointing_state(), Some(PointingState::Ready));
    }

    #[tokio::test]
    async fn malformed_sample_is_rejected() {
        let dish = SimulatedDishMaster::new("mid_d0001/elt/master", LATENCY);
        let result = dish
            .write_attribute(names::DESIRED_POINTING, AttrValue::DoubleArray(vec![1.0]))
            .await;
        assert!(result.is_err());
        assert_eq!(dish.sample_count(), 0);
    }

    #[tokio::test]
    async fn stowed_dish_refuses_track() {
        let dish = SimulatedDishMaster::new("mid_d0001/elt/master", LATENCY);
        dish.command_inout("SetStowMode", None).await.unwrap();
        assert!(dish.command_inout("Track", None).await.is_err());
    }
}
