//! Simulated CSP, SDP and MCCS subarrays.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use tmc_core::device::unknown_command;
use tmc_core::payload;
use tmc_core::{
    names, AttrValue, AttributeStore, CommandResponse, DeviceServer, HealthState, ObsState,
    OpState, SubElementKind, TmcError, TmcResult,
};
use tracing::{debug, info};

use crate::faults::{Fault, FaultTable};

const STATION_LISTS: [&str; 3] = ["station_ids", "station_beam_ids", "channels"];

/// A sub-element subarray that walks the observation state machine after a
/// fixed latency.
///
/// Transitional states are published synchronously, terminal states after
/// the latency. `Abort` and power commands invalidate any transition still
/// in flight.
#[derive(Debug)]
pub struct SimulatedSubarray {
    kind: SubElementKind,
    attributes: Arc<AttributeStore>,
    latency: Duration,
    generation: Arc<Mutex<u64>>,
    faults: FaultTable,
    last_argin: Mutex<Vec<(String, Option<Value>)>>,
}

impl SimulatedSubarray {
    /// Create a subarray in `OFF` / `EMPTY` / `OK`.
    #[must_use]
    pub fn new(fqdn: &str, kind: SubElementKind, latency: Duration) -> Self {
        let attributes = AttributeStore::new(fqdn);
        attributes.set_op_state(OpState::Off);
        attributes.set_obs_state(ObsState::Empty);
        attributes.set_health_state(HealthState::Ok);
        if kind == SubElementKind::Mccs {
            attributes.set(names::ASSIGNED_RESOURCES, AttrValue::Json(json!({})));
        }
        Self {
            kind,
            attributes: Arc::new(attributes),
            latency,
            generation: Arc::new(Mutex::new(0)),
            faults: FaultTable::default(),
            last_argin: Mutex::new(Vec::new()),
        }
    }

    /// Kind of sub-element simulated.
    #[must_use]
    pub const fn kind(&self) -> SubElementKind {
        self.kind
    }

    /// Fault injection table.
    #[must_use]
    pub const fn faults(&self) -> &FaultTable {
        &self.faults
    }

    /// Arguments received, in order.
    #[must_use]
    pub fn received(&self) -> Vec<(String, Option<Value>)> {
        self.last_argin.lock().clone()
    }

    /// Last argument received for `command`.
    #[must_use]
    pub fn last_argin(&self, command: &str) -> Option<Value> {
        self.last_argin
            .lock()
            .iter()
            .rev()
            .find(|(name, _)| name == command)
            .and_then(|(_, argin)| argin.clone())
    }

    /// Overwrite the health state.
    pub fn set_health(&self, health: HealthState) {
        self.attributes.set_health_state(health);
    }

    /// Overwrite the observation state, dropping any transition in flight.
    pub fn force_obs_state(&self, state: ObsState) {
        let mut generation = self.generation.lock();
        *generation += 1;
        self.attributes.set_obs_state(state);
    }

    fn obs_state(&self) -> ObsState {
        self.attributes.obs_state().unwrap_or(ObsState::Empty)
    }

    fn require(&self, command: &str, allowed: &[ObsState]) -> TmcResult<()> {
        let op = self.attributes.op_state().unwrap_or(OpState::Unknown);
        if op != OpState::On {
            return Err(TmcError::not_allowed(command, op));
        }
        let obs = self.obs_state();
        if allowed.contains(&obs) {
            Ok(())
        } else {
            Err(TmcError::not_allowed(command, obs))
        }
    }

    /// Publish `transitional` now and `terminal` after the latency, unless a
    /// later command got there first.
    fn walk(&self, command: &str, transitional: ObsState, terminal: ObsState, after: Option<Value>) {
        let fault = self.faults.get(command);
        let generation = {
            let mut generation = self.generation.lock();
            *generation += 1;
            self.attributes.set_obs_state(transitional);
            *generation
        };

        let terminal = match fault {
            Some(Fault::Stall) => {
                debug!(fqdn = %self.attributes.owner(), command, "stalling");
                return;
            }
            Some(Fault::ObsFault) => ObsState::Fault,
            _ => terminal,
        };

        let attributes = self.attributes.clone();
        let current = self.generation.clone();
        let latency = self.latency;
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            let guard = current.lock();
            if *guard != generation {
                return;
            }
            if let Some(resources) = after {
                attributes.set(names::ASSIGNED_RESOURCES, AttrValue::Json(resources));
            }
            attributes.set_obs_state(terminal);
            drop(guard);
        });
    }

    fn set_immediately(&self, state: ObsState) {
        let mut generation = self.generation.lock();
        *generation += 1;
        self.attributes.set_obs_state(state);
    }

    /// Held resources grown by an assignment. Only MCCS reports them.
    fn resources_after_assign(&self, argin: Option<&Value>) -> Option<Value> {
        if self.kind != SubElementKind::Mccs {
            return None;
        }
        let mut held = self
            .attributes
            .get(names::ASSIGNED_RESOURCES)
            .and_then(|v| v.to_json())
            .unwrap_or_else(|| json!({}));
        if let Some(incoming) = argin.map(|v| v.get("mccs").unwrap_or(v)) {
            payload::merge_lists(&mut held, incoming, &STATION_LISTS);
        }
        Some(held)
    }

    fn publish_configure_outputs(&self) {
        let fqdn = self.attributes.owner().to_owned();
        match self.kind {
            SubElementKind::Csp => {
                self.attributes.set(
                    names::CBF_OUTPUT_LINK,
                    AttrValue::Json(json!({"scanID": 0, "fsp": [], "source": fqdn})),
                );
            }
            SubElementKind::Sdp => {
                self.attributes.set(
                    names::RECEIVE_ADDRESSES,
                    AttrValue::Json(json!({"science_A": {"host": [[0, "192.168.0.1"]]}})),
                );
            }
            SubElementKind::Mccs | SubElementKind::Dish => {}
        }
    }
}

#[async_trait]
impl DeviceServer for SimulatedSubarray {
    fn fqdn(&self) -> &str {
        self.attributes.owner()
    }

    fn attributes(&self) -> &AttributeStore {
        &self.attributes
    }

    async fn command_inout(&self, command: &str, argin: Option<Value>) -> TmcResult<CommandResponse> {
        use ObsState::{
            Aborted, Aborting, Configuring, Empty, Fault as ObsFault, Idle, Ready, Resetting,
            Resourcing, Restarting, Scanning,
        };

        self.last_argin
            .lock()
            .push((command.to_owned(), argin.clone()));

        if self.faults.get(command) == Some(Fault::Reject) {
            return Err(TmcError::DeviceFailed {
                fqdn: self.fqdn().to_owned(),
                command: command.to_owned(),
                reason: "injected fault".to_owned(),
            });
        }

        match command {
            "On" => {
                self.attributes.set_op_state(OpState::On);
                info!(fqdn = %self.fqdn(), "simulated subarray on");
                Ok(CommandResponse::ok("On completed"))
            }
            "Off" | "Standby" => {
                let state = if command == "Off" {
                    OpState::Off
                } else {
                    OpState::Standby
                };
                self.set_immediately(Empty);
                self.attributes.set_op_state(state);
                Ok(CommandResponse::ok(format!("{command} completed")))
            }
            "AssignResources" => {
                self.require(command, &[Empty, Idle])?;
                let resources = self.resources_after_assign(argin.as_ref());
                self.walk(command, Resourcing, Idle, resources);
                Ok(CommandResponse::started("AssignResources started"))
            }
            "ReleaseAllResources" | "ReleaseResources" => {
                self.require(command, &[Idle])?;
                let cleared = (self.kind == SubElementKind::Mccs).then(|| json!({}));
                self.walk(command, Resourcing, Empty, cleared);
                Ok(CommandResponse::started("ReleaseAllResources started"))
            }
            "Configure" => {
                self.require(command, &[Idle, Ready])?;
                self.publish_configure_outputs();
                self.walk(command, Configuring, Ready, None);
                Ok(CommandResponse::started("Configure started"))
            }
            "Scan" => {
                self.require(command, &[Ready])?;
                self.set_immediately(Scanning);
                Ok(CommandResponse::ok("Scan started"))
            }
            "EndScan" => {
                self.require(command, &[Scanning])?;
                self.set_immediately(Ready);
                Ok(CommandResponse::ok("EndScan completed"))
            }
            "End" => {
                self.require(command, &[Ready])?;
                self.set_immediately(Idle);
                Ok(CommandResponse::ok("End completed"))
            }
            "Abort" => {
                self.require(command, &[Idle, Configuring, Ready, Scanning, Resetting])?;
                self.walk(command, Aborting, Aborted, None);
                Ok(CommandResponse::started("Abort started"))
            }
            "ObsReset" => {
                self.require(command, &[Aborted, ObsFault])?;
                self.walk(command, Resetting, Idle, None);
                Ok(CommandResponse::started("ObsReset started"))
            }
            "Restart" => {
                self.require(command, &[Aborted, ObsFault])?;
                let cleared = (self.kind == SubElementKind::Mccs).then(|| json!({}));
                self.walk(command, Restarting, Empty, cleared);
                Ok(CommandResponse::started("Restart started"))
            }
            other => Err(unknown_command(self.fqdn(), other)),
        }
    }
}
