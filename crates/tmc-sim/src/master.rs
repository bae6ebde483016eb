//! Simulated sub-element master.

use async_trait::async_trait;
use serde_json::Value;
use tmc_core::device::unknown_command;
use tmc_core::{
    AttributeStore, CommandResponse, DeviceServer, HealthState, OpState, TmcError, TmcResult,
};
use tracing::info;

use crate::faults::{Fault, FaultTable};

/// A sub-element master that only handles power commands.
#[derive(Debug)]
pub struct SimulatedMaster {
    attributes: AttributeStore,
    faults: FaultTable,
}

impl SimulatedMaster {
    /// Create a master in `STANDBY` / `OK`.
    #[must_use]
    pub fn new(fqdn: &str) -> Self {
        let attributes = AttributeStore::new(fqdn);
        attributes.set_op_state(OpState::Standby);
        attributes.set_health_state(HealthState::Ok);
        Self {
            attributes,
            faults: FaultTable::default(),
        }
    }

    /// Fault injection table.
    #[must_use]
    pub const fn faults(&self) -> &FaultTable {
        &self.faults
    }

    /// Overwrite the health state.
    pub fn set_health(&self, health: HealthState) {
        self.attributes.set_health_state(health);
    }
}

#[async_trait]
impl DeviceServer for SimulatedMaster {
    fn fqdn(&self) -> &str {
        self.attributes.owner()
    }

    fn attributes(&self) -> &AttributeStore {
        &self.attributes
    }

    async fn command_inout(&self, command: &str, _argin: Option<Value>) -> TmcResult<CommandResponse> {
        let target = match command {
            "On" => OpState::On,
            "Off" => OpState::Off,
            "Standby" => OpState::Standby,
            other => return Err(unknown_command(self.fqdn(), other)),
        };
        if self.faults.get(command) == Some(Fault::Reject) {
            return Err(TmcError::DeviceFailed {
                fqdn: self.fqdn().to_owned(),
                command: command.to_owned(),
                reason: "injected fault".to_owned(),
            });
        }

        self.attributes.set_op_state(target);
        info!(fqdn = %self.fqdn(), state = %target, "simulated master power change");
        Ok(CommandResponse::ok(format!("{command} completed")))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn power_commands_change_state() {
        let master = SimulatedMaster::new("sim/master/0");
        assert_eq!(master.attributes().op_state(), Some(OpState::Standby));

        master.command_inout("On", None).await.unwrap();
        assert_eq!(master.attributes().op_state(), Some(OpState::On));
        master.command_inout("Off", None).await.unwrap();
        assert_eq!(master.attributes().op_state(), Some(OpState::Off));
        assert!(master.command_inout("Scan", None).await.is_err());
    }

    #[tokio::test]
    async fn rejected_command_keeps_state() {
        let master = SimulatedMaster::new("sim/master/0");
        master.faults().arm("On", Fault::Reject);
        assert!(master.command_inout("On", None).await.is_err());
        assert_eq!(master.attributes().op_state(), Some(OpState::Standby));
    }
}
