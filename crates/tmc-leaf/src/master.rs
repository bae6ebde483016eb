//! Sub-element master leaf node.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tmc_core::device::unknown_command;
use tmc_core::transport::properties;
use tmc_core::{
    names, AttributeStore, CommandResponse, DeviceServer, SubElementKind, TmcResult, Transport,
};
use tracing::{info, instrument};

use crate::context::LeafContext;

/// Property naming the proxied master for `kind`.
#[must_use]
pub const fn master_property(kind: SubElementKind) -> &'static str {
    match kind {
        SubElementKind::Csp => "CspMasterFQDN",
        SubElementKind::Sdp => "SdpMasterFQDN",
        SubElementKind::Mccs => "MccsMasterFQDN",
        SubElementKind::Dish => "DishMasterFQDN",
    }
}

/// Forwards power commands to a sub-element master and mirrors its `state`
/// and `healthState`.
#[derive(Debug)]
pub struct MasterLeaf {
    kind: SubElementKind,
    ctx: LeafContext,
}

impl MasterLeaf {
    /// Read the master fqdn property and start mirroring.
    ///
    /// # Errors
    ///
    /// Returns `Config` when the property is missing, or the subscription
    /// error.
    pub async fn start(
        fqdn: &str,
        kind: SubElementKind,
        transport: Arc<dyn Transport>,
    ) -> TmcResult<Arc<Self>> {
        let child = properties::string(transport.as_ref(), fqdn, master_property(kind)).await?;
        let ctx = LeafContext::new(fqdn, child, transport);
        ctx.mirror(&[names::STATE, names::HEALTH_STATE]).await?;
        info!(fqdn, kind = %kind, master = %ctx.child(), "master leaf started");
        Ok(Arc::new(Self { kind, ctx }))
    }

    /// Kind of master proxied.
    #[must_use]
    pub const fn kind(&self) -> SubElementKind {
        self.kind
    }

    /// Fqdn of the proxied master.
    #[must_use]
    pub fn master(&self) -> &str {
        self.ctx.child()
    }
}

#[async_trait]
impl DeviceServer for MasterLeaf {
    fn fqdn(&self) -> &str {
        self.ctx.fqdn()
    }

    fn attributes(&self) -> &AttributeStore {
        self.ctx.attributes()
    }

    #[instrument(skip(self, argin), fields(fqdn = %self.ctx.fqdn()))]
    async fn command_inout(&self, command: &str, argin: Option<Value>) -> TmcResult<CommandResponse> {
        match command {
            "On" | "Off" | "Standby" => self.ctx.call(command, argin).await,
            other => Err(unknown_command(self.fqdn(), other)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use tmc_core::{HealthState, LocalTransport, OpState};
    use tmc_sim::SimulatedMaster;

    const LEAF: &str = "ska_mid/tm_leaf_node/csp_master";
    const MASTER: &str = "mid-csp/control/0";

    async fn setup() -> (Arc<SimulatedMaster>, Arc<MasterLeaf>) {
        let transport = LocalTransport::new();
        let master = Arc::new(SimulatedMaster::new(MASTER));
        transport.register(master.clone()).unwrap();
        transport.set_property(LEAF, "CspMasterFQDN", MASTER);
        let leaf = MasterLeaf::start(LEAF, SubElementKind::Csp, Arc::new(transport))
            .await
            .unwrap();
        (master, leaf)
    }

    #[tokio::test]
    async fn power_commands_reach_the_master() {
        let (master, leaf) = setup().await;
        assert_eq!(leaf.attributes().op_state(), Some(OpState::Standby));

        leaf.command_inout("On", None).await.unwrap();
        assert_eq!(master.attributes().op_state(), Some(OpState::On));
        assert_eq!(leaf.attributes().op_state(), Some(OpState::On));
        assert!(leaf.attributes().activity_message().unwrap().contains("On"));
    }

    #[tokio::test]
    async fn health_is_mirrored() {
        let (master, leaf) = setup().await;
        master.set_health(HealthState::Degraded);
        assert_eq!(leaf.attributes().health_state(), Some(HealthState::Degraded));
    }

    #[tokio::test]
    async fn missing_property_fails_start() {
        let transport = LocalTransport::new();
        let err = MasterLeaf::start(LEAF, SubElementKind::Sdp, Arc::new(transport))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "Config");
    }

    #[tokio::test]
    async fn unknown_command_is_refused() {
        let (_, leaf) = setup().await;
        assert!(leaf.command_inout("Scan", None).await.is_err());
    }
}
