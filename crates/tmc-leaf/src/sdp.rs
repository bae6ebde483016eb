//! SDP subarray leaf node.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tmc_core::device::unknown_command;
use tmc_core::transport::properties;
use tmc_core::{
    names, payload, AttributeStore, CommandResponse, DeviceServer, TmcResult, Transport,
};
use tracing::{info, instrument};

use crate::context::LeafContext;

/// Property naming the proxied SDP subarray.
pub const SDP_SUBARRAY_PROPERTY: &str = "SdpSubarrayFQDN";

/// Proxy for one SDP subarray. Payloads are forwarded unchanged.
#[derive(Debug)]
pub struct SdpSubarrayLeaf {
    ctx: LeafContext,
}

impl SdpSubarrayLeaf {
    /// Read the child property and start mirroring.
    ///
    /// # Errors
    ///
    /// Returns `Config` when the property is missing, or the subscription
    /// error.
    pub async fn start(fqdn: &str, transport: Arc<dyn Transport>) -> TmcResult<Arc<Self>> {
        let child = properties::string(transport.as_ref(), fqdn, SDP_SUBARRAY_PROPERTY).await?;
        let ctx = LeafContext::new(fqdn, child, transport);
        ctx.mirror(&[
            names::STATE,
            names::OBS_STATE,
            names::HEALTH_STATE,
            names::RECEIVE_ADDRESSES,
        ])
        .await?;
        info!(fqdn, sdp = %ctx.child(), "SDP subarray leaf started");
        Ok(Arc::new(Self { ctx }))
    }
}

#[async_trait]
impl DeviceServer for SdpSubarrayLeaf {
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
            "AssignResources" | "Configure" => {
                let document = payload::parse_object(argin)?;
                self.ctx.forward_observation(command, Some(document)).await
            }
            "ReleaseAllResources" | "Scan" | "EndScan" | "End" | "Abort" | "ObsReset"
            | "Restart" => self.ctx.forward_observation(command, argin).await,
            other => Err(unknown_command(self.fqdn(), other)),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use tmc_core::{LocalTransport, ObsState, SubElementKind};
    use tmc_sim::SimulatedSubarray;

    const LEAF: &str = "ska_mid/tm_leaf_node/sdp_subarray01";
    const SDP: &str = "mid-sdp/subarray/01";
    const LATENCY: Duration = Duration::from_millis(100);

    async fn setup() -> (Arc<SimulatedSubarray>, Arc<SdpSubarrayLeaf>) {
        let transport = LocalTransport::new();
        let sim = Arc::new(SimulatedSubarray::new(SDP, SubElementKind::Sdp, LATENCY));
        transport.register(sim.clone()).unwrap();
        transport.set_property(LEAF, SDP_SUBARRAY_PROPERTY, SDP);
        let leaf = SdpSubarrayLeaf::start(LEAF, Arc::new(transport)).await.unwrap();
        leaf.command_inout("On", None).await.unwrap();
        (sim, leaf)
    }

    #[tokio::test(start_paused = true)]
    async fn receive_addresses_are_mirrored_after_configure() {
        let (sim, leaf) = setup().await;
        sim.force_obs_state(ObsState::Idle);
        leaf.command_inout("Configure", Some(json!({"scan_type": "science_A"})))
            .await
            .unwrap();
        tokio::time::sleep(LATENCY * 2).await;

        assert_eq!(leaf.attributes().obs_state(), Some(ObsState::Ready));
        assert!(leaf.attributes().get(names::RECEIVE_ADDRESSES).is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn payload_is_forwarded_unchanged() {
        let (sim, leaf) = setup().await;
        let document = json!({"eb_id": "eb-001", "processing_blocks": []});
        leaf.command_inout("AssignResources", Some(Value::String(document.to_string())))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(sim.last_argin("AssignResources"), Some(document));
    }

    #[tokio::test(start_paused = true)]
    async fn end_scan_requires_scanning_child() {
        let (sim, leaf) = setup().await;
        sim.force_obs_state(ObsState::Ready);
        let err = leaf.command_inout("EndScan", None).await.unwrap_err();
        assert_eq!(err.kind(), "NotAllowedInState");
    }
}
