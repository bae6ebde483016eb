//! MCCS subarray leaf node.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tmc_core::device::unknown_command;
use tmc_core::transport::properties;
use tmc_core::{
    clock, names, payload, AttributeStore, CommandResponse, DeviceServer, TmcResult, Transport,
};
use tmc_sky::{Antenna, SkyModel};
use tracing::{debug, info, instrument};

use crate::context::{position_property, LeafContext};
use crate::translate;

/// Property naming the proxied MCCS subarray.
pub const MCCS_SUBARRAY_PROPERTY: &str = "MccsSubarrayFQDN";

/// Property holding the station array reference as `lat, lon, alt`.
pub const STATION_REFERENCE_PROPERTY: &str = "StationReferencePosition";

/// Proxy for one MCCS subarray. Translates `Configure` and mirrors
/// `assigned_resources`.
#[derive(Debug)]
pub struct MccsSubarrayLeaf {
    ctx: LeafContext,
    sky: Arc<dyn SkyModel>,
    station: Antenna,
}

impl MccsSubarrayLeaf {
    /// Read properties and start mirroring.
    ///
    /// # Errors
    ///
    /// Returns `Config` when a property is missing or malformed, or the
    /// subscription error.
    pub async fn start(
        fqdn: &str,
        transport: Arc<dyn Transport>,
        sky: Arc<dyn SkyModel>,
    ) -> TmcResult<Arc<Self>> {
        let child = properties::string(transport.as_ref(), fqdn, MCCS_SUBARRAY_PROPERTY).await?;
        let ctx = LeafContext::new(fqdn, child, transport);
        let station = Antenna::at(
            "station-reference",
            position_property(&ctx, STATION_REFERENCE_PROPERTY).await?,
        );
        ctx.mirror(&[
            names::STATE,
            names::OBS_STATE,
            names::HEALTH_STATE,
            names::ASSIGNED_RESOURCES,
        ])
        .await?;
        info!(fqdn, mccs = %ctx.child(), "MCCS subarray leaf started");
        Ok(Arc::new(Self { ctx, sky, station }))
    }

    async fn configure(&self, argin: Option<Value>) -> TmcResult<CommandResponse> {
        let document = payload::parse_object(argin)?;
        let translated =
            translate::mccs_configure(&document, self.sky.as_ref(), &self.station, clock::now())?;
        debug!(fqdn = %self.ctx.fqdn(), "translated MCCS configuration");
        self.ctx
            .forward_observation("Configure", Some(translated))
            .await
    }
}

#[async_trait]
impl DeviceServer for MccsSubarrayLeaf {
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
            "AssignResources" => {
                let document = payload::parse_object(argin)?;
                self.ctx.forward_observation(command, Some(document)).await
            }
            "Configure" => self.configure(argin).await,
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
    use tmc_sky::SphericalSkyModel;

    const LEAF: &str = "ska_low/tm_leaf_node/mccs_subarray01";
    const MCCS: &str = "low-mccs/subarray/01";
    const LATENCY: Duration = Duration::from_millis(100);

    async fn setup() -> (Arc<SimulatedSubarray>, Arc<MccsSubarrayLeaf>) {
        let transport = LocalTransport::new();
        let sim = Arc::new(SimulatedSubarray::new(MCCS, SubElementKind::Mccs, LATENCY));
        transport.register(sim.clone()).unwrap();
        transport.set_property(LEAF, MCCS_SUBARRAY_PROPERTY, MCCS);
        transport.set_property(LEAF, STATION_REFERENCE_PROPERTY, "-26.8247, 116.7644, 377.0");
        let leaf = MccsSubarrayLeaf::start(
            LEAF,
            Arc::new(transport),
            Arc::new(SphericalSkyModel::new()),
        )
        .await
        .unwrap();
        leaf.command_inout("On", None).await.unwrap();
        (sim, leaf)
    }

    #[tokio::test(start_paused = true)]
    async fn assigned_resources_are_mirrored() {
        let (_sim, leaf) = setup().await;
        let resources = json!({"subarray_id": 1, "station_ids": [1, 2],
                               "channels": [[0, 48, 0, 1]], "station_beam_ids": [1]});
        leaf.command_inout("AssignResources", Some(resources.clone()))
            .await
            .unwrap();
        tokio::time::sleep(LATENCY * 2).await;

        assert_eq!(leaf.attributes().obs_state(), Some(ObsState::Idle));
        let mirrored = leaf.attributes().get(names::ASSIGNED_RESOURCES).unwrap();
        assert_eq!(mirrored.to_json(), Some(resources));
    }

    #[tokio::test(start_paused = true)]
    async fn configure_is_translated_before_forwarding() {
        let (sim, leaf) = setup().await;
        sim.force_obs_state(ObsState::Idle);
        let document = json!({
            "stations": [{"station_id": 1}, {"station_id": 2}],
            "station_beam_pointings": [{
                "station_beam_id": 1,
                "target": {"system": "HORIZON", "name": "DriftScan", "Az": 180.0, "El": 45.0},
                "update_rate": 0.0,
                "channels": [[0, 8, 1, 1]],
            }],
        });
        leaf.command_inout("Configure", Some(document)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        let forwarded = sim.last_argin("Configure").unwrap();
        assert!(forwarded.get("station_beam_pointings").is_none());
        assert_eq!(forwarded["station_beams"][0]["station_id"], json!([1, 2]));
        assert_eq!(forwarded["station_beams"][0]["sky_coordinates"][3], 45.0);
    }

    #[tokio::test]
    async fn malformed_station_reference_fails_start() {
        let transport = LocalTransport::new();
        transport.set_property(LEAF, MCCS_SUBARRAY_PROPERTY, MCCS);
        transport.set_property(LEAF, STATION_REFERENCE_PROPERTY, "-26.8, 116.7");
        let err = MccsSubarrayLeaf::start(
            LEAF,
            Arc::new(transport),
            Arc::new(SphericalSkyModel::new()),
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "Config");
    }
}
