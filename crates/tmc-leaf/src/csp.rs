//! CSP subarray leaf node.
//!
//! Besides forwarding subarray commands, this leaf owns the delay-model
//! publisher: it captures the receptors on `AssignResources` and the target
//! and frequency slices on `Configure`, and publishes `delayModel` while the
//! CSP subarray is configuring, ready or scanning.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tmc_core::config::DelayModelConfig;
use tmc_core::device::unknown_command;
use tmc_core::{
    names, payload, AttributeStore, CommandResponse, DeviceServer, TmcResult, Transport,
};
use tmc_sky::target::radec_from_pointing;
use tmc_sky::SkyModel;
use tracing::{info, instrument};

use crate::context::LeafContext;
use crate::delay::{DelayPublisher, DelayTracking};

/// Property naming the proxied CSP subarray.
pub const CSP_SUBARRAY_PROPERTY: &str = "CspSubarrayFQDN";

/// Proxy for one CSP subarray.
#[derive(Debug)]
pub struct CspSubarrayLeaf {
    ctx: LeafContext,
    sky: Arc<dyn SkyModel>,
    delay: DelayPublisher,
}

impl CspSubarrayLeaf {
    /// Read properties, prepare the sky model and start mirroring.
    ///
    /// # Errors
    ///
    /// Returns `Config` when a property is missing or the antenna table is
    /// malformed, or the sky model or subscription error.
    pub async fn start(
        fqdn: &str,
        transport: Arc<dyn Transport>,
        sky: Arc<dyn SkyModel>,
        config: &DelayModelConfig,
    ) -> TmcResult<Arc<Self>> {
        let child =
            tmc_core::transport::properties::string(transport.as_ref(), fqdn, CSP_SUBARRAY_PROPERTY)
                .await?;
        let ctx = LeafContext::new(fqdn, child, transport);
        let table = ctx.antenna_table().await?;
        sky.download_ephemeris()?;
        let delay = DelayPublisher::new(ctx.attributes().clone(), sky.clone(), table, config)?;

        ctx.mirror(&[
            names::STATE,
            names::OBS_STATE,
            names::HEALTH_STATE,
            names::CBF_OUTPUT_LINK,
        ])
        .await?;
        info!(fqdn, csp = %ctx.child(), "CSP subarray leaf started");
        Ok(Arc::new(Self { ctx, sky, delay }))
    }

    /// The delay-model publisher.
    #[must_use]
    pub const fn delay_publisher(&self) -> &DelayPublisher {
        &self.delay
    }

    /// What the delay model is currently computed for.
    #[must_use]
    pub fn tracking(&self) -> DelayTracking {
        self.delay.tracking()
    }

    async fn assign(&self, argin: Option<Value>) -> TmcResult<CommandResponse> {
        let document = payload::parse_object(argin)?;
        let receptors = payload::require_string_list(&document, &["dish", "receptorIDList"])?;
        self.ctx.require_child_obs("AssignResources").await?;
        self.delay.update(|t| {
            t.receptors.extend(receptors);
            t.receptors.sort();
            t.receptors.dedup();
        });
        self.ctx.forward("AssignResources", Some(document));
        Ok(CommandResponse::started("AssignResources forwarded"))
    }

    async fn configure(&self, argin: Option<Value>) -> TmcResult<CommandResponse> {
        let mut document = payload::parse_object(argin)?;
        let fsids = fsids(&document)?;
        let target = match document.get("pointing") {
            Some(pointing) => Some(self.sky.to_target(&radec_from_pointing(pointing)?)?),
            None => None,
        };
        self.ctx.require_child_obs("Configure").await?;

        if let Some(object) = document.as_object_mut() {
            object.remove("pointing");
        }
        self.delay.update(|t| {
            t.target = target;
            t.fsids = fsids;
        });
        self.ctx.forward("Configure", Some(document));
        Ok(CommandResponse::started("Configure forwarded"))
    }
}

/// Frequency slice ids from `cbf.fsp[*].fspID`.
fn fsids(document: &Value) -> TmcResult<Vec<u64>> {
    match payload::lookup(document, &["cbf", "fsp"]) {
        None => Ok(Vec::new()),
        Some(_) => payload::require_array(document, &["cbf", "fsp"])?
            .iter()
            .map(|fsp| payload::require_u64(fsp, &["fspID"]))
            .collect(),
    }
}

#[async_trait]
impl DeviceServer for CspSubarrayLeaf {
    fn fqdn(&self) -> &str {
        self.ctx.fqdn()
    }

    fn attributes(&self) -> &AttributeStore {
        self.ctx.attributes()
    }

    #[instrument(skip(self, argin), fields(fqdn = %self.ctx.fqdn()))]
    async fn command_inout(&self, command: &str, argin: Option<Value>) -> TmcResult<CommandResponse> {
        match command {
            "On" => {
                let response = self.ctx.call(command, argin).await?;
                self.delay.start();
                Ok(response)
            }
            "Off" | "Standby" => {
                self.delay.stop();
                self.ctx.call(command, argin).await
            }
            "AssignResources" => self.assign(argin).await,
            "ReleaseAllResources" => {
                let response = self.ctx.forward_observation(command, argin).await?;
                self.delay.update(|t| *t = DelayTracking::default());
                Ok(response)
            }
            "Configure" => self.configure(argin).await,
            "End" | "Abort" | "Restart" => {
                let response = self.ctx.forward_observation(command, argin).await?;
                self.delay.update(|t| {
                    t.target = None;
                    t.fsids.clear();
                });
                Ok(response)
            }
            "Scan" | "EndScan" | "ObsReset" => self.ctx.forward_observation(command, argin).await,
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
    use tmc_core::config::DEFAULT_ANTENNA_TABLE;
    use tmc_core::{LocalTransport, ObsState, SubElementKind};
    use tmc_sim::SimulatedSubarray;
    use tmc_sky::{DelayModelDocument, SphericalSkyModel};

    const LEAF: &str = "ska_mid/tm_leaf_node/csp_subarray01";
    const CSP: &str = "mid-csp/subarray/01";
    const LATENCY: Duration = Duration::from_millis(100);

    async fn setup() -> (LocalTransport, Arc<SimulatedSubarray>, Arc<CspSubarrayLeaf>) {
        let transport = LocalTransport::new();
        let sim = Arc::new(SimulatedSubarray::new(CSP, SubElementKind::Csp, LATENCY));
        transport.register(sim.clone()).unwrap();
        transport.set_property(LEAF, CSP_SUBARRAY_PROPERTY, CSP);
        transport.set_property(LEAF, "AntennaTable", DEFAULT_ANTENNA_TABLE);
        let leaf = CspSubarrayLeaf::start(
            LEAF,
            Arc::new(transport.clone()),
            Arc::new(SphericalSkyModel::new()),
            &DelayModelConfig::default(),
        )
        .await
        .unwrap();
        leaf.command_inout("On", None).await.unwrap();
        (transport, sim, leaf)
    }

    fn configure_payload() -> Value {
        json!({
            "common": {"id": "sbi-001", "frequencyBand": "1"},
            "cbf": {"fsp": [{"fspID": 1}, {"fspID": 2}]},
            "pointing": {"target": {"system": "ICRS", "name": "Polaris Australis",
                                    "RA": "21:08:47.92", "dec": "-88:57:22.9"}},
        })
    }

    #[tokio::test(start_paused = true)]
    async fn configure_strips_pointing_and_captures_target() {
        let (_transport, sim, leaf) = setup().await;
        leaf.command_inout(
            "AssignResources",
            Some(json!({"subarrayID": 1, "dish": {"receptorIDList": ["0001", "0002"]}})),
        )
        .await
        .unwrap();
        tokio::time::sleep(LATENCY * 2).await;
        assert_eq!(leaf.attributes().obs_state(), Some(ObsState::Idle));

        leaf.command_inout("Configure", Some(configure_payload()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;

        let forwarded = sim.last_argin("Configure").unwrap();
        assert!(forwarded.get("pointing").is_none());
        assert_eq!(forwarded["cbf"]["fsp"][0]["fspID"], 1);

        let tracking = leaf.tracking();
        assert_eq!(tracking.receptors, vec!["0001", "0002"]);
        assert_eq!(tracking.fsids, vec![1, 2]);
        assert!(tracking.target.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn delay_model_follows_configuration() {
        let (_transport, _sim, leaf) = setup().await;
        leaf.command_inout(
            "AssignResources",
            Some(json!({"subarrayID": 1, "dish": {"receptorIDList": ["0001", "0003"]}})),
        )
        .await
        .unwrap();
        tokio::time::sleep(LATENCY * 2).await;
        leaf.command_inout("Configure", Some(configure_payload()))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(11)).await;

        let text = leaf.attributes().get(names::DELAY_MODEL).unwrap();
        let document: DelayModelDocument = serde_json::from_str(text.as_str().unwrap()).unwrap();
        let receptors: Vec<_> = document
            .delay_details
            .iter()
            .map(|d| d.receptor.as_str())
            .collect();
        assert_eq!(receptors, ["0001", "0003"]);
    }

    #[tokio::test(start_paused = true)]
    async fn assign_from_idle_grows_the_receptor_set() {
        let (_transport, _sim, leaf) = setup().await;
        leaf.command_inout(
            "AssignResources",
            Some(json!({"subarrayID": 1, "dish": {"receptorIDList": ["0002", "0001"]}})),
        )
        .await
        .unwrap();
        tokio::time::sleep(LATENCY * 2).await;
        assert_eq!(leaf.attributes().obs_state(), Some(ObsState::Idle));

        leaf.command_inout(
            "AssignResources",
            Some(json!({"subarrayID": 1, "dish": {"receptorIDList": ["0003", "0001"]}})),
        )
        .await
        .unwrap();
        tokio::time::sleep(LATENCY * 2).await;
        assert_eq!(leaf.tracking().receptors, vec!["0001", "0002", "0003"]);

        leaf.command_inout("ReleaseAllResources", None).await.unwrap();
        assert!(leaf.tracking().receptors.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn configure_needs_idle_or_ready_child() {
        let (transport, _sim, leaf) = setup().await;
        let err = leaf
            .command_inout("Configure", Some(configure_payload()))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "NotAllowedInState");
        assert!(transport
            .calls_to(CSP)
            .iter()
            .all(|call| call.command != "Configure"));
    }

    #[tokio::test(start_paused = true)]
    async fn bad_target_is_rejected() {
        let (_transport, sim, leaf) = setup().await;
        sim.force_obs_state(ObsState::Idle);
        let mut payload = configure_payload();
        payload["pointing"]["target"]["RA"] = json!("not-an-angle");
        let err = leaf.command_inout("Configure", Some(payload)).await.unwrap_err();
        assert_eq!(err.kind(), "InvalidTarget");
    }

    #[tokio::test(start_paused = true)]
    async fn off_stops_the_publisher() {
        let (_transport, _sim, leaf) = setup().await;
        assert!(leaf.delay_publisher().is_running());
        leaf.command_inout("Off", None).await.unwrap();
        assert!(!leaf.delay_publisher().is_running());
    }
}
