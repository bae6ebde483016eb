//! Shared fixture for the end-to-end tests.

#![allow(dead_code, clippy::unwrap_used)]

use std::ops::Deref;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tmc_core::{CommandResponse, DeviceServer, ObsState, Telescope, TmcConfig, TmcResult};
use tmc_server::Deployment;
use tmc_sky::SphericalSkyModel;
use tmc_subarray::SubarrayNode;

/// Transition latency of every simulated sub-element.
pub const LATENCY: Duration = Duration::from_millis(100);

/// Step used when polling for a state.
const POLL: Duration = Duration::from_millis(10);

/// A complete telescope on simulated sub-elements.
pub struct TestTelescope {
    deployment: Deployment,
}

impl Deref for TestTelescope {
    type Target = Deployment;

    fn deref(&self) -> &Deployment {
        &self.deployment
    }
}

impl TestTelescope {
    /// Mid telescope with two subarrays and four dishes.
    pub async fn mid() -> Self {
        let mut config = TmcConfig::default();
        config.telescope.kind = Telescope::Mid;
        config.telescope.subarrays = 2;
        Self::with_config(config).await
    }

    /// Low telescope with one subarray.
    pub async fn low() -> Self {
        Self::low_with_subarrays(1).await
    }

    /// Low telescope with `subarrays` subarrays.
    pub async fn low_with_subarrays(subarrays: u32) -> Self {
        let mut config = TmcConfig::default();
        config.telescope.kind = Telescope::Low;
        config.telescope.subarrays = subarrays;
        Self::with_config(config).await
    }

    pub async fn with_config(mut config: TmcConfig) -> Self {
        config.simulation.transition_latency_ms = LATENCY.as_millis().try_into().unwrap();
        let deployment = Deployment::build(&config, Arc::new(SphericalSkyModel::new()))
            .await
            .unwrap();
        Self { deployment }
    }

    /// Subarray node `id`.
    pub fn node(&self, id: u32) -> &Arc<SubarrayNode> {
        self.deployment.subarray(id).unwrap()
    }

    /// Run `StartUpTelescope` and let the subscriptions settle.
    pub async fn start_up(&self) {
        let reply = self
            .central
            .command_inout("StartUpTelescope", None)
            .await
            .unwrap();
        assert!(reply.is_success(), "{reply}");
        tokio::time::sleep(LATENCY).await;
    }

    /// Invoke `command` on subarray node `id`.
    pub async fn command(
        &self,
        id: u32,
        command: &str,
        argin: Option<Value>,
    ) -> TmcResult<CommandResponse> {
        self.node(id).command_inout(command, argin).await
    }

    /// Poll subarray `id` until it reports `expected` or `within` elapses.
    pub async fn reaches(&self, id: u32, expected: ObsState, within: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + within;
        loop {
            if self.node(id).obs_state() == expected {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(POLL).await;
        }
    }

    /// Assign `receptors` to subarray `id` through the central node and wait
    /// for `IDLE`.
    pub async fn assign_mid(&self, id: u32, receptors: &[&str]) {
        let reply = self
            .central
            .command_inout("AssignResources", Some(mid_assign(id, receptors)))
            .await
            .unwrap();
        assert!(reply.is_success(), "{reply}");
        assert!(
            self.reaches(id, ObsState::Idle, LATENCY * 5).await,
            "subarray {id} stuck in {}",
            self.node(id).obs_state()
        );
    }

    /// Commands the transport dispatched to `fqdn`, by name.
    pub fn commands_to(&self, fqdn: &str) -> Vec<String> {
        self.transport()
            .calls_to(fqdn)
            .into_iter()
            .map(|call| call.command)
            .collect()
    }
}

/// Mid `AssignResources` document.
pub fn mid_assign(id: u32, receptors: &[&str]) -> Value {
    json!({"subarrayID": id, "dish": {"receptorIDList": receptors}})
}

/// Mid `Configure` document tracking a circumpolar source.
pub fn mid_configure() -> Value {
    json!({
        "interface": "https://schema.skao.int/ska-tmc-configure/2.0",
        "common": {"id": "sbi-mvp01-20200325-00001-science_A", "frequencyBand": "1"},
        "pointing": {"target": {"system": "ICRS", "name": "Polaris Australis",
                                "RA": "21:08:47.92", "dec": "-88:57:22.9"}},
        "dish": {"receiverBand": "1"},
        "cbf": {"fsp": [{"fspID": 1, "functionMode": "CORR", "frequencySliceID": 1}]},
        "sdp": {"scan_type": "science_A"},
    })
}

/// Low `AssignResources` document for subarray `id` with stations 1 and 2
/// and beam 1.
pub fn low_assign(id: u32) -> Value {
    low_assign_with(id, &[1, 2], &[1])
}

/// Low `AssignResources` document for subarray `id`.
pub fn low_assign_with(id: u32, stations: &[u32], beams: &[u32]) -> Value {
    json!({
        "mccs": {
            "subarray_id": id,
            "station_ids": stations,
            "channels": [[0, 48, 1, 1]],
            "station_beam_ids": beams,
        }
    })
}

/// Low `Configure` document with a drift-scan beam.
pub fn low_configure() -> Value {
    json!({
        "stations": [{"station_id": 1}, {"station_id": 2}],
        "station_beam_pointings": [{
            "station_beam_id": 1,
            "target": {"system": "HORIZON", "name": "DriftScan", "Az": 180.0, "El": 45.0},
            "update_rate": 0.0,
            "channels": [1, 2, 3, 4, 5, 6, 7, 8],
        }],
    })
}
