//! The central node device.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::future::join_all;
use serde_json::Value;
use tmc_core::aggregation::aggregate_health;
use tmc_core::device::unknown_command;
use tmc_core::events::{self, DeviceEvent, EventReceiver, EventSender};
use tmc_core::{
    names, payload, AttrValue, AttributeStore, CommandResponse, DeviceServer, HealthState,
    OpState, SubscriptionSet, TmcConfig, TmcError, TmcResult, Transport,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::layout::TelescopeLayout;
use crate::routing::{self, Claims};

#[derive(Debug)]
struct CentralState {
    op: OpState,
    subscriptions: SubscriptionSet,
    health: BTreeMap<String, Option<HealthState>>,
    claims: Claims,
}

/// Central node: telescope power sequencing, resource routing and the
/// telescope health roll-up.
pub struct CentralNode {
    layout: TelescopeLayout,
    transport: Arc<dyn Transport>,
    attributes: AttributeStore,
    events: EventSender,
    state: tokio::sync::Mutex<CentralState>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for CentralNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CentralNode")
            .field("fqdn", &self.attributes.owner())
            .field("layout", &self.layout)
            .finish_non_exhaustive()
    }
}

/// Run `(fqdn, command)` pairs concurrently. Returns one line per failure.
async fn call_each(transport: &dyn Transport, calls: &[(String, &str)]) -> Vec<String> {
    let replies = join_all(
        calls
            .iter()
            .map(|(fqdn, command)| transport.call(fqdn, command, None)),
    )
    .await;
    calls
        .iter()
        .zip(replies)
        .filter_map(|((fqdn, command), reply)| match reply {
            Ok(response) if response.is_success() => None,
            Ok(response) => Some(format!("{command} on {fqdn}: {response}")),
            Err(e) => Some(format!("{command} on {fqdn}: {e}")),
        })
        .collect()
}

impl CentralNode {
    /// Read the telescope layout and start the node in `STANDBY`.
    ///
    /// # Errors
    ///
    /// Returns `Config` when the layout properties are missing or invalid.
    pub async fn start(
        fqdn: &str,
        transport: Arc<dyn Transport>,
        config: &TmcConfig,
    ) -> TmcResult<Arc<Self>> {
        let layout = TelescopeLayout::load(transport.as_ref(), fqdn).await?;

        let attributes = AttributeStore::new(fqdn);
        attributes.set_op_state(OpState::Standby);
        attributes.set_health_state(HealthState::Unknown);
        attributes.set(
            names::TELESCOPE_HEALTH_STATE,
            AttrValue::Health(HealthState::Unknown),
        );
        attributes.set_activity("initialised");

        let health = layout
            .health_inputs()
            .into_iter()
            .map(|fqdn| (fqdn, None))
            .collect();
        let (events, receiver) = events::channel(fqdn, config.events.queue_capacity);
        let node = Arc::new(Self {
            layout,
            transport,
            attributes,
            events,
            state: tokio::sync::Mutex::new(CentralState {
                op: OpState::Standby,
                subscriptions: SubscriptionSet::new(),
                health,
                claims: Claims::default(),
            }),
            shutdown: CancellationToken::new(),
        });

        tokio::spawn(event_loop(
            Arc::downgrade(&node),
            receiver,
            node.shutdown.clone(),
        ));
        info!(
            fqdn,
            telescope = %node.layout.telescope,
            subarrays = node.layout.subarrays.len(),
            "central node started"
        );
        Ok(node)
    }

    /// The devices this node drives.
    #[must_use]
    pub const fn layout(&self) -> &TelescopeLayout {
        &self.layout
    }

    /// Number of live health subscriptions.
    pub async fn subscription_count(&self) -> usize {
        self.state.lock().await.subscriptions.len()
    }

    /// Telescope health roll-up.
    #[must_use]
    pub fn telescope_health(&self) -> HealthState {
        self.attributes
            .get(names::TELESCOPE_HEALTH_STATE)
            .and_then(|v| v.as_health())
            .unwrap_or(HealthState::Unknown)
    }

    fn require_op(&self, command: &str, state: &CentralState, allowed: &[OpState]) -> TmcResult<()> {
        if allowed.contains(&state.op) {
            Ok(())
        } else {
            Err(TmcError::not_allowed(command, state.op))
        }
    }

    async fn start_up(&self, state: &mut CentralState) -> TmcResult<CommandResponse> {
        self.require_op("StartUpTelescope", state, &[OpState::Off, OpState::Standby])?;

        let mut calls: Vec<(String, &str)> = Vec::new();
        calls.extend(self.layout.masters.iter().map(|m| (m.clone(), "On")));
        calls.extend(self.layout.subarrays.iter().map(|s| (s.clone(), "On")));
        calls.extend(
            self.layout
                .dish_leaves
                .iter()
                .map(|d| (d.clone(), "SetStandbyFPMode")),
        );
        let failures = call_each(self.transport.as_ref(), &calls).await;
        if !failures.is_empty() {
            let message = format!("StartUpTelescope failed: {}", failures.join("; "));
            warn!(fqdn = %self.attributes.owner(), failures = failures.len(), "telescope start-up failed");
            self.attributes.set_activity(message.clone());
            return Ok(CommandResponse::failed(message));
        }

        for fqdn in self.layout.health_inputs() {
            if let Err(e) = state
                .subscriptions
                .subscribe(
                    self.transport.as_ref(),
                    &fqdn,
                    names::HEALTH_STATE,
                    self.events.attribute_callback(),
                )
                .await
            {
                state
                    .subscriptions
                    .unsubscribe_all(self.transport.as_ref())
                    .await;
                return Err(e);
            }
        }

        state.op = OpState::On;
        self.attributes.set_op_state(OpState::On);
        self.attributes.set_activity("StartUpTelescope completed");
        info!(fqdn = %self.attributes.owner(), "telescope on");
        Ok(CommandResponse::ok("StartUpTelescope completed"))
    }

    async fn stand_by(&self, state: &mut CentralState) -> TmcResult<CommandResponse> {
        self.require_op("StandByTelescope", state, &[OpState::On])?;

        let mut calls: Vec<(String, &str)> = Vec::new();
        calls.extend(
            self.layout
                .dish_leaves
                .iter()
                .map(|d| (d.clone(), "SetStandbyLPMode")),
        );
        calls.extend(self.layout.subarrays.iter().map(|s| (s.clone(), "Off")));
        calls.extend(self.layout.masters.iter().map(|m| (m.clone(), "Standby")));
        let failures = call_each(self.transport.as_ref(), &calls).await;

        let cancelled = state
            .subscriptions
            .unsubscribe_all(self.transport.as_ref())
            .await;
        for health in state.health.values_mut() {
            *health = None;
        }
        state.op = OpState::Standby;
        self.attributes.set_op_state(OpState::Standby);
        self.refresh_health(state);
        info!(fqdn = %self.attributes.owner(), cancelled, "telescope in standby");

        if failures.is_empty() {
            self.attributes.set_activity("StandByTelescope completed");
            Ok(CommandResponse::ok("StandByTelescope completed"))
        } else {
            let message = format!("StandByTelescope failed: {}", failures.join("; "));
            self.attributes.set_activity(message.clone());
            Ok(CommandResponse::failed(message))
        }
    }

    async fn assign(
        &self,
        state: &mut CentralState,
        argin: Option<Value>,
    ) -> TmcResult<CommandResponse> {
        self.require_op("AssignResources", state, &[OpState::On])?;
        let document = payload::parse_object(argin)?;
        let id = routing::assign_target(self.layout.telescope, &document)?;
        let subarray = self.layout.subarray(id)?;

        let requested = routing::requested_resources(self.layout.telescope, &document)?;
        routing::check_unallocated(
            self.transport.as_ref(),
            self.layout.telescope,
            &self.layout.subarrays,
            &mut state.claims,
            &requested,
        )
        .await?;

        let response = self
            .transport
            .call(subarray, "AssignResources", Some(document))
            .await?;
        if response.is_success() {
            state.claims.claim(subarray, &requested);
        }
        self.attributes
            .set_activity(format!("AssignResources routed to {subarray}: {response}"));
        info!(fqdn = %self.attributes.owner(), subarray, resources = ?requested, "resources routed");
        Ok(response)
    }

    async fn release(
        &self,
        state: &CentralState,
        argin: Option<Value>,
    ) -> TmcResult<CommandResponse> {
        self.require_op("ReleaseResources", state, &[OpState::On])?;
        let document = payload::parse_object(argin)?;
        let id = routing::release_target(&document)?;
        let subarray = self.layout.subarray(id)?;
        let response = self
            .transport
            .call(subarray, "ReleaseAllResources", None)
            .await?;
        self.attributes
            .set_activity(format!("ReleaseResources routed to {subarray}: {response}"));
        Ok(response)
    }

    fn refresh_health(&self, state: &CentralState) {
        let health = aggregate_health(state.health.values().copied());
        self.attributes.set_health_state(health);
        if self
            .attributes
            .set(names::TELESCOPE_HEALTH_STATE, AttrValue::Health(health))
        {
            info!(fqdn = %self.attributes.owner(), %health, "telescope health changed");
        }
    }

    async fn on_event(&self, event: DeviceEvent) {
        let DeviceEvent::Attribute(event) = event else {
            return;
        };
        let mut state = self.state.lock().await;
        if state.op != OpState::On && state.subscriptions.is_empty() {
            return;
        }
        let health = match event.value {
            Ok(value) => value.as_health(),
            Err(reason) => {
                warn!(child = %event.fqdn, %reason, "child health unavailable");
                None
            }
        };
        if let Some(slot) = state.health.get_mut(&event.fqdn) {
            *slot = health;
            debug!(child = %event.fqdn, ?health, "child health");
            self.refresh_health(&state);
        }
    }
}

async fn event_loop(node: Weak<CentralNode>, mut receiver: EventReceiver, shutdown: CancellationToken) {
    loop {
        let queued = tokio::select! {
            biased;
            () = shutdown.cancelled() => break,
            queued = receiver.recv() => match queued {
                Some(queued) => queued,
                None => break,
            },
        };
        let Some(node) = node.upgrade() else {
            break;
        };
        node.on_event(queued.event).await;
    }
    debug!("central event loop stopped");
}

impl Drop for CentralNode {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl DeviceServer for CentralNode {
    fn fqdn(&self) -> &str {
        self.attributes.owner()
    }

    fn attributes(&self) -> &AttributeStore {
        &self.attributes
    }

    #[instrument(skip(self, argin), fields(fqdn = %self.attributes.owner()))]
    async fn command_inout(&self, command: &str, argin: Option<Value>) -> TmcResult<CommandResponse> {
        let mut state = self.state.lock().await;
        let result = match command {
            "StartUpTelescope" => self.start_up(&mut state).await,
            "StandByTelescope" => self.stand_by(&mut state).await,
            "AssignResources" => self.assign(&mut state, argin).await,
            "ReleaseResources" => self.release(&state, argin).await,
            other => return Err(unknown_command(self.fqdn(), other)),
        };
        if let Err(e) = &result {
            warn!(fqdn = %self.attributes.owner(), command, error = %e, "command rejected");
            self.attributes.set_activity(format!("{command} rejected: {e}"));
        }
        result
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::layout::{
        CSP_MASTER_LEAF_PROPERTY, DISH_LEAF_NODES_PROPERTY, SDP_MASTER_LEAF_PROPERTY,
        SUBARRAY_NODES_PROPERTY,
    };
    use serde_json::json;
    use std::time::Duration;
    use tmc_core::{DishMode, LocalTransport, ObsState, ResultCode, SubElementKind};
    use tmc_sim::{Fault, SimulatedDishMaster, SimulatedMaster, SimulatedSubarray};

    const CENTRAL: &str = "ska_mid/tm_central/central_node";
    const CSP_MASTER: &str = "ska_mid/tm_leaf_node/csp_master";
    const SDP_MASTER: &str = "ska_mid/tm_leaf_node/sdp_master";
    const SUBARRAY_1: &str = "ska_mid/tm_subarray_node/1";
    const SUBARRAY_2: &str = "ska_mid/tm_subarray_node/2";
    const DISH: &str = "ska_mid/tm_leaf_node/d0001";
    const LATENCY: Duration = Duration::from_millis(100);

    struct Rig {
        transport: LocalTransport,
        central: Arc<CentralNode>,
        csp_master: Arc<SimulatedMaster>,
        subarrays: [Arc<SimulatedSubarray>; 2],
        dish: Arc<SimulatedDishMaster>,
    }

    async fn rig() -> Rig {
        let transport = LocalTransport::new();
        let csp_master = Arc::new(SimulatedMaster::new(CSP_MASTER));
        transport.register(csp_master.clone()).unwrap();
        transport
            .register(Arc::new(SimulatedMaster::new(SDP_MASTER)))
            .unwrap();
        let subarrays = [SUBARRAY_1, SUBARRAY_2].map(|fqdn| {
            let sim = Arc::new(SimulatedSubarray::new(fqdn, SubElementKind::Csp, LATENCY));
            sim.attributes()
                .set(names::RECEPTOR_ID_LIST, AttrValue::StringArray(Vec::new()));
            transport.register(sim.clone()).unwrap();
            sim
        });
        let dish = Arc::new(SimulatedDishMaster::new(DISH, LATENCY));
        transport.register(dish.clone()).unwrap();

        transport.set_property(CENTRAL, CSP_MASTER_LEAF_PROPERTY, CSP_MASTER);
        transport.set_property(CENTRAL, SDP_MASTER_LEAF_PROPERTY, SDP_MASTER);
        transport.set_property(CENTRAL, SUBARRAY_NODES_PROPERTY, json!([SUBARRAY_1, SUBARRAY_2]));
        transport.set_property(CENTRAL, DISH_LEAF_NODES_PROPERTY, json!([DISH]));

        let central = CentralNode::start(CENTRAL, Arc::new(transport.clone()), &TmcConfig::default())
            .await
            .unwrap();
        Rig {
            transport,
            central,
            csp_master,
            subarrays,
            dish,
        }
    }

    fn assign(subarray: u64, receptors: &[&str]) -> Option<Value> {
        Some(json!({"subarrayID": subarray, "dish": {"receptorIDList": receptors}}))
    }

    #[tokio::test(start_paused = true)]
    async fn start_up_powers_the_telescope() {
        let t = rig().await;
        let reply = t.central.command_inout("StartUpTelescope", None).await.unwrap();
        assert_eq!(reply.result_code, ResultCode::Ok);
        assert_eq!(t.central.attributes().op_state(), Some(OpState::On));
        assert_eq!(t.csp_master.attributes().op_state(), Some(OpState::On));
        assert!(t
            .subarrays
            .iter()
            .all(|s| s.attributes().op_state() == Some(OpState::On)));
        assert_eq!(t.dish.dish_mode(), Some(DishMode::StandbyFp));
        assert_eq!(t.central.subscription_count().await, 4);

        tokio::time::sleep(LATENCY).await;
        assert_eq!(t.central.telescope_health(), HealthState::Ok);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_start_up_lists_children() {
        let t = rig().await;
        t.csp_master.faults().arm("On", Fault::Reject);
        let reply = t.central.command_inout("StartUpTelescope", None).await.unwrap();
        assert_eq!(reply.result_code, ResultCode::Failed);
        assert!(reply.message.contains(CSP_MASTER));
        assert_eq!(t.central.attributes().op_state(), Some(OpState::Standby));
        assert_eq!(t.central.subscription_count().await, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn stand_by_unsubscribes() {
        let t = rig().await;
        t.central.command_inout("StartUpTelescope", None).await.unwrap();
        let reply = t.central.command_inout("StandByTelescope", None).await.unwrap();
        assert_eq!(reply.result_code, ResultCode::Ok);
        assert_eq!(t.central.subscription_count().await, 0);
        assert_eq!(t.transport.subscription_count(), 0);
        assert_eq!(t.csp_master.attributes().op_state(), Some(OpState::Standby));
        assert_eq!(t.dish.dish_mode(), Some(DishMode::StandbyLp));
        assert_eq!(t.subarrays[0].attributes().op_state(), Some(OpState::Off));
    }

    #[tokio::test(start_paused = true)]
    async fn telescope_health_is_the_worst_child() {
        let t = rig().await;
        t.central.command_inout("StartUpTelescope", None).await.unwrap();
        tokio::time::sleep(LATENCY).await;
        t.subarrays[1].set_health(HealthState::Degraded);
        tokio::time::sleep(LATENCY).await;
        assert_eq!(t.central.telescope_health(), HealthState::Degraded);
        t.csp_master.set_health(HealthState::Failed);
        tokio::time::sleep(LATENCY).await;
        assert_eq!(t.central.telescope_health(), HealthState::Failed);
    }

    #[tokio::test(start_paused = true)]
    async fn assign_routes_by_subarray_id() {
        let t = rig().await;
        t.central.command_inout("StartUpTelescope", None).await.unwrap();
        let reply = t
            .central
            .command_inout("AssignResources", assign(2, &["0001"]))
            .await
            .unwrap();
        assert_eq!(reply.result_code, ResultCode::Started);
        assert!(t.subarrays[0].last_argin("AssignResources").is_none());
        assert_eq!(
            t.subarrays[1].last_argin("AssignResources").unwrap()["dish"]["receptorIDList"],
            json!(["0001"])
        );
    }

    #[tokio::test(start_paused = true)]
    async fn receptor_held_elsewhere_is_a_duplicate() {
        let t = rig().await;
        t.central.command_inout("StartUpTelescope", None).await.unwrap();
        t.subarrays[0].attributes().set(
            names::RECEPTOR_ID_LIST,
            AttrValue::StringArray(vec!["0001".into()]),
        );

        let err = t
            .central
            .command_inout("AssignResources", assign(2, &["0002", "0001"]))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TmcError::DuplicateResource {
                ids: vec!["0001".into()]
            }
        );
        assert!(t.subarrays[1].last_argin("AssignResources").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_assignment_blocks_the_receptor() {
        let t = rig().await;
        t.central.command_inout("StartUpTelescope", None).await.unwrap();
        t.subarrays[0].faults().arm("AssignResources", Fault::Stall);
        t.central
            .command_inout("AssignResources", assign(1, &["0001"]))
            .await
            .unwrap();
        assert_eq!(
            t.subarrays[0].attributes().obs_state(),
            Some(ObsState::Resourcing)
        );

        let err = t
            .central
            .command_inout("AssignResources", assign(2, &["0001"]))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "DuplicateResource");
    }

    #[tokio::test(start_paused = true)]
    async fn release_routes_to_the_subarray() {
        let t = rig().await;
        t.central.command_inout("StartUpTelescope", None).await.unwrap();
        let err = t
            .central
            .command_inout("ReleaseResources", Some(json!({"subarray_id": 1, "release_all": false})))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "NotImplemented");

        t.subarrays[0].force_obs_state(ObsState::Idle);
        let reply = t
            .central
            .command_inout("ReleaseResources", Some(json!({"subarray_id": 1, "release_all": true})))
            .await
            .unwrap();
        assert_eq!(reply.result_code, ResultCode::Started);
        assert!(t
            .transport
            .calls_to(SUBARRAY_1)
            .iter()
            .any(|c| c.command == "ReleaseAllResources"));
    }

    #[tokio::test(start_paused = true)]
    async fn resource_commands_need_the_telescope_on() {
        let t = rig().await;
        let err = t
            .central
            .command_inout("AssignResources", assign(1, &["0001"]))
            .await
            .unwrap_err();
        assert_eq!(err.result_code(), ResultCode::NotAllowed);
        let err = t
            .central
            .command_inout("AssignResources", assign(3, &["0001"]))
            .await;
        assert!(err.is_err());
    }
}
