//! The subarray node device.
//!
//! Commands are admitted and fanned out under the state lock. Children
//! answer through change events and completions, which the event loop feeds
//! back into the same state; a composite command resolves once the children
//! it was dispatched to report the expected terminal state.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tmc_core::aggregation::{aggregate_health, aggregate_obs, ChildView, ObsAggregate};
use tmc_core::device::unknown_command;
use tmc_core::events::{self, EventSender, TimerKind};
use tmc_core::obs_state::Started;
use tmc_core::{
    names, payload, AttrValue, AttributeStore, CommandResponse, DeviceServer, HealthState,
    ObsCommand, ObsState, ObsStateMachine, OpState, PointingState, SubElementKind,
    SubscriptionSet, Telescope, TmcConfig, TmcError, TmcResult, Transport,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::composition::Composition;
use crate::orchestrator::{self, Dispatch, Involved};
use crate::resources::{self, AssignRequest, ResourceAssignment};
use crate::scan_timer::{self, OneShot};
use crate::split::{self, Wiring};
use crate::event_loop;

/// Last state reported by one child, stamped with the event sequence number.
#[derive(Debug, Clone)]
pub(crate) struct ChildRecord {
    pub kind: SubElementKind,
    /// Receptor behind a dish leaf.
    pub receptor: Option<String>,
    pub obs: Option<(ObsState, u64)>,
    pub pointing: Option<(PointingState, u64)>,
    pub health: Option<HealthState>,
}

impl ChildRecord {
    fn new(kind: SubElementKind, receptor: Option<String>) -> Self {
        Self {
            kind,
            receptor,
            obs: None,
            pointing: None,
            health: None,
        }
    }

    fn obs_since(&self, barrier: u64) -> Option<ObsState> {
        self.obs.filter(|(_, seq)| *seq > barrier).map(|(s, _)| s)
    }

    fn pointing_since(&self, barrier: u64) -> Option<PointingState> {
        self.pointing.filter(|(_, seq)| *seq > barrier).map(|(s, _)| s)
    }

    pub(crate) fn last_obs(&self) -> Option<ObsState> {
        self.obs.map(|(s, _)| s)
    }

    fn forget(&mut self) {
        self.obs = None;
        self.pointing = None;
        self.health = None;
    }
}

/// An `AssignResources` waiting for its children.
#[derive(Debug, Clone)]
pub(crate) struct Staged {
    request: AssignRequest,
    engaged: BTreeSet<String>,
}

/// Everything guarded by the state lock.
#[derive(Debug)]
pub(crate) struct NodeState {
    pub op: OpState,
    pub machine: ObsStateMachine,
    pub children: BTreeMap<String, ChildRecord>,
    pub subscriptions: SubscriptionSet,
    pub assignment: ResourceAssignment,
    /// Observation leaves holding resources for this subarray.
    pub engaged: BTreeSet<String>,
    pub staged: Option<Staged>,
    /// Children the pending command waits on.
    pub involved: Vec<Involved>,
    /// Events at or below this sequence number predate the pending command.
    pub barrier: u64,
    pub scan_timer: OneShot,
    pub command_timer: OneShot,
    /// Scan duration set by the last `Configure`.
    pub scan_duration: Option<Duration>,
}

/// What a composite command will do once started.
#[derive(Debug, Default)]
struct Plan {
    dispatches: Vec<Dispatch>,
    staged: Option<Staged>,
    scan_duration: Option<Duration>,
}

/// Subarray node: one observation across its CSP, SDP, MCCS and dish leaves.
pub struct SubarrayNode {
    composition: Composition,
    transport: Arc<dyn Transport>,
    attributes: Arc<AttributeStore>,
    events: EventSender,
    abort_pending: AtomicBool,
    timeout: Option<Duration>,
    pub(crate) state: tokio::sync::Mutex<NodeState>,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for SubarrayNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubarrayNode")
            .field("fqdn", &self.attributes.owner())
            .field("composition", &self.composition)
            .finish_non_exhaustive()
    }
}

impl SubarrayNode {
    /// Read the composition of `fqdn`, publish the initial attributes and
    /// start the event loop. The node starts `OFF` / `EMPTY`.
    ///
    /// # Errors
    ///
    /// Returns `Config` when the composition properties are missing or
    /// inconsistent.
    pub async fn start(
        fqdn: &str,
        transport: Arc<dyn Transport>,
        config: &TmcConfig,
    ) -> TmcResult<Arc<Self>> {
        let composition = Composition::load(transport.as_ref(), fqdn).await?;

        let attributes = AttributeStore::new(fqdn);
        attributes.set_op_state(OpState::Off);
        attributes.set_obs_state(ObsState::Empty);
        attributes.set_health_state(HealthState::Unknown);
        attributes.set_activity("initialised");

        let mut children = BTreeMap::new();
        for (kind, leaf) in composition.obs_leaves() {
            children.insert(leaf.to_owned(), ChildRecord::new(kind, None));
        }
        for (receptor, leaf) in composition.dish_leaves() {
            children.insert(leaf, ChildRecord::new(SubElementKind::Dish, Some(receptor)));
        }

        let (events, receiver) = events::channel(fqdn, config.events.queue_capacity);
        let node = Arc::new(Self {
            composition,
            transport,
            attributes: Arc::new(attributes),
            events,
            abort_pending: AtomicBool::new(false),
            timeout: config.commands.timeout(),
            state: tokio::sync::Mutex::new(NodeState {
                op: OpState::Off,
                machine: ObsStateMachine::default(),
                children,
                subscriptions: SubscriptionSet::new(),
                assignment: ResourceAssignment::default(),
                engaged: BTreeSet::new(),
                staged: None,
                involved: Vec::new(),
                barrier: 0,
                scan_timer: OneShot::new(TimerKind::ScanDuration),
                command_timer: OneShot::new(TimerKind::CommandTimeout),
                scan_duration: None,
            }),
            shutdown: CancellationToken::new(),
        });
        node.publish_resources(&ResourceAssignment::default());

        event_loop::spawn(Arc::downgrade(&node), receiver, node.shutdown.clone());
        info!(
            fqdn,
            telescope = %node.composition.telescope,
            subarray_id = node.composition.subarray_id,
            "subarray node started"
        );
        Ok(node)
    }

    /// The leaves this node drives.
    #[must_use]
    pub const fn composition(&self) -> &Composition {
        &self.composition
    }

    /// Current observation state.
    #[must_use]
    pub fn obs_state(&self) -> ObsState {
        self.attributes.obs_state().unwrap_or(ObsState::Empty)
    }

    /// Resources held.
    pub async fn assignment(&self) -> ResourceAssignment {
        self.state.lock().await.assignment.clone()
    }

    /// Observation leaves engaged by a resource assignment.
    pub async fn engaged(&self) -> Vec<String> {
        self.state.lock().await.engaged.iter().cloned().collect()
    }

    /// Number of live child subscriptions.
    pub async fn subscription_count(&self) -> usize {
        self.state.lock().await.subscriptions.len()
    }

    pub(crate) fn abort_pending(&self) -> bool {
        self.abort_pending.load(Ordering::SeqCst)
    }

    /// Run `command` with the state lock held.
    pub(crate) async fn execute(
        &self,
        state: &mut NodeState,
        command: ObsCommand,
        argin: Option<Value>,
    ) -> TmcResult<CommandResponse> {
        let result = match command {
            ObsCommand::On => self.power_on(state).await,
            ObsCommand::Off | ObsCommand::Standby => self.power_down(state, command).await,
            _ => self.run_composite(state, command, argin),
        };
        if let Err(e) = &result {
            if command == ObsCommand::Abort {
                self.abort_pending.store(false, Ordering::SeqCst);
            }
            warn!(fqdn = %self.attributes.owner(), %command, error = %e, "command rejected");
            self.attributes.set_activity(format!("{command} rejected: {e}"));
        }
        result
    }

    async fn power_on(&self, state: &mut NodeState) -> TmcResult<CommandResponse> {
        state.machine.admit(ObsCommand::On, state.op)?;
        let leaves: Vec<String> = self
            .composition
            .obs_leaves()
            .into_iter()
            .map(|(_, leaf)| leaf.to_owned())
            .collect();
        orchestrator::call_all(self.transport.as_ref(), "On", &leaves).await?;

        if let Err(e) = self.subscribe_children(state).await {
            state
                .subscriptions
                .unsubscribe_all(self.transport.as_ref())
                .await;
            return Err(e);
        }

        state.op = OpState::On;
        self.attributes.set_op_state(OpState::On);
        self.refresh_health(state);
        self.attributes.set_activity("On completed");
        info!(fqdn = %self.attributes.owner(), subscriptions = state.subscriptions.len(), "subarray on");
        Ok(CommandResponse::ok("On completed"))
    }

    async fn subscribe_children(&self, state: &mut NodeState) -> TmcResult<()> {
        let transport = self.transport.as_ref();
        for (kind, leaf) in self.composition.obs_leaves() {
            let mut attrs = vec![names::HEALTH_STATE, names::OBS_STATE];
            if kind == SubElementKind::Mccs {
                attrs.push(names::ASSIGNED_RESOURCES);
            }
            for name in attrs {
                state
                    .subscriptions
                    .subscribe(transport, leaf, name, self.events.attribute_callback())
                    .await?;
            }
        }
        for (_, leaf) in self.composition.dish_leaves() {
            for name in [names::HEALTH_STATE, names::POINTING_STATE] {
                state
                    .subscriptions
                    .subscribe(transport, &leaf, name, self.events.attribute_callback())
                    .await?;
            }
        }
        Ok(())
    }

    async fn power_down(
        &self,
        state: &mut NodeState,
        command: ObsCommand,
    ) -> TmcResult<CommandResponse> {
        state.machine.admit(command, state.op)?;

        let cancelled = state
            .subscriptions
            .unsubscribe_all(self.transport.as_ref())
            .await;
        state.scan_timer.cancel();
        state.command_timer.cancel();

        let dishes: Vec<String> = state
            .assignment
            .receptors()
            .iter()
            .filter_map(|r| self.composition.dish_leaf(r))
            .collect();
        if let Err(e) =
            orchestrator::call_all(self.transport.as_ref(), "SetStandbyLPMode", &dishes).await
        {
            warn!(fqdn = %self.attributes.owner(), error = %e, "dishes did not reach standby");
        }
        let leaves: Vec<String> = self
            .composition
            .obs_leaves()
            .into_iter()
            .map(|(_, leaf)| leaf.to_owned())
            .collect();
        if let Err(e) = orchestrator::call_all(self.transport.as_ref(), command.name(), &leaves).await
        {
            warn!(fqdn = %self.attributes.owner(), %command, error = %e, "leaves did not power down");
        }

        state.machine.reset_to(ObsState::Empty);
        self.abort_pending.store(false, Ordering::SeqCst);
        state.assignment.clear();
        state.engaged.clear();
        state.staged = None;
        state.involved.clear();
        state.scan_duration = None;
        for child in state.children.values_mut() {
            child.forget();
        }

        let op = if command == ObsCommand::Off {
            OpState::Off
        } else {
            OpState::Standby
        };
        state.op = op;
        self.attributes.set_op_state(op);
        self.attributes.set_obs_state(ObsState::Empty);
        self.attributes.set_health_state(HealthState::Unknown);
        self.publish_resources(&state.assignment);
        self.attributes.set_activity(format!("{command} completed"));
        info!(fqdn = %self.attributes.owner(), %op, cancelled, "subarray powered down");
        Ok(CommandResponse::ok(format!("{command} completed")))
    }

    fn run_composite(
        &self,
        state: &mut NodeState,
        command: ObsCommand,
        argin: Option<Value>,
    ) -> TmcResult<CommandResponse> {
        state.machine.admit(command, state.op)?;
        let plan = self.plan(state, command, argin)?;

        let Started::Pending(pending) = state.machine.begin(command) else {
            let message = format!("{command} has nothing to do in {}", state.machine.state());
            self.attributes.set_activity(message.clone());
            return Ok(CommandResponse::ok(message));
        };

        if matches!(command, ObsCommand::Abort | ObsCommand::EndScan) {
            state.scan_timer.cancel();
        }
        state.barrier = self.events.watermark();
        state.staged = plan.staged;
        if command == ObsCommand::Configure {
            state.scan_duration = plan.scan_duration;
        }
        self.attributes.set_obs_state(state.machine.state());

        let count = plan.dispatches.len();
        state.involved = orchestrator::fan_out(self.transport.as_ref(), &self.events, plan.dispatches);

        if command == ObsCommand::Scan {
            if let Some(after) = plan.scan_duration.or(state.scan_duration) {
                state.scan_timer.arm(&self.events, pending.generation, after);
            }
        }
        match self.timeout {
            Some(after) => state.command_timer.arm(&self.events, pending.generation, after),
            None => {
                state.command_timer.cancel();
            }
        }

        info!(
            fqdn = %self.attributes.owner(),
            %command,
            generation = pending.generation,
            children = count,
            "command started"
        );
        self.attributes
            .set_activity(format!("{command} started on {count} children"));
        self.evaluate(state);
        Ok(CommandResponse::started(format!("{command} started")))
    }

    fn plan(
        &self,
        state: &NodeState,
        command: ObsCommand,
        argin: Option<Value>,
    ) -> TmcResult<Plan> {
        let telescope = self.composition.telescope;
        let engaged = self.engaged_leaves(state);
        let dishes = self.assigned_dishes(state);

        let plan = match command {
            ObsCommand::AssignResources => {
                let document = payload::parse_object(argin)?;
                let request = AssignRequest::parse(&document, &self.composition, &state.assignment)?;
                let mut dispatches = Vec::new();
                let mut engaged = BTreeSet::new();
                for (kind, leaf) in self.composition.obs_leaves() {
                    let sub = match kind {
                        SubElementKind::Csp => request.csp.clone(),
                        SubElementKind::Sdp => request.sdp.clone(),
                        SubElementKind::Mccs => request.mccs.clone(),
                        SubElementKind::Dish => None,
                    };
                    if let Some(sub) = sub {
                        dispatches.push(Dispatch::new(leaf, kind, command.name(), Some(sub)));
                        engaged.insert(leaf.to_owned());
                    }
                }
                for receptor in &request.receptors {
                    if let Some(leaf) = self.composition.dish_leaf(receptor) {
                        dispatches.push(Dispatch::new(
                            leaf,
                            SubElementKind::Dish,
                            "SetStandbyFPMode",
                            None,
                        ));
                    }
                }
                Plan {
                    dispatches,
                    staged: Some(Staged { request, engaged }),
                    scan_duration: None,
                }
            }
            ObsCommand::ReleaseResources => {
                let document = argin.map(|a| payload::parse_object(Some(a))).transpose()?;
                resources::check_release(document.as_ref())?;
                Plan {
                    dispatches: to_leaves(&engaged, command, None),
                    ..Plan::default()
                }
            }
            ObsCommand::Configure => {
                let document = payload::parse_object(argin)?;
                if telescope == Telescope::Mid
                    && !dishes.is_empty()
                    && payload::lookup(&document, &["pointing", "target"]).is_none()
                {
                    return Err(TmcError::invalid_payload("missing key pointing.target"));
                }
                let scan_duration =
                    scan_timer::from_seconds(split::configured_scan_duration(&document)?);
                let wiring = Wiring {
                    csp_leaf: self.composition.csp.as_deref(),
                    sdp_leaf: self.composition.sdp.as_deref(),
                };
                let mut dispatches = Vec::new();
                for (kind, leaf) in &engaged {
                    let sub = split::configure_for(telescope, *kind, &document, wiring)?;
                    dispatches.push(Dispatch::new(*leaf, *kind, command.name(), Some(sub)));
                }
                let dish_document =
                    split::configure_for(telescope, SubElementKind::Dish, &document, wiring)?;
                for leaf in &dishes {
                    dispatches.push(Dispatch::new(
                        leaf.as_str(),
                        SubElementKind::Dish,
                        command.name(),
                        Some(dish_document.clone()),
                    ));
                }
                Plan {
                    dispatches,
                    staged: None,
                    scan_duration,
                }
            }
            ObsCommand::Scan => {
                let document = payload::parse_object(argin)?;
                let leaf_document = split::scan_for_leaves(&document)?;
                let scan_duration =
                    scan_timer::from_seconds(payload::optional_f64(&document, &["scanDuration"])?);
                let mut dispatches = to_leaves(&engaged, command, Some(leaf_document));
                dispatches.extend(to_dishes(&dishes, command));
                Plan {
                    dispatches,
                    staged: None,
                    scan_duration,
                }
            }
            ObsCommand::EndScan | ObsCommand::End | ObsCommand::Abort => {
                let mut dispatches = to_leaves(&engaged, command, None);
                dispatches.extend(to_dishes(&dishes, command));
                Plan {
                    dispatches,
                    ..Plan::default()
                }
            }
            ObsCommand::ObsReset | ObsCommand::Restart => {
                let recovering: Vec<_> = engaged
                    .into_iter()
                    .filter(|(_, leaf)| {
                        state
                            .children
                            .get(*leaf)
                            .and_then(ChildRecord::last_obs)
                            .is_some_and(|s| matches!(s, ObsState::Aborted | ObsState::Fault))
                    })
                    .collect();
                let mut dispatches = to_leaves(&recovering, command, None);
                dispatches.extend(to_dishes(&dishes, command));
                Plan {
                    dispatches,
                    ..Plan::default()
                }
            }
            ObsCommand::On | ObsCommand::Off | ObsCommand::Standby => {
                return Err(TmcError::internal(format!("{command} is not a composite command")))
            }
        };
        Ok(plan)
    }

    fn engaged_leaves<'a>(&'a self, state: &NodeState) -> Vec<(SubElementKind, &'a str)> {
        self.composition
            .obs_leaves()
            .into_iter()
            .filter(|(_, leaf)| state.engaged.contains(*leaf))
            .collect()
    }

    fn assigned_dishes(&self, state: &NodeState) -> Vec<String> {
        state
            .assignment
            .receptors()
            .iter()
            .filter_map(|r| self.composition.dish_leaf(r))
            .collect()
    }

    /// Compare the children of the pending command with its expected state
    /// and resolve it when they agree.
    pub(crate) fn evaluate(&self, state: &mut NodeState) {
        let Some(pending) = state.machine.pending() else {
            return;
        };
        let outcome = {
            let views: Vec<ChildView<'_>> = state
                .involved
                .iter()
                .map(|child| {
                    let record = state.children.get(&child.fqdn);
                    ChildView {
                        fqdn: &child.fqdn,
                        kind: child.kind,
                        obs_state: record.and_then(|r| r.obs_since(state.barrier)),
                        pointing: record.and_then(|r| r.pointing_since(state.barrier)),
                    }
                })
                .collect();
            aggregate_obs(&views, pending.expected)
        };

        match outcome {
            ObsAggregate::Reached => self.complete(state, pending.expected),
            ObsAggregate::Fault(children) => self.fail(
                state,
                &TmcError::sub_element(format!("{} reported FAULT", children.join(", "))),
            ),
            ObsAggregate::Waiting(children) => {
                debug!(
                    fqdn = %self.attributes.owner(),
                    command = %pending.command,
                    waiting = ?children,
                    "waiting on children"
                );
            }
        }
    }

    fn complete(&self, state: &mut NodeState, reached: ObsState) {
        let Some(done) = state.machine.observe(reached) else {
            return;
        };
        state.command_timer.cancel();
        match done.command {
            ObsCommand::AssignResources => {
                if let Some(staged) = state.staged.take() {
                    state.assignment.apply(&staged.request);
                    state.engaged.extend(staged.engaged);
                }
            }
            ObsCommand::ReleaseResources | ObsCommand::Restart => {
                state.assignment.clear();
                state.engaged.clear();
                state.scan_duration = None;
            }
            ObsCommand::End => state.scan_duration = None,
            ObsCommand::Abort => self.abort_pending.store(false, Ordering::SeqCst),
            _ => {}
        }
        state.involved.clear();

        self.publish_resources(&state.assignment);
        self.attributes.set_obs_state(state.machine.state());
        self.refresh_health(state);
        let response = CommandResponse::ok(format!("{} completed", done.command));
        self.publish_result(done.command, &response);
        info!(
            fqdn = %self.attributes.owner(),
            command = %done.command,
            obs_state = %state.machine.state(),
            "command completed"
        );
    }

    /// Fail the pending command, if any, and enter `FAULT`.
    pub(crate) fn fail(&self, state: &mut NodeState, error: &TmcError) {
        let failed = state.machine.fault();
        state.command_timer.cancel();
        state.scan_timer.cancel();
        if let Some(staged) = state.staged.take() {
            state.engaged.extend(staged.engaged);
        }
        state.involved.clear();
        self.abort_pending.store(false, Ordering::SeqCst);

        self.attributes.set_obs_state(ObsState::Fault);
        let command = failed.map_or("none", |p| p.command.name());
        self.publish_result_named(command, &CommandResponse::from_error(error));
        self.refresh_health(state);
        warn!(fqdn = %self.attributes.owner(), command, error = %error, "subarray faulted");
    }

    /// Recompute `healthState` from the observation leaves and the assigned
    /// dishes.
    pub(crate) fn refresh_health(&self, state: &NodeState) {
        let health = aggregate_health(
            state
                .children
                .values()
                .filter(|child| match &child.receptor {
                    Some(receptor) => state.assignment.holds(receptor),
                    None => true,
                })
                .map(|child| child.health),
        );
        if self.attributes.set_health_state(health) {
            debug!(fqdn = %self.attributes.owner(), %health, "health changed");
        }
    }

    fn publish_resources(&self, assignment: &ResourceAssignment) {
        match self.composition.telescope {
            Telescope::Mid => {
                self.attributes.set(
                    names::RECEPTOR_ID_LIST,
                    AttrValue::StringArray(assignment.receptors()),
                );
            }
            Telescope::Low => {
                if assignment.mccs().is_none() {
                    self.attributes
                        .set(names::ASSIGNED_RESOURCES, AttrValue::Json(json!({})));
                }
            }
        }
    }

    /// Republish a child's `assigned_resources`.
    pub(crate) fn mirror_assigned_resources(&self, value: AttrValue) {
        self.attributes.set(names::ASSIGNED_RESOURCES, value);
    }

    fn publish_result(&self, command: ObsCommand, response: &CommandResponse) {
        self.publish_result_named(command.name(), response);
    }

    fn publish_result_named(&self, command: &str, response: &CommandResponse) {
        self.attributes.set(
            names::COMMAND_RESULT,
            AttrValue::Json(json!({
                "command": command,
                "resultCode": response.result_code.as_str(),
                "message": response.message,
            })),
        );
        self.attributes
            .set_activity(format!("{command}: {}", response));
    }

    pub(crate) fn set_activity(&self, message: impl Into<String>) {
        self.attributes.set_activity(message);
    }

    pub(crate) fn fqdn_str(&self) -> &str {
        self.attributes.owner()
    }
}

fn to_leaves(
    leaves: &[(SubElementKind, &str)],
    command: ObsCommand,
    argin: Option<Value>,
) -> Vec<Dispatch> {
    leaves
        .iter()
        .map(|(kind, leaf)| Dispatch::new(*leaf, *kind, command.name(), argin.clone()))
        .collect()
}

fn to_dishes(dishes: &[String], command: ObsCommand) -> Vec<Dispatch> {
    dishes
        .iter()
        .map(|leaf| Dispatch::new(leaf.as_str(), SubElementKind::Dish, command.name(), None))
        .collect()
}

impl Drop for SubarrayNode {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[async_trait]
impl DeviceServer for SubarrayNode {
    fn fqdn(&self) -> &str {
        self.attributes.owner()
    }

    fn attributes(&self) -> &AttributeStore {
        &self.attributes
    }

    #[instrument(skip(self, argin), fields(fqdn = %self.attributes.owner()))]
    async fn command_inout(&self, command: &str, argin: Option<Value>) -> TmcResult<CommandResponse> {
        let parsed: ObsCommand = command
            .parse()
            .map_err(|_| unknown_command(self.fqdn(), command))?;
        if parsed == ObsCommand::Abort {
            self.abort_pending.store(true, Ordering::SeqCst);
        }
        let mut state = self.state.lock().await;
        self.execute(&mut state, parsed, argin).await
    }
}
