//! State and plumbing shared by every leaf node.

use std::sync::Arc;

use serde_json::Value;
use tmc_core::transport::properties;
use tmc_core::{
    names, AttrValue, AttributeStore, CommandResponse, EventCallback, ObsState, SubscriptionSet,
    TmcError, TmcResult, Transport,
};
use tmc_sky::{AntennaTable, Lla};
use tracing::{debug, warn};

/// Property holding the antenna table text.
pub const ANTENNA_TABLE_PROPERTY: &str = "AntennaTable";

/// Child observation states in which a leaf forwards each command.
#[must_use]
pub fn child_states_for(command: &str) -> Option<&'static [ObsState]> {
    use ObsState::{Aborted, Configuring, Empty, Fault, Idle, Ready, Resetting, Scanning};
    Some(match command {
        "AssignResources" => &[Empty, Idle],
        "ReleaseAllResources" => &[Idle],
        "Configure" => &[Idle, Ready],
        "Scan" | "End" => &[Ready],
        "EndScan" => &[Scanning],
        "Abort" => &[Idle, Configuring, Ready, Scanning, Resetting],
        "ObsReset" | "Restart" => &[Aborted, Fault],
        _ => return None,
    })
}

/// A leaf's own attributes, its child and the transport to reach it.
pub struct LeafContext {
    child: String,
    transport: Arc<dyn Transport>,
    attributes: Arc<AttributeStore>,
    subscriptions: tokio::sync::Mutex<SubscriptionSet>,
}

impl LeafContext {
    /// Create the context of leaf `fqdn` proxying `child`.
    #[must_use]
    pub fn new(fqdn: &str, child: impl Into<String>, transport: Arc<dyn Transport>) -> Self {
        let attributes = AttributeStore::new(fqdn);
        attributes.set_activity("initialised");
        Self {
            child: child.into(),
            transport,
            attributes: Arc::new(attributes),
            subscriptions: tokio::sync::Mutex::new(SubscriptionSet::new()),
        }
    }

    /// Fqdn of the leaf.
    #[must_use]
    pub fn fqdn(&self) -> &str {
        self.attributes.owner()
    }

    /// Fqdn of the proxied device.
    #[must_use]
    pub fn child(&self) -> &str {
        &self.child
    }

    /// The leaf's attribute store.
    #[must_use]
    pub fn attributes(&self) -> &Arc<AttributeStore> {
        &self.attributes
    }

    /// The transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Subscribe to the child's `attrs` and copy every change onto the leaf's
    /// attribute of the same name.
    ///
    /// # Errors
    ///
    /// Returns the transport error of the first failed subscription.
    pub async fn mirror(&self, attrs: &[&str]) -> TmcResult<()> {
        let mut subscriptions = self.subscriptions.lock().await;
        for name in attrs {
            let store = self.attributes.clone();
            let callback: EventCallback = Arc::new(move |event| match event.value {
                Ok(value) => {
                    store.set(&event.name, value);
                }
                Err(reason) => {
                    warn!(fqdn = %event.fqdn, attribute = %event.name, reason = %reason, "child attribute error");
                }
            });
            subscriptions
                .subscribe(self.transport.as_ref(), &self.child, name, callback)
                .await?;
        }
        debug!(fqdn = %self.fqdn(), child = %self.child, count = attrs.len(), "mirroring child");
        Ok(())
    }

    /// Number of live mirror subscriptions.
    pub async fn mirror_count(&self) -> usize {
        self.subscriptions.lock().await.len()
    }

    /// Current observation state of the child, read through the transport.
    ///
    /// # Errors
    ///
    /// Returns an error when the child cannot be read or has no obsState.
    pub async fn child_obs_state(&self) -> TmcResult<ObsState> {
        let value = self.transport.read_attr(&self.child, names::OBS_STATE).await?;
        value.as_obs_state().ok_or_else(|| TmcError::DeviceFailed {
            fqdn: self.child.clone(),
            command: format!("read {}", names::OBS_STATE),
            reason: format!("unexpected value {value:?}"),
        })
    }

    /// Check the child is in one of the states allowed for `command`.
    ///
    /// # Errors
    ///
    /// Returns `NotAllowedInState` when it is not, or the read error.
    pub async fn require_child_obs(&self, command: &str) -> TmcResult<()> {
        let allowed = child_states_for(command)
            .ok_or_else(|| tmc_core::device::unknown_command(self.fqdn(), command))?;
        let state = self.child_obs_state().await?;
        if allowed.contains(&state) {
            Ok(())
        } else {
            Err(TmcError::not_allowed(
                command,
                format!("{} is {state}", self.child),
            ))
        }
    }

    /// Execute a command on the child and wait for its reply.
    ///
    /// # Errors
    ///
    /// Returns the transport or device error.
    pub async fn call(&self, command: &str, argin: Option<Value>) -> TmcResult<CommandResponse> {
        let response = self.transport.call(&self.child, command, argin).await?;
        self.attributes
            .set_activity(format!("{command} on {}: {response}", self.child));
        Ok(response)
    }

    /// Dispatch a command to the child without waiting. The completion only
    /// updates `activityMessage`.
    pub fn forward(&self, command: &str, argin: Option<Value>) {
        let store = self.attributes.clone();
        self.transport.call_async(
            &self.child,
            command,
            argin,
            Box::new(move |completion| match completion.outcome() {
                Ok(response) => {
                    debug!(fqdn = %completion.fqdn, command = %completion.command, "child command completed");
                    store.set_activity(format!(
                        "{} on {}: {response}",
                        completion.command, completion.fqdn
                    ));
                }
                Err(e) => {
                    warn!(fqdn = %completion.fqdn, command = %completion.command, error = %e, "child command failed");
                    store.set_activity(format!("{} failed: {e}", completion.command));
                }
            }),
        );
    }

    /// Pre-admission check followed by an asynchronous forward.
    ///
    /// # Errors
    ///
    /// Returns `NotAllowedInState` when the child is in the wrong state.
    pub async fn forward_observation(
        &self,
        command: &str,
        argin: Option<Value>,
    ) -> TmcResult<CommandResponse> {
        self.require_child_obs(command).await?;
        self.forward(command, argin);
        Ok(CommandResponse::started(format!(
            "{command} forwarded to {}",
            self.child
        )))
    }

    /// Read a string property of this leaf.
    ///
    /// # Errors
    ///
    /// Returns `Config` when the property is missing.
    pub async fn property(&self, name: &str) -> TmcResult<String> {
        properties::string(self.transport.as_ref(), self.fqdn(), name).await
    }

    /// Read and parse the antenna table property.
    ///
    /// # Errors
    ///
    /// Returns `Config` when the property is missing or malformed.
    pub async fn antenna_table(&self) -> TmcResult<AntennaTable> {
        AntennaTable::parse(&self.property(ANTENNA_TABLE_PROPERTY).await?)
    }

    /// Publish a JSON document attribute.
    pub fn publish_json(&self, name: &str, document: &Value) {
        self.attributes
            .set(name, AttrValue::String(document.to_string()));
    }
}

impl std::fmt::Debug for LeafContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafContext")
            .field("fqdn", &self.fqdn())
            .field("child", &self.child)
            .finish_non_exhaustive()
    }
}

/// Read a geodetic position property written as `lat, lon, alt`.
///
/// # Errors
///
/// Returns `Config` when the property is missing or malformed.
pub async fn position_property(ctx: &LeafContext, name: &str) -> TmcResult<Lla> {
    let text = ctx.property(name).await?;
    let parts: Vec<f64> = text
        .split(',')
        .map(|p| p.trim().parse::<f64>())
        .collect::<Result<_, _>>()
        .map_err(|e| TmcError::config(format!("property {name}: {e}")))?;
    match parts.as_slice() {
        [lat, lon, alt] => Ok(Lla::new(*lat, *lon, *alt)),
        _ => Err(TmcError::config(format!(
            "property {name} must be 'lat, lon, alt'"
        ))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tmc_core::{DeviceServer, LocalTransport, OpState};
    use tmc_sim::SimulatedSubarray;

    fn setup() -> (LocalTransport, Arc<SimulatedSubarray>, LeafContext) {
        let transport = LocalTransport::new();
        let sim = Arc::new(SimulatedSubarray::new(
            "mid-csp/subarray/01",
            tmc_core::SubElementKind::Csp,
            Duration::from_millis(50),
        ));
        transport.register(sim.clone()).unwrap();
        let ctx = LeafContext::new(
            "ska_mid/tm_leaf_node/csp_subarray01",
            "mid-csp/subarray/01",
            Arc::new(transport.clone()),
        );
        (transport, sim, ctx)
    }

    #[tokio::test]
    async fn mirror_copies_child_attributes() {
        let (_transport, sim, ctx) = setup();
        ctx.mirror(&[names::STATE, names::OBS_STATE]).await.unwrap();
        assert_eq!(ctx.attributes().obs_state(), Some(ObsState::Empty));

        sim.command_inout("On", None).await.unwrap();
        assert_eq!(ctx.attributes().op_state(), Some(OpState::On));
        assert_eq!(ctx.mirror_count().await, 2);
    }

    #[tokio::test]
    async fn pre_admission_reads_child_state() {
        let (transport, sim, ctx) = setup();
        sim.command_inout("On", None).await.unwrap();

        let err = ctx.forward_observation("Configure", None).await.unwrap_err();
        assert!(matches!(err, TmcError::NotAllowedInState { .. }));
        assert!(transport.calls_to(ctx.child()).is_empty());

        let reply = ctx.forward_observation("AssignResources", None).await.unwrap();
        assert_eq!(reply.result_code, tmc_core::ResultCode::Started);
    }

    #[test]
    fn leaf_table_is_stricter_on_end_scan() {
        assert_eq!(child_states_for("EndScan"), Some(&[ObsState::Scanning][..]));
        assert!(child_states_for("Dance").is_none());
    }
}
