//! Device attributes and change-event delivery.
//!
//! Every device owns an [`AttributeStore`]. Writes replace the last value and,
//! when the value changed, notify every listener registered for that
//! attribute. Notification for one store is serialised, so listeners observe
//! the writes for a given attribute in the order they were made.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::types::{DishMode, HealthState, ObsState, OpState, PointingState};

/// Well-known attribute names.
pub mod names {
    /// Power / fault state.
    pub const STATE: &str = "state";
    /// Observation state.
    pub const OBS_STATE: &str = "obsState";
    /// Device health.
    pub const HEALTH_STATE: &str = "healthState";
    /// Last status message.
    pub const ACTIVITY_MESSAGE: &str = "activityMessage";
    /// Outcome of the last completed command.
    pub const COMMAND_RESULT: &str = "commandResult";
    /// Dish pointing state.
    pub const POINTING_STATE: &str = "pointingState";
    /// Dish operating mode.
    pub const DISH_MODE: &str = "dishMode";
    /// Commanded `[timestamp, az, el]`.
    pub const DESIRED_POINTING: &str = "desiredPointing";
    /// Reported `[timestamp, az, el]`.
    pub const ACHIEVED_POINTING: &str = "achievedPointing";
    /// Delay model JSON document.
    pub const DELAY_MODEL: &str = "delayModel";
    /// Receptors held by a Mid subarray.
    pub const RECEPTOR_ID_LIST: &str = "receptorIDList";
    /// Resources held by a Low subarray / MCCS leaf.
    pub const ASSIGNED_RESOURCES: &str = "assigned_resources";
    /// Visibility receive addresses published by SDP.
    pub const RECEIVE_ADDRESSES: &str = "receiveAddresses";
    /// Correlator output link published by CSP.
    pub const CBF_OUTPUT_LINK: &str = "cbfOutputLink";
    /// Aggregated telescope health on the central node.
    pub const TELESCOPE_HEALTH_STATE: &str = "telescopeHealthState";
}

/// Value of a device attribute.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttrValue {
    /// Power state.
    State(OpState),
    /// Observation state.
    ObsState(ObsState),
    /// Health state.
    Health(HealthState),
    /// Dish pointing state.
    Pointing(PointingState),
    /// Dish mode.
    DishMode(DishMode),
    /// Boolean scalar.
    Bool(bool),
    /// Integer scalar.
    Int(i64),
    /// Floating point scalar.
    Double(f64),
    /// String scalar.
    String(String),
    /// Floating point spectrum.
    DoubleArray(Vec<f64>),
    /// String spectrum.
    StringArray(Vec<String>),
    /// Structured JSON document.
    Json(serde_json::Value),
}

impl AttrValue {
    /// The value as an [`OpState`], if it is one.
    #[must_use]
    pub const fn as_op_state(&self) -> Option<OpState> {
        match self {
            Self::State(s) => Some(*s),
            _ => None,
        }
    }

    /// The value as an [`ObsState`], if it is one.
    #[must_use]
    pub const fn as_obs_state(&self) -> Option<ObsState> {
        match self {
            Self::ObsState(s) => Some(*s),
            _ => None,
        }
    }

    /// The value as a [`HealthState`], if it is one.
    #[must_use]
    pub const fn as_health(&self) -> Option<HealthState> {
        match self {
            Self::Health(h) => Some(*h),
            _ => None,
        }
    }

    /// The value as a [`PointingState`], if it is one.
    #[must_use]
    pub const fn as_pointing(&self) -> Option<PointingState> {
        match self {
            Self::Pointing(p) => Some(*p),
            _ => None,
        }
    }

    /// The value as a [`DishMode`], if it is one.
    #[must_use]
    pub const fn as_dish_mode(&self) -> Option<DishMode> {
        match self {
            Self::DishMode(m) => Some(*m),
            _ => None,
        }
    }

    /// The value as a string slice, if it is a string.
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    /// The value as a float slice, if it is a float spectrum.
    #[must_use]
    pub fn as_doubles(&self) -> Option<&[f64]> {
        match self {
            Self::DoubleArray(v) => Some(v),
            _ => None,
        }
    }

    /// The value as a string list, if it is a string spectrum.
    #[must_use]
    pub fn as_strings(&self) -> Option<&[String]> {
        match self {
            Self::StringArray(v) => Some(v),
            _ => None,
        }
    }

    /// The value as a JSON document. Strings are parsed as JSON.
    #[must_use]
    pub fn to_json(&self) -> Option<serde_json::Value> {
        match self {
            Self::Json(v) => Some(v.clone()),
            Self::String(s) => serde_json::from_str(s).ok(),
            _ => None,
        }
    }
}

/// A change event delivered to subscribers.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeEvent {
    /// Device the attribute belongs to.
    pub fqdn: String,
    /// Attribute name.
    pub name: String,
    /// New value, or the error reported by the middleware.
    pub value: Result<AttrValue, String>,
}

/// Callback invoked for each change event. Must not block.
pub type EventCallback = Arc<dyn Fn(AttributeEvent) + Send + Sync + 'static>;

/// Identifier of a listener within one [`AttributeStore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

#[derive(Default)]
struct StoreInner {
    values: HashMap<String, AttrValue>,
    listeners: HashMap<String, Vec<(ListenerId, EventCallback)>>,
    next_listener: u64,
}

/// Attribute values of one device plus their change-event listeners.
pub struct AttributeStore {
    owner: String,
    inner: Mutex<StoreInner>,
    delivery: Mutex<()>,
}

impl AttributeStore {
    /// Create an empty store for the device `owner`.
    #[must_use]
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            inner: Mutex::new(StoreInner::default()),
            delivery: Mutex::new(()),
        }
    }

    /// Fqdn of the owning device.
    #[must_use]
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Current value of an attribute.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<AttrValue> {
        self.inner.lock().values.get(name).cloned()
    }

    /// Point-in-time snapshot of every attribute.
    #[must_use]
    pub fn snapshot(&self) -> HashMap<String, AttrValue> {
        self.inner.lock().values.clone()
    }

    /// Write an attribute, pushing a change event when the value changed.
    ///
    /// Returns `true` when the value changed. Listeners must not write back
    /// into this store.
    pub fn set(&self, name: &str, value: AttrValue) -> bool {
        self.write(name, value, false)
    }

    /// Write an attribute and push a change event even if unchanged.
    pub fn push(&self, name: &str, value: AttrValue) {
        self.write(name, value, true);
    }

    fn write(&self, name: &str, value: AttrValue, force: bool) -> bool {
        let _order = self.delivery.lock();
        let listeners = {
            let mut inner = self.inner.lock();
            let changed = inner.values.get(name) != Some(&value);
            if !changed && !force {
                return false;
            }
            inner.values.insert(name.to_owned(), value.clone());
            inner.listeners.get(name).cloned().unwrap_or_default()
        };

        for (_, callback) in listeners {
            callback(AttributeEvent {
                fqdn: self.owner.clone(),
                name: name.to_owned(),
                value: Ok(value.clone()),
            });
        }
        true
    }

    /// Register a listener. The current value, when present, is delivered
    /// immediately.
    pub fn subscribe(&self, name: &str, callback: EventCallback) -> ListenerId {
        let _order = self.delivery.lock();
        let (id, current) = {
            let mut inner = self.inner.lock();
            inner.next_listener += 1;
            let id = ListenerId(inner.next_listener);
            inner
                .listeners
                .entry(name.to_owned())
                .or_default()
                .push((id, callback.clone()));
            (id, inner.values.get(name).cloned())
        };

        if let Some(value) = current {
            callback(AttributeEvent {
                fqdn: self.owner.clone(),
                name: name.to_owned(),
                value: Ok(value),
            });
        }
        id
    }

    /// Remove a listener. Returns `false` when it was not registered.
    pub fn unsubscribe(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.lock();
        let mut removed = false;
        for listeners in inner.listeners.values_mut() {
            let before = listeners.len();
            listeners.retain(|(lid, _)| *lid != id);
            removed |= listeners.len() != before;
        }
        removed
    }

    /// Number of listeners registered across all attributes.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.lock().listeners.values().map(Vec::len).sum()
    }

    /// Current `state`, if published.
    #[must_use]
    pub fn op_state(&self) -> Option<OpState> {
        self.get(names::STATE).and_then(|v| v.as_op_state())
    }

    /// Current `obsState`, if published.
    #[must_use]
    pub fn obs_state(&self) -> Option<ObsState> {
        self.get(names::OBS_STATE).and_then(|v| v.as_obs_state())
    }

    /// Current `healthState`, if published.
    #[must_use]
    pub fn health_state(&self) -> Option<HealthState> {
        self.get(names::HEALTH_STATE).and_then(|v| v.as_health())
    }

    /// Current `activityMessage`, if published.
    #[must_use]
    pub fn activity_message(&self) -> Option<String> {
        self.get(names::ACTIVITY_MESSAGE)
            .and_then(|v| v.as_str().map(str::to_owned))
    }

    /// Publish the power state.
    pub fn set_op_state(&self, state: OpState) -> bool {
        self.set(names::STATE, AttrValue::State(state))
    }

    /// Publish the observation state.
    pub fn set_obs_state(&self, state: ObsState) -> bool {
        self.set(names::OBS_STATE, AttrValue::ObsState(state))
    }

    /// Publish the health state.
    pub fn set_health_state(&self, health: HealthState) -> bool {
        self.set(names::HEALTH_STATE, AttrValue::Health(health))
    }

    /// Publish an activity message. Always pushes an event.
    pub fn set_activity(&self, message: impl Into<String>) {
        self.push(names::ACTIVITY_MESSAGE, AttrValue::String(message.into()));
    }
}

impl std::fmt::Debug for AttributeStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AttributeStore")
            .field("owner", &self.owner)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn recorder() -> (EventCallback, Arc<Mutex<Vec<AttributeEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        let callback: EventCallback = Arc::new(move |event| sink.lock().push(event));
        (callback, events)
    }

    #[test]
    fn subscribe_delivers_current_value() {
        let store = AttributeStore::new("test/dev/1");
        store.set_obs_state(ObsState::Idle);

        let (callback, events) = recorder();
        store.subscribe(names::OBS_STATE, callback);

        let events = events.lock();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].fqdn, "test/dev/1");
        assert_eq!(events[0].value, Ok(AttrValue::ObsState(ObsState::Idle)));
    }

    #[test]
    fn unchanged_writes_do_not_notify() {
        let store = AttributeStore::new("test/dev/1");
        let (callback, events) = recorder();
        store.subscribe(names::HEALTH_STATE, callback);

        assert!(store.set_health_state(HealthState::Ok));
        assert!(!store.set_health_state(HealthState::Ok));
        assert!(store.set_health_state(HealthState::Degraded));

        assert_eq!(events.lock().len(), 2);
    }

    #[test]
    fn activity_message_always_notifies() {
        let store = AttributeStore::new("test/dev/1");
        let (callback, events) = recorder();
        store.subscribe(names::ACTIVITY_MESSAGE, callback);

        store.set_activity("busy");
        store.set_activity("busy");
        assert_eq!(events.lock().len(), 2);
        assert_eq!(store.activity_message().as_deref(), Some("busy"));
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let store = AttributeStore::new("test/dev/1");
        let (callback, events) = recorder();
        let id = store.subscribe(names::STATE, callback);
        assert_eq!(store.listener_count(), 1);

        assert!(store.unsubscribe(id));
        assert!(!store.unsubscribe(id));
        store.set_op_state(OpState::On);

        assert!(events.lock().is_empty());
        assert_eq!(store.listener_count(), 0);
    }

    #[test]
    fn json_accessor_parses_strings() {
        let value = AttrValue::String("{\"a\":1}".to_owned());
        assert_eq!(value.to_json(), Some(serde_json::json!({"a": 1})));
        assert_eq!(AttrValue::Int(3).to_json(), None);
    }
}
