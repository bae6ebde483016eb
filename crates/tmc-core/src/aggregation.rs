//! Health and observation roll-up across children.

use crate::types::{HealthState, ObsState, PointingState, SubElementKind};

/// Last known state of one child, as seen by the aggregating device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChildView<'a> {
    /// Child fqdn.
    pub fqdn: &'a str,
    /// Kind of sub-element behind the child.
    pub kind: SubElementKind,
    /// Observation state reported since the command was dispatched.
    pub obs_state: Option<ObsState>,
    /// Pointing state reported since the command was dispatched (dishes).
    pub pointing: Option<PointingState>,
}

/// Result of aggregating child observation states against an expectation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObsAggregate {
    /// Every relevant child reached the expected state.
    Reached,
    /// These children reported `FAULT`.
    Fault(Vec<String>),
    /// Still waiting on these children.
    Waiting(Vec<String>),
}

/// Roll up health: worst of the inputs, `OK` for none. A child that has not
/// reported yet counts as `UNKNOWN`.
#[must_use]
pub fn aggregate_health<I>(children: I) -> HealthState
where
    I: IntoIterator<Item = Option<HealthState>>,
{
    children
        .into_iter()
        .map(|h| h.unwrap_or(HealthState::Unknown))
        .max_by_key(|h| h.severity())
        .unwrap_or(HealthState::Ok)
}

/// Compare child observation states with `expected`.
///
/// Dishes carry no observation state; they only take part when `expected` is
/// `READY`, and then have to report `TRACK`.
#[must_use]
pub fn aggregate_obs(children: &[ChildView<'_>], expected: ObsState) -> ObsAggregate {
    let mut faulted = Vec::new();
    let mut waiting = Vec::new();

    for child in children {
        if child.kind == SubElementKind::Dish {
            if expected == ObsState::Ready && child.pointing != Some(PointingState::Track) {
                waiting.push(child.fqdn.to_owned());
            }
            continue;
        }
        match child.obs_state {
            Some(ObsState::Fault) => faulted.push(child.fqdn.to_owned()),
            Some(state) if state == expected => {}
            _ => waiting.push(child.fqdn.to_owned()),
        }
    }

    if !faulted.is_empty() {
        ObsAggregate::Fault(faulted)
    } else if waiting.is_empty() {
        ObsAggregate::Reached
    } else {
        ObsAggregate::Waiting(waiting)
    }
}
