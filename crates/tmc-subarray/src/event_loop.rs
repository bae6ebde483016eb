//! The subarray's state owner: drains the device queue and applies each
//! event under the state lock.

use std::sync::Weak;

use tmc_core::events::{DeviceEvent, EventReceiver, QueuedEvent, TimerKind};
use tmc_core::{
    names, AttributeEvent, CommandCompletion, ObsCommand, ObsState, OpState, SubElementKind,
    TmcError,
};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::node::{NodeState, SubarrayNode};

/// Spawn the event loop of `node`. It stops on `shutdown`, when the queue
/// closes or once the node is gone.
pub(crate) fn spawn(
    node: Weak<SubarrayNode>,
    mut receiver: EventReceiver,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
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
            let mut state = node.state.lock().await;
            node.handle(&mut state, queued).await;
        }
        debug!("subarray event loop stopped");
    })
}

impl SubarrayNode {
    async fn handle(&self, state: &mut NodeState, queued: QueuedEvent) {
        trace!(fqdn = %self.fqdn_str(), seq = queued.seq, "event");
        match queued.event {
            DeviceEvent::Attribute(event) => self.on_attribute(state, event, queued.seq),
            DeviceEvent::Completion(completion) => self.on_completion(state, &completion),
            DeviceEvent::Timer { kind, generation } => {
                self.on_timer(state, kind, generation).await;
            }
        }
    }

    fn on_attribute(&self, state: &mut NodeState, event: AttributeEvent, seq: u64) {
        let value = match event.value {
            Ok(value) => value,
            Err(reason) => {
                warn!(child = %event.fqdn, attribute = %event.name, %reason, "child attribute error");
                return;
            }
        };
        if state.op != OpState::On && state.subscriptions.is_empty() {
            trace!(child = %event.fqdn, "event after unsubscribe ignored");
            return;
        }
        let Some(child) = state.children.get_mut(&event.fqdn) else {
            trace!(child = %event.fqdn, "event from unknown child");
            return;
        };

        match event.name.as_str() {
            names::OBS_STATE => {
                let Some(obs) = value.as_obs_state() else {
                    return;
                };
                child.obs = Some((obs, seq));
                debug!(child = %event.fqdn, %obs, seq, "child obsState");
                if obs == ObsState::Fault && state.machine.pending().is_none() {
                    self.fault_unprompted(state, &event.fqdn);
                } else {
                    self.evaluate(state);
                }
            }
            names::POINTING_STATE => {
                if let Some(pointing) = value.as_pointing() {
                    child.pointing = Some((pointing, seq));
                    self.evaluate(state);
                }
            }
            names::HEALTH_STATE => {
                child.health = value.as_health();
                self.refresh_health(state);
            }
            names::ASSIGNED_RESOURCES if child.kind == SubElementKind::Mccs => {
                self.mirror_assigned_resources(value);
            }
            other => trace!(child = %event.fqdn, attribute = other, "ignored attribute"),
        }
    }

    /// A child faulted on its own. Only leaves holding our resources count.
    fn fault_unprompted(&self, state: &mut NodeState, child: &str) {
        if state.op != OpState::On
            || !state.engaged.contains(child)
            || matches!(state.machine.state(), ObsState::Fault | ObsState::Empty)
        {
            return;
        }
        self.fail(state, &TmcError::sub_element(format!("{child} reported FAULT")));
    }

    fn on_completion(&self, state: &mut NodeState, completion: &CommandCompletion) {
        match completion.outcome() {
            Ok(response) => {
                debug!(child = %completion.fqdn, command = %completion.command, "child command completed");
                self.set_activity(format!(
                    "{} on {}: {response}",
                    completion.command, completion.fqdn
                ));
            }
            Err(e) => {
                let awaited = state.machine.pending().is_some()
                    && state
                        .involved
                        .iter()
                        .any(|c| c.fqdn == completion.fqdn && c.command == completion.command);
                if awaited {
                    self.fail(
                        state,
                        &TmcError::sub_element(format!(
                            "{} failed on {}: {e}",
                            completion.command, completion.fqdn
                        )),
                    );
                } else {
                    warn!(child = %completion.fqdn, command = %completion.command, error = %e, "child command failed");
                    self.set_activity(format!(
                        "{} failed on {}: {e}",
                        completion.command, completion.fqdn
                    ));
                }
            }
        }
    }

    async fn on_timer(&self, state: &mut NodeState, kind: TimerKind, generation: u64) {
        match kind {
            TimerKind::ScanDuration => {
                if state.machine.generation() != generation
                    || state.machine.state() != ObsState::Scanning
                {
                    trace!(generation, "stale scan timer");
                    return;
                }
                state.scan_timer.cancel();
                if self.abort_pending() {
                    debug!(fqdn = %self.fqdn_str(), "scan timer ignored, abort pending");
                    return;
                }
                info!(fqdn = %self.fqdn_str(), "scan duration elapsed");
                if let Err(e) = self.execute(state, ObsCommand::EndScan, None).await {
                    warn!(fqdn = %self.fqdn_str(), error = %e, "automatic EndScan failed");
                }
            }
            TimerKind::CommandTimeout => {
                let Some(pending) = state.machine.pending() else {
                    return;
                };
                if pending.generation != generation {
                    return;
                }
                let waiting: Vec<String> = state.involved.iter().map(|c| c.fqdn.clone()).collect();
                self.fail(
                    state,
                    &TmcError::sub_element(format!(
                        "{} timed out waiting for {}",
                        pending.command,
                        waiting.join(", ")
                    )),
                );
            }
        }
    }
}
