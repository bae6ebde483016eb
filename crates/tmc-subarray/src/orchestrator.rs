//! Fan-out of composite commands to leaf nodes.

use futures::future::join_all;
use serde_json::Value;
use tmc_core::events::EventSender;
use tmc_core::{CommandResponse, SubElementKind, TmcError, TmcResult, Transport};
use tracing::{debug, warn};

/// One leaf command of a composite command.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatch {
    /// Leaf fqdn.
    pub fqdn: String,
    /// Kind of sub-element behind the leaf.
    pub kind: SubElementKind,
    /// Command sent to the leaf.
    pub command: String,
    /// Argument sent to the leaf.
    pub argin: Option<Value>,
}

impl Dispatch {
    /// Create a dispatch.
    #[must_use]
    pub fn new(
        fqdn: impl Into<String>,
        kind: SubElementKind,
        command: impl Into<String>,
        argin: Option<Value>,
    ) -> Self {
        Self {
            fqdn: fqdn.into(),
            kind,
            command: command.into(),
            argin,
        }
    }
}

/// A leaf the pending command waits on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Involved {
    /// Leaf fqdn.
    pub fqdn: String,
    /// Kind of sub-element behind the leaf.
    pub kind: SubElementKind,
    /// Command the leaf was sent.
    pub command: String,
}

/// Dispatch every command asynchronously. Completions are pushed into the
/// device queue through `sender`.
pub fn fan_out(transport: &dyn Transport, sender: &EventSender, plan: Vec<Dispatch>) -> Vec<Involved> {
    plan.into_iter()
        .map(|dispatch| {
            debug!(fqdn = %dispatch.fqdn, command = %dispatch.command, "dispatching");
            transport.call_async(
                &dispatch.fqdn,
                &dispatch.command,
                dispatch.argin,
                sender.completion_callback(),
            );
            Involved {
                fqdn: dispatch.fqdn,
                kind: dispatch.kind,
                command: dispatch.command,
            }
        })
        .collect()
}

/// Run `command` on every leaf concurrently and wait for all replies.
///
/// # Errors
///
/// Returns `SubElementFailed` naming every leaf that failed.
pub async fn call_all(
    transport: &dyn Transport,
    command: &str,
    fqdns: &[String],
) -> TmcResult<Vec<CommandResponse>> {
    let replies = join_all(
        fqdns
            .iter()
            .map(|fqdn| transport.call(fqdn, command, None)),
    )
    .await;

    let mut failures = Vec::new();
    let mut responses = Vec::with_capacity(replies.len());
    for (fqdn, reply) in fqdns.iter().zip(replies) {
        match reply {
            Ok(response) if response.is_success() => responses.push(response),
            Ok(response) => failures.push(format!("{fqdn}: {response}")),
            Err(e) => {
                warn!(fqdn = %fqdn, command, error = %e, "leaf command failed");
                failures.push(format!("{fqdn}: {e}"));
            }
        }
    }
    if failures.is_empty() {
        Ok(responses)
    } else {
        Err(TmcError::sub_element(format!(
            "{command} failed on {}",
            failures.join("; ")
        )))
    }
}
