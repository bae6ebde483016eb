//! Middleware abstraction used by every device to reach its children.
//!
//! The control plane never talks to the middleware directly. Commands,
//! attribute reads and writes, change-event subscriptions and property
//! lookups all go through [`Transport`]. [`LocalTransport`] is the in-process
//! implementation used by the server binary and the test suites.

mod local;

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;

use crate::attribute::{AttrValue, EventCallback};
use crate::error::{TmcError, TmcResult};
use crate::types::CommandResponse;

pub use local::{CallRecord, LocalTransport};

/// Identifier of a change-event subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    /// Create a subscription id from its raw value.
    #[must_use]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Completion of an asynchronous command.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandCompletion {
    /// Device the command was sent to.
    pub fqdn: String,
    /// Command name.
    pub command: String,
    /// Reply from the device or transport error.
    pub result: TmcResult<CommandResponse>,
}

impl CommandCompletion {
    /// Collapse the reply into success or a failure description.
    ///
    /// A reply carrying `FAILED` or `NOT_ALLOWED` counts as a failure.
    pub fn outcome(&self) -> Result<&CommandResponse, TmcError> {
        match &self.result {
            Ok(response) if response.is_success() => Ok(response),
            Ok(response) => Err(TmcError::DeviceFailed {
                fqdn: self.fqdn.clone(),
                command: self.command.clone(),
                reason: response.to_string(),
            }),
            Err(err) => Err(err.clone()),
        }
    }
}

/// Callback invoked once when an asynchronous command completes.
pub type CompletionCallback = Box<dyn FnOnce(CommandCompletion) + Send + 'static>;

/// Capability provided by the telescope-control middleware.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Execute a command and wait for the reply.
    async fn call(&self, fqdn: &str, command: &str, argin: Option<Value>)
        -> TmcResult<CommandResponse>;

    /// Dispatch a command without waiting. `on_complete` runs exactly once on
    /// a transport-owned task.
    fn call_async(
        &self,
        fqdn: &str,
        command: &str,
        argin: Option<Value>,
        on_complete: CompletionCallback,
    );

    /// Read the current value of an attribute.
    async fn read_attr(&self, fqdn: &str, name: &str) -> TmcResult<AttrValue>;

    /// Write an attribute.
    async fn write_attr(&self, fqdn: &str, name: &str, value: AttrValue) -> TmcResult<()>;

    /// Subscribe to change events. The current value is delivered immediately
    /// when the attribute has one.
    async fn subscribe(
        &self,
        fqdn: &str,
        name: &str,
        on_event: EventCallback,
    ) -> TmcResult<SubscriptionId>;

    /// Cancel a subscription.
    async fn unsubscribe(&self, id: SubscriptionId) -> TmcResult<()>;

    /// Read a device-scoped property.
    async fn read_property(&self, fqdn: &str, name: &str) -> TmcResult<Value>;
}

/// Typed property helpers on top of [`Transport::read_property`].
pub mod properties {
    use super::{Transport, Value};
    use crate::error::{TmcError, TmcResult};

    /// Read a string property.
    pub async fn string(transport: &dyn Transport, fqdn: &str, name: &str) -> TmcResult<String> {
        match transport.read_property(fqdn, name).await? {
            Value::String(s) => Ok(s),
            other => Err(TmcError::config(format!(
                "property {fqdn}/{name} is not a string: {other}"
            ))),
        }
    }

    /// Read an optional string property. Missing properties yield `None`.
    pub async fn optional_string(
        transport: &dyn Transport,
        fqdn: &str,
        name: &str,
    ) -> TmcResult<Option<String>> {
        match transport.read_property(fqdn, name).await {
            Ok(Value::String(s)) if !s.is_empty() => Ok(Some(s)),
            Ok(Value::String(_) | Value::Null) | Err(TmcError::Config(_)) => Ok(None),
            Ok(other) => Err(TmcError::config(format!(
                "property {fqdn}/{name} is not a string: {other}"
            ))),
            Err(err) => Err(err),
        }
    }

    /// Read a list-of-strings property. Missing properties yield an empty list.
    pub async fn string_list(
        transport: &dyn Transport,
        fqdn: &str,
        name: &str,
    ) -> TmcResult<Vec<String>> {
        match transport.read_property(fqdn, name).await {
            Ok(Value::Array(items)) => items
                .into_iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s),
                    other => Err(TmcError::config(format!(
                        "property {fqdn}/{name} has a non-string entry: {other}"
                    ))),
                })
                .collect(),
            Ok(Value::Null) | Err(TmcError::Config(_)) => Ok(Vec::new()),
            Ok(other) => Err(TmcError::config(format!(
                "property {fqdn}/{name} is not a list: {other}"
            ))),
            Err(err) => Err(err),
        }
    }

    /// Read an unsigned integer property.
    pub async fn unsigned(transport: &dyn Transport, fqdn: &str, name: &str) -> TmcResult<u64> {
        let value = transport.read_property(fqdn, name).await?;
        value
            .as_u64()
            .or_else(|| value.as_str().and_then(|s| s.parse().ok()))
            .ok_or_else(|| {
                TmcError::config(format!("property {fqdn}/{name} is not an integer: {value}"))
            })
    }
}
