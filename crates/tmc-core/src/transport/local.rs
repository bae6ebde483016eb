//! In-process transport for single-process deployments.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, info, trace, warn};

use super::{CommandCompletion, CompletionCallback, SubscriptionId, Transport};
use crate::attribute::{AttrValue, EventCallback, ListenerId};
use crate::device::DeviceServer;
use crate::error::{TmcError, TmcResult};
use crate::types::CommandResponse;

/// A command dispatched through the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct CallRecord {
    /// Target device.
    pub fqdn: String,
    /// Command name.
    pub command: String,
    /// Argument as sent.
    pub argin: Option<Value>,
    /// Whether the call was dispatched asynchronously.
    pub asynchronous: bool,
}

#[derive(Default)]
struct Inner {
    devices: DashMap<String, Arc<dyn DeviceServer>>,
    properties: DashMap<(String, String), Value>,
    subscriptions: DashMap<SubscriptionId, (String, ListenerId)>,
    next_subscription: AtomicU64,
    call_log: Mutex<Vec<CallRecord>>,
}

/// In-memory transport hosting every device of the process.
///
/// Devices register themselves by fqdn. Commands are routed straight to the
/// device, change events are delivered synchronously by the device's
/// attribute store, and asynchronous completions run on spawned tasks.
/// Every dispatched command is recorded in a call log.
#[derive(Clone, Default)]
pub struct LocalTransport {
    inner: Arc<Inner>,
}

impl LocalTransport {
    /// Create an empty transport.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Host a device.
    ///
    /// # Errors
    ///
    /// Returns an error if a device with the same fqdn is already hosted.
    pub fn register(&self, device: Arc<dyn DeviceServer>) -> TmcResult<()> {
        use dashmap::mapref::entry::Entry;

        let fqdn = device.fqdn().to_owned();
        match self.inner.devices.entry(fqdn.clone()) {
            Entry::Occupied(_) => Err(TmcError::config(format!(
                "device already registered: {fqdn}"
            ))),
            Entry::Vacant(entry) => {
                debug!(fqdn = %fqdn, "device registered");
                entry.insert(device);
                Ok(())
            }
        }
    }

    /// Stop hosting a device. Unknown devices are ignored.
    pub fn deregister(&self, fqdn: &str) {
        if self.inner.devices.remove(fqdn).is_some() {
            info!(fqdn = %fqdn, "device deregistered");
        }
    }

    /// Whether a device is hosted.
    #[must_use]
    pub fn contains(&self, fqdn: &str) -> bool {
        self.inner.devices.contains_key(fqdn)
    }

    /// Fqdns of every hosted device.
    #[must_use]
    pub fn device_names(&self) -> Vec<String> {
        self.inner.devices.iter().map(|r| r.key().clone()).collect()
    }

    /// Set a device property in the property database.
    pub fn set_property(&self, fqdn: &str, name: &str, value: impl Into<Value>) {
        self.inner
            .properties
            .insert((fqdn.to_owned(), name.to_owned()), value.into());
    }

    /// Every command dispatched so far, in dispatch order.
    #[must_use]
    pub fn calls(&self) -> Vec<CallRecord> {
        self.inner.call_log.lock().clone()
    }

    /// Commands dispatched to one device.
    #[must_use]
    pub fn calls_to(&self, fqdn: &str) -> Vec<CallRecord> {
        self.inner
            .call_log
            .lock()
            .iter()
            .filter(|record| record.fqdn == fqdn)
            .cloned()
            .collect()
    }

    /// Forget the call log.
    pub fn clear_calls(&self) {
        self.inner.call_log.lock().clear();
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.inner.subscriptions.len()
    }

    fn device(&self, fqdn: &str) -> TmcResult<Arc<dyn DeviceServer>> {
        self.inner
            .devices
            .get(fqdn)
            .map(|r| r.value().clone())
            .ok_or_else(|| TmcError::TransportUnavailable {
                fqdn: fqdn.to_owned(),
                reason: "device not exported".to_owned(),
            })
    }

    fn record(&self, fqdn: &str, command: &str, argin: Option<&Value>, asynchronous: bool) {
        self.inner.call_log.lock().push(CallRecord {
            fqdn: fqdn.to_owned(),
            command: command.to_owned(),
            argin: argin.cloned(),
            asynchronous,
        });
    }

    async fn invoke(
        &self,
        fqdn: &str,
        command: &str,
        argin: Option<Value>,
    ) -> TmcResult<CommandResponse> {
        let device = self.device(fqdn)?;
        trace!(fqdn = %fqdn, command = %command, "invoking command");
        device.command_inout(command, argin).await
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn call(
        &self,
        fqdn: &str,
        command: &str,
        argin: Option<Value>,
    ) -> TmcResult<CommandResponse> {
        self.record(fqdn, command, argin.as_ref(), false);
        self.invoke(fqdn, command, argin).await
    }

    fn call_async(
        &self,
        fqdn: &str,
        command: &str,
        argin: Option<Value>,
        on_complete: CompletionCallback,
    ) {
        self.record(fqdn, command, argin.as_ref(), true);

        let transport = self.clone();
        let fqdn = fqdn.to_owned();
        let command = command.to_owned();
        tokio::spawn(async move {
            let result = transport.invoke(&fqdn, &command, argin).await;
            on_complete(CommandCompletion {
                fqdn,
                command,
                result,
            });
        });
    }

    async fn read_attr(&self, fqdn: &str, name: &str) -> TmcResult<AttrValue> {
        self.device(fqdn)?
            .attributes()
            .get(name)
            .ok_or_else(|| TmcError::DeviceFailed {
                fqdn: fqdn.to_owned(),
                command: format!("read {name}"),
                reason: "attribute has no value".to_owned(),
            })
    }

    async fn write_attr(&self, fqdn: &str, name: &str, value: AttrValue) -> TmcResult<()> {
        self.device(fqdn)?.write_attribute(name, value).await
    }

    async fn subscribe(
        &self,
        fqdn: &str,
        name: &str,
        on_event: EventCallback,
    ) -> TmcResult<SubscriptionId> {
        let device = self.device(fqdn)?;
        let raw = self.inner.next_subscription.fetch_add(1, Ordering::Relaxed) + 1;
        let id = SubscriptionId::new(raw);

        let listener = device.attributes().subscribe(name, on_event);
        self.inner
            .subscriptions
            .insert(id, (fqdn.to_owned(), listener));
        debug!(fqdn = %fqdn, attribute = %name, subscription = %id, "subscribed");
        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> TmcResult<()> {
        let Some((_, (fqdn, listener))) = self.inner.subscriptions.remove(&id) else {
            return Err(TmcError::internal(format!("unknown subscription {id}")));
        };

        match self.inner.devices.get(&fqdn) {
            Some(device) => {
                device.attributes().unsubscribe(listener);
            }
            None => warn!(fqdn = %fqdn, subscription = %id, "device gone before unsubscribe"),
        }
        debug!(fqdn = %fqdn, subscription = %id, "unsubscribed");
        Ok(())
    }

    async fn read_property(&self, fqdn: &str, name: &str) -> TmcResult<Value> {
        self.inner
            .properties
            .get(&(fqdn.to_owned(), name.to_owned()))
            .map(|r| r.value().clone())
            .ok_or_else(|| TmcError::config(format!("property not found: {fqdn}/{name}")))
    }
}

impl std::fmt::Debug for LocalTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTransport")
            .field("devices", &self.inner.devices.len())
            .field("subscriptions", &self.inner.subscriptions.len())
            .finish_non_exhaustive()
    }
}
