//! Bookkeeping of change-event subscriptions held by a device.

use std::collections::BTreeMap;

use tracing::{debug, warn};

use crate::attribute::EventCallback;
use crate::error::TmcResult;
use crate::transport::{SubscriptionId, Transport};

/// Subscriptions keyed by `(fqdn, attribute)`.
#[derive(Debug, Default)]
pub struct SubscriptionSet {
    entries: BTreeMap<(String, String), SubscriptionId>,
}

impl SubscriptionSet {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe unless `(fqdn, name)` is already subscribed.
    ///
    /// Returns `true` when a new subscription was made.
    ///
    /// # Errors
    ///
    /// Returns the transport error when the subscription fails.
    pub async fn subscribe(
        &mut self,
        transport: &dyn Transport,
        fqdn: &str,
        name: &str,
        on_event: EventCallback,
    ) -> TmcResult<bool> {
        let key = (fqdn.to_owned(), name.to_owned());
        if self.entries.contains_key(&key) {
            return Ok(false);
        }
        let id = transport.subscribe(fqdn, name, on_event).await?;
        self.entries.insert(key, id);
        Ok(true)
    }

    /// Cancel every subscription and clear the set. Failures are logged.
    ///
    /// Returns the number of subscriptions cancelled cleanly.
    pub async fn unsubscribe_all(&mut self, transport: &dyn Transport) -> usize {
        let mut cancelled = 0;
        for ((fqdn, name), id) in std::mem::take(&mut self.entries) {
            match transport.unsubscribe(id).await {
                Ok(()) => cancelled += 1,
                Err(e) => warn!(fqdn = %fqdn, attribute = %name, error = %e, "unsubscribe failed"),
            }
        }
        debug!(cancelled, "subscriptions cleared");
        cancelled
    }

    /// Whether `(fqdn, name)` is subscribed.
    #[must_use]
    pub fn contains(&self, fqdn: &str, name: &str) -> bool {
        self.entries
            .contains_key(&(fqdn.to_owned(), name.to_owned()))
    }

    /// Number of live subscriptions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the set is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
