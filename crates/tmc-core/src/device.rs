//! Server side of a device: what the transport invokes.

use async_trait::async_trait;
use serde_json::Value;

use crate::attribute::{AttrValue, AttributeStore};
use crate::error::{TmcError, TmcResult};
use crate::types::CommandResponse;

/// A device hosted behind a [`Transport`](crate::transport::Transport).
#[async_trait]
pub trait DeviceServer: Send + Sync {
    /// Fully-qualified device name.
    fn fqdn(&self) -> &str;

    /// Attribute store of the device.
    fn attributes(&self) -> &AttributeStore;

    /// Execute a command.
    async fn command_inout(&self, command: &str, argin: Option<Value>)
        -> TmcResult<CommandResponse>;

    /// Handle a client write. By default the value is stored as-is.
    async fn write_attribute(&self, name: &str, value: AttrValue) -> TmcResult<()> {
        self.attributes().set(name, value);
        Ok(())
    }
}

/// Error for a command name the device does not expose.
#[must_use]
pub fn unknown_command(fqdn: &str, command: &str) -> TmcError {
    TmcError::DeviceFailed {
        fqdn: fqdn.to_owned(),
        command: command.to_owned(),
        reason: "command not supported".to_owned(),
    }
}
