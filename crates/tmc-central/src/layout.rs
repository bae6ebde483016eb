//! The devices below the central node, read once from its properties.

use tmc_core::transport::properties;
use tmc_core::{Telescope, TmcError, TmcResult, Transport};

/// Property: CSP master leaf fqdn.
pub const CSP_MASTER_LEAF_PROPERTY: &str = "CspMasterLeafNodeFQDN";
/// Property: SDP master leaf fqdn.
pub const SDP_MASTER_LEAF_PROPERTY: &str = "SdpMasterLeafNodeFQDN";
/// Property: MCCS master leaf fqdn (Low only).
pub const MCCS_MASTER_LEAF_PROPERTY: &str = "MccsMasterLeafNodeFQDN";
/// Property: subarray node fqdns, subarray 1 first.
pub const SUBARRAY_NODES_PROPERTY: &str = "TMSubarrayNodes";
/// Property: dish leaf fqdns (Mid only).
pub const DISH_LEAF_NODES_PROPERTY: &str = "DishLeafNodes";

/// Master leaves, subarray nodes and dish leaves of one telescope.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TelescopeLayout {
    /// Low when an MCCS master leaf is configured.
    pub telescope: Telescope,
    /// Master leaves, CSP first.
    pub masters: Vec<String>,
    /// Subarray nodes; index `n` holds subarray `n + 1`.
    pub subarrays: Vec<String>,
    /// Dish leaves.
    pub dish_leaves: Vec<String>,
}

impl TelescopeLayout {
    /// Read the layout of central node `fqdn`.
    ///
    /// # Errors
    ///
    /// Returns `Config` when no subarray is configured, when dish leaves are
    /// configured on Low, or when a property is malformed.
    pub async fn load(transport: &dyn Transport, fqdn: &str) -> TmcResult<Self> {
        let csp = properties::optional_string(transport, fqdn, CSP_MASTER_LEAF_PROPERTY).await?;
        let sdp = properties::optional_string(transport, fqdn, SDP_MASTER_LEAF_PROPERTY).await?;
        let mccs = properties::optional_string(transport, fqdn, MCCS_MASTER_LEAF_PROPERTY).await?;
        let telescope = if mccs.is_some() {
            Telescope::Low
        } else {
            Telescope::Mid
        };
        let masters = [csp, sdp, mccs].into_iter().flatten().collect();

        let subarrays = properties::string_list(transport, fqdn, SUBARRAY_NODES_PROPERTY).await?;
        if subarrays.is_empty() {
            return Err(TmcError::config(format!(
                "{fqdn}: {SUBARRAY_NODES_PROPERTY} is empty"
            )));
        }
        let dish_leaves = properties::string_list(transport, fqdn, DISH_LEAF_NODES_PROPERTY).await?;
        if telescope == Telescope::Low && !dish_leaves.is_empty() {
            return Err(TmcError::config(format!(
                "{fqdn}: dish leaves configured on a Low telescope"
            )));
        }

        Ok(Self {
            telescope,
            masters,
            subarrays,
            dish_leaves,
        })
    }

    /// Subarray node of subarray `id`.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPayload` for an id outside `1..=subarrays`.
    pub fn subarray(&self, id: u64) -> TmcResult<&str> {
        usize::try_from(id)
            .ok()
            .and_then(|id| id.checked_sub(1))
            .and_then(|index| self.subarrays.get(index))
            .map(String::as_str)
            .ok_or_else(|| {
                TmcError::invalid_payload(format!(
                    "subarray {id} does not exist, expected 1..={}",
                    self.subarrays.len()
                ))
            })
    }

    /// Devices whose health rolls up into the telescope health.
    #[must_use]
    pub fn health_inputs(&self) -> Vec<String> {
        self.masters
            .iter()
            .chain(&self.subarrays)
            .cloned()
            .collect()
    }
}
