//! Which leaf nodes a subarray drives, read once from its properties.

use tmc_core::transport::properties;
use tmc_core::{SubElementKind, Telescope, TmcError, TmcResult, Transport};

/// Property: numeric id of the subarray.
pub const SUBARRAY_ID_PROPERTY: &str = "SubarrayId";
/// Property: CSP subarray leaf fqdn.
pub const CSP_LEAF_PROPERTY: &str = "CspSubarrayLNFQDN";
/// Property: SDP subarray leaf fqdn.
pub const SDP_LEAF_PROPERTY: &str = "SdpSubarrayLNFQDN";
/// Property: MCCS subarray leaf fqdn (Low only).
pub const MCCS_LEAF_PROPERTY: &str = "MccsSubarrayLNFQDN";
/// Property: prefix that, followed by a receptor id, names a dish leaf.
pub const DISH_LEAF_PREFIX_PROPERTY: &str = "DishLeafNodePrefix";
/// Property: receptors the subarray may be given.
pub const RECEPTOR_LIST_PROPERTY: &str = "ReceptorList";

/// The leaf nodes behind one subarray. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Composition {
    /// Subarray id.
    pub subarray_id: u64,
    /// Mid when a dish prefix is configured, Low when an MCCS leaf is.
    pub telescope: Telescope,
    /// CSP subarray leaf.
    pub csp: Option<String>,
    /// SDP subarray leaf.
    pub sdp: Option<String>,
    /// MCCS subarray leaf.
    pub mccs: Option<String>,
    /// Dish leaf prefix.
    pub dish_prefix: Option<String>,
    /// Known receptor ids.
    pub receptors: Vec<String>,
}

impl Composition {
    /// Read the composition of subarray `fqdn`.
    ///
    /// # Errors
    ///
    /// Returns `Config` when the id is missing, when neither or both of the
    /// MCCS leaf and dish prefix are set, or when a property is malformed.
    pub async fn load(transport: &dyn Transport, fqdn: &str) -> TmcResult<Self> {
        let subarray_id = properties::unsigned(transport, fqdn, SUBARRAY_ID_PROPERTY).await?;
        let csp = properties::optional_string(transport, fqdn, CSP_LEAF_PROPERTY).await?;
        let sdp = properties::optional_string(transport, fqdn, SDP_LEAF_PROPERTY).await?;
        let mccs = properties::optional_string(transport, fqdn, MCCS_LEAF_PROPERTY).await?;
        let dish_prefix =
            properties::optional_string(transport, fqdn, DISH_LEAF_PREFIX_PROPERTY).await?;
        let receptors = properties::string_list(transport, fqdn, RECEPTOR_LIST_PROPERTY).await?;

        let telescope = match (&mccs, &dish_prefix) {
            (Some(_), None) => Telescope::Low,
            (None, Some(_)) => Telescope::Mid,
            (None, None) => {
                return Err(TmcError::config(format!(
                    "{fqdn}: neither {MCCS_LEAF_PROPERTY} nor {DISH_LEAF_PREFIX_PROPERTY} is set"
                )))
            }
            (Some(_), Some(_)) => {
                return Err(TmcError::config(format!(
                    "{fqdn}: {MCCS_LEAF_PROPERTY} and {DISH_LEAF_PREFIX_PROPERTY} are exclusive"
                )))
            }
        };

        Ok(Self {
            subarray_id,
            telescope,
            csp,
            sdp,
            mccs,
            dish_prefix,
            receptors,
        })
    }

    /// Leaf of `kind`, if composed. Dishes have one leaf per receptor; see
    /// [`Self::dish_leaf`].
    #[must_use]
    pub fn leaf(&self, kind: SubElementKind) -> Option<&str> {
        match kind {
            SubElementKind::Csp => self.csp.as_deref(),
            SubElementKind::Sdp => self.sdp.as_deref(),
            SubElementKind::Mccs => self.mccs.as_deref(),
            SubElementKind::Dish => None,
        }
    }

    /// Observation-state-bearing leaves, in dispatch order.
    #[must_use]
    pub fn obs_leaves(&self) -> Vec<(SubElementKind, &str)> {
        [SubElementKind::Mccs, SubElementKind::Csp, SubElementKind::Sdp]
            .into_iter()
            .filter_map(|kind| self.leaf(kind).map(|fqdn| (kind, fqdn)))
            .collect()
    }

    /// Dish leaf for `receptor`.
    #[must_use]
    pub fn dish_leaf(&self, receptor: &str) -> Option<String> {
        self.dish_prefix
            .as_ref()
            .map(|prefix| format!("{prefix}{receptor}"))
    }

    /// Every dish leaf the subarray may drive.
    #[must_use]
    pub fn dish_leaves(&self) -> Vec<(String, String)> {
        self.receptors
            .iter()
            .filter_map(|r| self.dish_leaf(r).map(|leaf| (r.clone(), leaf)))
            .collect()
    }

    /// Whether `receptor` may be assigned to this subarray.
    #[must_use]
    pub fn knows_receptor(&self, receptor: &str) -> bool {
        self.receptors.iter().any(|r| r == receptor)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use tmc_core::LocalTransport;

    const NODE: &str = "ska_mid/tm_subarray_node/1";

    #[tokio::test]
    async fn loads_mid_composition() {
        let transport = LocalTransport::new();
        transport.set_property(NODE, SUBARRAY_ID_PROPERTY, 1);
        transport.set_property(NODE, CSP_LEAF_PROPERTY, "ska_mid/tm_leaf_node/csp_subarray01");
        transport.set_property(NODE, SDP_LEAF_PROPERTY, "ska_mid/tm_leaf_node/sdp_subarray01");
        transport.set_property(NODE, DISH_LEAF_PREFIX_PROPERTY, "ska_mid/tm_leaf_node/d");
        transport.set_property(NODE, RECEPTOR_LIST_PROPERTY, json!(["0001", "0002"]));

        let composition = Composition::load(&transport, NODE).await.unwrap();
        assert_eq!(composition.telescope, Telescope::Mid);
        assert_eq!(
            composition.dish_leaf("0002").as_deref(),
            Some("ska_mid/tm_leaf_node/d0002")
        );
        assert_eq!(composition.obs_leaves().len(), 2);
        assert!(composition.knows_receptor("0001"));
        assert!(!composition.knows_receptor("0003"));
    }

    #[tokio::test]
    async fn low_composition_has_no_dishes() {
        let transport = LocalTransport::new();
        transport.set_property(NODE, SUBARRAY_ID_PROPERTY, "1");
        transport.set_property(NODE, MCCS_LEAF_PROPERTY, "ska_low/tm_leaf_node/mccs_subarray01");

        let composition = Composition::load(&transport, NODE).await.unwrap();
        assert_eq!(composition.telescope, Telescope::Low);
        assert!(composition.dish_leaves().is_empty());
        assert_eq!(
            composition.obs_leaves(),
            vec![(SubElementKind::Mccs, "ska_low/tm_leaf_node/mccs_subarray01")]
        );
    }

    #[tokio::test]
    async fn ambiguous_composition_is_rejected() {
        let transport = LocalTransport::new();
        transport.set_property(NODE, SUBARRAY_ID_PROPERTY, 1);
        let err = Composition::load(&transport, NODE).await.unwrap_err();
        assert_eq!(err.kind(), "Config");
    }
}
