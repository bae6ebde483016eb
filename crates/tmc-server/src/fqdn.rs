//! Device names of a deployment.

use tmc_core::{SubElementKind, Telescope};

const fn domain(telescope: Telescope) -> &'static str {
    match telescope {
        Telescope::Mid => "ska_mid",
        Telescope::Low => "ska_low",
    }
}

const fn element(telescope: Telescope) -> &'static str {
    match telescope {
        Telescope::Mid => "mid",
        Telescope::Low => "low",
    }
}

const fn short(kind: SubElementKind) -> &'static str {
    match kind {
        SubElementKind::Csp => "csp",
        SubElementKind::Sdp => "sdp",
        SubElementKind::Mccs => "mccs",
        SubElementKind::Dish => "dish",
    }
}

/// The central node, e.g. `ska_mid/tm_central/central_node`.
#[must_use]
pub fn central_node(telescope: Telescope) -> String {
    format!("{}/tm_central/central_node", domain(telescope))
}

/// Subarray node `id`, e.g. `ska_mid/tm_subarray_node/1`.
#[must_use]
pub fn subarray_node(telescope: Telescope, id: u32) -> String {
    format!("{}/tm_subarray_node/{id}", domain(telescope))
}

/// Master leaf of `kind`, e.g. `ska_mid/tm_leaf_node/csp_master`.
#[must_use]
pub fn master_leaf(telescope: Telescope, kind: SubElementKind) -> String {
    format!("{}/tm_leaf_node/{}_master", domain(telescope), short(kind))
}

/// Subarray leaf of `kind` for subarray `id`, e.g.
/// `ska_mid/tm_leaf_node/csp_subarray01`.
#[must_use]
pub fn subarray_leaf(telescope: Telescope, kind: SubElementKind, id: u32) -> String {
    format!(
        "{}/tm_leaf_node/{}_subarray{id:02}",
        domain(telescope),
        short(kind)
    )
}

/// Prefix of the Mid dish leaves; the receptor id completes it.
#[must_use]
pub fn dish_leaf_prefix() -> String {
    format!("{}/tm_leaf_node/d", domain(Telescope::Mid))
}

/// Dish leaf of `receptor`, e.g. `ska_mid/tm_leaf_node/d0001`.
#[must_use]
pub fn dish_leaf(receptor: &str) -> String {
    format!("{}{receptor}", dish_leaf_prefix())
}

/// Sub-element master of `kind`, e.g. `mid-csp/control/0`.
#[must_use]
pub fn master(telescope: Telescope, kind: SubElementKind) -> String {
    format!("{}-{}/control/0", element(telescope), short(kind))
}

/// Sub-element subarray of `kind`, e.g. `mid-csp/subarray/01`.
#[must_use]
pub fn subarray(telescope: Telescope, kind: SubElementKind, id: u32) -> String {
    format!("{}-{}/subarray/{id:02}", element(telescope), short(kind))
}

/// Dish master of `receptor`, e.g. `mid_d0001/elt/master`.
#[must_use]
pub fn dish_master(receptor: &str) -> String {
    format!("mid_d{receptor}/elt/master")
}
