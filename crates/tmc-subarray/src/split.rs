//! Splitting composite payloads into per-leaf documents.
//!
//! Each leaf kind receives a whitelisted subset of the top-level keys;
//! unknown keys are dropped. The Mid `Configure` documents are cross-wired
//! so CSP and SDP find each other's attributes.

use serde_json::{Map, Value};
use tmc_core::{names, payload, SubElementKind, Telescope, TmcResult};

/// Top-level `Configure` keys forwarded to the CSP leaf on Mid.
const MID_CSP_KEYS: &[&str] = &["interface", "subarray", "common", "cbf", "pss", "pst", "pointing"];

/// Top-level `Configure` keys forwarded to each dish leaf.
const DISH_KEYS: &[&str] = &["pointing", "dish"];

/// Top-level `Configure` keys forwarded to the MCCS leaf when the document
/// is not nested under `mccs`.
const MCCS_KEYS: &[&str] = &["stations", "station_beam_pointings"];

/// Copy `keys` of `document` into a new object.
#[must_use]
pub fn whitelist(document: &Value, keys: &[&str]) -> Value {
    let object: Map<String, Value> = keys
        .iter()
        .filter_map(|key| document.get(*key).map(|v| ((*key).to_owned(), v.clone())))
        .collect();
    Value::Object(object)
}

/// Sub-document under `key`, or an empty object.
#[must_use]
pub fn section(document: &Value, key: &str) -> Value {
    document
        .get(key)
        .filter(|v| v.is_object())
        .cloned()
        .unwrap_or_else(|| Value::Object(Map::new()))
}

/// Leaf fqdns needed to cross-wire a Mid configuration.
#[derive(Debug, Clone, Copy)]
pub struct Wiring<'a> {
    /// CSP subarray leaf.
    pub csp_leaf: Option<&'a str>,
    /// SDP subarray leaf.
    pub sdp_leaf: Option<&'a str>,
}

/// `Configure` document for a leaf of `kind`.
///
/// # Errors
///
/// Returns `InvalidPayload` when an injection point cannot be created.
pub fn configure_for(
    telescope: Telescope,
    kind: SubElementKind,
    document: &Value,
    wiring: Wiring<'_>,
) -> TmcResult<Value> {
    match (telescope, kind) {
        (Telescope::Mid, SubElementKind::Csp) => {
            let mut csp = whitelist(document, MID_CSP_KEYS);
            let cbf = payload::object_mut(&mut csp, &["cbf"])?;
            if let Some(csp_leaf) = wiring.csp_leaf {
                cbf.insert(
                    "delayModelSubscriptionPoint".to_owned(),
                    Value::String(format!("{csp_leaf}/{}", names::DELAY_MODEL)),
                );
            }
            if let Some(sdp_leaf) = wiring.sdp_leaf {
                cbf.insert(
                    "visDestinationAddressSubscriptionPoint".to_owned(),
                    Value::String(format!("{sdp_leaf}/{}", names::RECEIVE_ADDRESSES)),
                );
            }
            Ok(csp)
        }
        (Telescope::Mid, SubElementKind::Sdp) => {
            let mut sdp = section(document, "sdp");
            if let (Some(csp_leaf), Some(object)) = (wiring.csp_leaf, sdp.as_object_mut()) {
                object.insert(
                    "cbfOutputLink".to_owned(),
                    Value::String(format!("{csp_leaf}/{}", names::CBF_OUTPUT_LINK)),
                );
            }
            Ok(sdp)
        }
        (_, SubElementKind::Dish) => Ok(whitelist(document, DISH_KEYS)),
        (Telescope::Low, SubElementKind::Mccs) => Ok(match document.get("mccs") {
            Some(mccs) if mccs.is_object() => mccs.clone(),
            _ => whitelist(document, MCCS_KEYS),
        }),
        (Telescope::Low, SubElementKind::Csp) => Ok(section(document, "csp")),
        (Telescope::Low, SubElementKind::Sdp) => Ok(section(document, "sdp")),
        (Telescope::Mid, SubElementKind::Mccs) => Ok(Value::Object(Map::new())),
    }
}

/// Scan duration requested by a `Configure` document (`tmc.scanDuration`).
///
/// # Errors
///
/// Returns `InvalidPayload` when the value is not a number.
pub fn configured_scan_duration(document: &Value) -> TmcResult<Option<f64>> {
    payload::optional_f64(document, &["tmc", "scanDuration"])
}

/// `Scan` document for the obsState-bearing leaves: the scan id only.
///
/// # Errors
///
/// Returns `InvalidPayload` when `id` is missing.
pub fn scan_for_leaves(document: &Value) -> TmcResult<Value> {
    let id = payload::require_u64(document, &["id"])?;
    Ok(serde_json::json!({ "id": id }))
}
