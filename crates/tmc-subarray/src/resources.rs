//! Resources held by a subarray and the requests that change them.

use std::collections::BTreeSet;

use serde_json::{json, Value};
use tmc_core::{payload, Telescope, TmcError, TmcResult};

use crate::composition::Composition;

/// MCCS id lists that grow with each assignment.
pub const STATION_LISTS: [&str; 3] = ["station_ids", "station_beam_ids", "channels"];

/// Resources currently held by a subarray.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceAssignment {
    receptors: BTreeSet<String>,
    mccs: Option<Value>,
    sdp: Option<Value>,
}

impl ResourceAssignment {
    /// Whether nothing is held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.receptors.is_empty() && self.mccs.is_none() && self.sdp.is_none()
    }

    /// Assigned receptor ids, sorted.
    #[must_use]
    pub fn receptors(&self) -> Vec<String> {
        self.receptors.iter().cloned().collect()
    }

    /// Whether `receptor` is held.
    #[must_use]
    pub fn holds(&self, receptor: &str) -> bool {
        self.receptors.contains(receptor)
    }

    /// Station resources (Low).
    #[must_use]
    pub const fn mccs(&self) -> Option<&Value> {
        self.mccs.as_ref()
    }

    /// Ids held under the MCCS list `key`.
    fn station_list(&self, key: &str) -> Vec<u64> {
        self.mccs
            .as_ref()
            .and_then(|m| m.get(key))
            .and_then(Value::as_array)
            .map(|ids| ids.iter().filter_map(Value::as_u64).collect())
            .unwrap_or_default()
    }

    /// Grow the assignment by a successful request.
    pub fn apply(&mut self, request: &AssignRequest) {
        self.receptors.extend(request.receptors.iter().cloned());
        if let Some(incoming) = &request.mccs {
            match &mut self.mccs {
                Some(held) => payload::merge_lists(held, incoming, &STATION_LISTS),
                None => self.mccs = Some(incoming.clone()),
            }
        }
        if request.sdp.is_some() {
            self.sdp.clone_from(&request.sdp);
        }
    }

    /// Release everything.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// A validated `AssignResources` request.
#[derive(Debug, Clone, PartialEq)]
pub struct AssignRequest {
    /// Receptors to add (Mid).
    pub receptors: Vec<String>,
    /// Document for the CSP leaf.
    pub csp: Option<Value>,
    /// Document for the SDP leaf.
    pub sdp: Option<Value>,
    /// Document for the MCCS leaf (Low).
    pub mccs: Option<Value>,
}

impl AssignRequest {
    /// Validate an `AssignResources` document against the composition and the
    /// current assignment.
    ///
    /// # Errors
    ///
    /// Returns `InvalidPayload` for missing keys or unknown receptors and
    /// `DuplicateResource` for receptors already held or listed twice.
    pub fn parse(
        document: &Value,
        composition: &Composition,
        current: &ResourceAssignment,
    ) -> TmcResult<Self> {
        match composition.telescope {
            Telescope::Mid => Self::parse_mid(document, composition, current),
            Telescope::Low => Self::parse_low(document, current),
        }
    }

    fn parse_mid(
        document: &Value,
        composition: &Composition,
        current: &ResourceAssignment,
    ) -> TmcResult<Self> {
        let receptors = payload::require_string_list(document, &["dish", "receptorIDList"])?;
        if receptors.is_empty() {
            return Err(TmcError::invalid_payload("dish.receptorIDList is empty"));
        }

        let unknown: Vec<_> = receptors
            .iter()
            .filter(|r| !composition.knows_receptor(r))
            .cloned()
            .collect();
        if !unknown.is_empty() {
            return Err(TmcError::invalid_payload(format!(
                "unknown receptors: {}",
                unknown.join(", ")
            )));
        }

        let mut seen = BTreeSet::new();
        let mut duplicates = BTreeSet::new();
        for receptor in &receptors {
            if current.holds(receptor) || !seen.insert(receptor.as_str()) {
                duplicates.insert(receptor.clone());
            }
        }
        if !duplicates.is_empty() {
            return Err(TmcError::DuplicateResource {
                ids: duplicates.into_iter().collect(),
            });
        }

        let csp = json!({
            "subarrayID": composition.subarray_id,
            "dish": {"receptorIDList": receptors},
        });
        Ok(Self {
            receptors,
            csp: Some(csp),
            sdp: document.get("sdp").cloned(),
            mccs: None,
        })
    }

    fn parse_low(document: &Value, current: &ResourceAssignment) -> TmcResult<Self> {
        let mccs = document
            .get("mccs")
            .filter(|m| m.is_object())
            .cloned()
            .ok_or_else(|| TmcError::invalid_payload("missing key mccs"))?;

        let mut duplicates = BTreeSet::new();
        for (key, prefix) in [("station_ids", "station"), ("station_beam_ids", "beam")] {
            let requested = match payload::lookup(&mccs, &[key]) {
                None if key == "station_beam_ids" => Vec::new(),
                _ => payload::require_u64_list(&mccs, &[key])?,
            };
            let held = current.station_list(key);
            let mut seen = BTreeSet::new();
            for id in requested {
                if held.contains(&id) || !seen.insert(id) {
                    duplicates.insert(format!("{prefix}/{id}"));
                }
            }
        }
        if !duplicates.is_empty() {
            return Err(TmcError::DuplicateResource {
                ids: duplicates.into_iter().collect(),
            });
        }
        Ok(Self {
            receptors: Vec::new(),
            csp: document.get("csp").cloned(),
            sdp: document.get("sdp").cloned(),
            mccs: Some(mccs),
        })
    }
}

/// Check a `ReleaseResources` document. `None` releases everything.
///
/// # Errors
///
/// Returns `NotImplemented` for a partial release and `InvalidPayload` for a
/// malformed document.
pub fn check_release(document: Option<&Value>) -> TmcResult<()> {
    let Some(document) = document else {
        return Ok(());
    };
    match document.get("release_all") {
        None | Some(Value::Bool(true)) => Ok(()),
        Some(Value::Bool(false)) => Err(TmcError::NotImplemented(
            "partial release of resources".to_owned(),
        )),
        Some(other) => Err(TmcError::invalid_payload(format!(
            "release_all must be a boolean, got {other}"
        ))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn mid() -> Composition {
        Composition {
            subarray_id: 1,
            telescope: Telescope::Mid,
            csp: Some("csp-leaf".into()),
            sdp: Some("sdp-leaf".into()),
            mccs: None,
            dish_prefix: Some("dish-leaf/d".into()),
            receptors: vec!["0001".into(), "0002".into(), "0003".into()],
        }
    }

    #[test]
    fn mid_request_builds_csp_document() {
        let document = json!({"subarrayID": 1, "dish": {"receptorIDList": ["0001", "0002"]},
                              "sdp": {"eb_id": "eb-1"}});
        let request = AssignRequest::parse(&document, &mid(), &ResourceAssignment::default())
            .unwrap();
        assert_eq!(
            request.csp,
            Some(json!({"subarrayID": 1, "dish": {"receptorIDList": ["0001", "0002"]}}))
        );
        assert_eq!(request.sdp, Some(json!({"eb_id": "eb-1"})));
    }

    #[test]
    fn held_receptor_is_a_duplicate() {
        let mut current = ResourceAssignment::default();
        let first = json!({"dish": {"receptorIDList": ["0001"]}});
        current.apply(&AssignRequest::parse(&first, &mid(), &current).unwrap());

        let second = json!({"dish": {"receptorIDList": ["0001", "0002"]}});
        let err = AssignRequest::parse(&second, &mid(), &current).unwrap_err();
        assert_eq!(
            err,
            TmcError::DuplicateResource {
                ids: vec!["0001".into()]
            }
        );
    }

    #[test]
    fn repeated_receptor_is_a_duplicate() {
        let document = json!({"dish": {"receptorIDList": ["0002", "0002"]}});
        let err = AssignRequest::parse(&document, &mid(), &ResourceAssignment::default())
            .unwrap_err();
        assert_eq!(err.kind(), "DuplicateResource");
    }

    #[test]
    fn unknown_receptor_is_invalid() {
        let document = json!({"dish": {"receptorIDList": ["0042"]}});
        let err = AssignRequest::parse(&document, &mid(), &ResourceAssignment::default())
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidPayload");
    }

    #[test]
    fn low_request_needs_stations() {
        let mut low = mid();
        low.telescope = Telescope::Low;
        let err = AssignRequest::parse(&json!({"mccs": {}}), &low, &ResourceAssignment::default())
            .unwrap_err();
        assert_eq!(err.kind(), "InvalidPayload");
    }

    #[test]
    fn assignment_grows_and_clears() {
        let mut assignment = ResourceAssignment::default();
        assert!(assignment.is_empty());
        let document = json!({"dish": {"receptorIDList": ["0003", "0001"]}});
        assignment.apply(&AssignRequest::parse(&document, &mid(), &assignment).unwrap());
        assert_eq!(assignment.receptors(), vec!["0001", "0003"]);
        assignment.clear();
        assert!(assignment.is_empty());
    }

    #[test]
    fn partial_release_is_not_implemented() {
        assert!(check_release(None).is_ok());
        assert!(check_release(Some(&json!({"subarray_id": 1, "release_all": true}))).is_ok());
        let err = check_release(Some(&json!({"release_all": false}))).unwrap_err();
        assert_eq!(err.kind(), "NotImplemented");
    }

    #[test]
    fn low_assignment_grows_and_rejects_held_stations() {
        let mut low = mid();
        low.telescope = Telescope::Low;
        let mut assignment = ResourceAssignment::default();
        let first = json!({"mccs": {"subarray_id": 1, "station_ids": [1, 2],
                                    "channels": [[0, 48, 1, 1]], "station_beam_ids": [1]}});
        assignment.apply(&AssignRequest::parse(&first, &low, &assignment).unwrap());

        let overlapping = json!({"mccs": {"subarray_id": 1, "station_ids": [2, 3], "station_beam_ids": [2]}});
        let err = AssignRequest::parse(&overlapping, &low, &assignment).unwrap_err();
        assert_eq!(
            err,
            TmcError::DuplicateResource {
                ids: vec!["station/2".into()]
            }
        );

        let second = json!({"mccs": {"subarray_id": 1, "station_ids": [3],
                                     "channels": [[48, 48, 1, 1]], "station_beam_ids": [2]}});
        assignment.apply(&AssignRequest::parse(&second, &low, &assignment).unwrap());
        let held = assignment.mccs().unwrap();
        assert_eq!(held["station_ids"], json!([1, 2, 3]));
        assert_eq!(held["station_beam_ids"], json!([1, 2]));
        assert_eq!(held["channels"], json!([[0, 48, 1, 1], [48, 48, 1, 1]]));
    }
}
