//! Routing of resource commands to subarrays and the cross-subarray
//! allocation check.

use std::collections::{BTreeMap, BTreeSet};

use futures::future::join_all;
use serde_json::Value;
use tmc_core::{names, payload, ObsState, Telescope, TmcError, TmcResult, Transport};
use tracing::debug;

/// Subarray targeted by an `AssignResources` document: `subarrayID` on Mid,
/// `mccs.subarray_id` on Low.
///
/// # Errors
///
/// Returns `InvalidPayload` when the id is missing.
pub fn assign_target(telescope: Telescope, document: &Value) -> TmcResult<u64> {
    match telescope {
        Telescope::Mid => payload::require_u64(document, &["subarrayID"]),
        Telescope::Low => payload::require_u64(document, &["mccs", "subarray_id"]),
    }
}

/// Subarray targeted by a `ReleaseResources` document, after checking that
/// everything is released.
///
/// # Errors
///
/// Returns `NotImplemented` for `release_all=false` and `InvalidPayload`
/// for a missing id or a non-boolean flag.
pub fn release_target(document: &Value) -> TmcResult<u64> {
    match document.get("release_all") {
        None | Some(Value::Bool(true)) => {}
        Some(Value::Bool(false)) => {
            return Err(TmcError::NotImplemented(
                "partial release of resources".to_owned(),
            ))
        }
        Some(other) => {
            return Err(TmcError::invalid_payload(format!(
                "release_all must be a boolean, got {other}"
            )))
        }
    }
    payload::require_u64(document, &["subarray_id"])
}

/// Resource ids an `AssignResources` document asks for.
///
/// Mid asks for receptors, listed as given. Low asks for stations and
/// station beams, listed as `station/<id>` and `beam/<id>`.
///
/// # Errors
///
/// Returns `InvalidPayload` when the lists are missing or malformed.
pub fn requested_resources(telescope: Telescope, document: &Value) -> TmcResult<Vec<String>> {
    match telescope {
        Telescope::Mid => payload::require_string_list(document, &["dish", "receptorIDList"]),
        Telescope::Low => {
            let mccs = payload::lookup(document, &["mccs"])
                .ok_or_else(|| TmcError::invalid_payload("missing key mccs"))?;
            let mut ids = station_resources(mccs, &["station_ids"], "station")?;
            if payload::lookup(mccs, &["station_beam_ids"]).is_some() {
                ids.extend(station_resources(mccs, &["station_beam_ids"], "beam")?);
            }
            Ok(ids)
        }
    }
}

fn station_resources(mccs: &Value, path: &[&str], prefix: &str) -> TmcResult<Vec<String>> {
    Ok(payload::require_u64_list(mccs, path)?
        .into_iter()
        .map(|id| format!("{prefix}/{id}"))
        .collect())
}

/// Resource ids routed to a subarray whose assignment has not resolved yet.
#[derive(Debug, Default)]
pub struct Claims {
    by_resource: BTreeMap<String, String>,
}

impl Claims {
    /// Record that `resources` were routed to `subarray`.
    pub fn claim(&mut self, subarray: &str, resources: &[String]) {
        for resource in resources {
            self.by_resource
                .insert(resource.clone(), subarray.to_owned());
        }
    }

    /// Number of open claims.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_resource.len()
    }

    /// Whether no claim is open.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_resource.is_empty()
    }
}

/// What one subarray reports about its resources.
#[derive(Debug)]
struct Holding {
    resources: Vec<String>,
    obs_state: Option<ObsState>,
}

async fn holding(
    transport: &dyn Transport,
    telescope: Telescope,
    subarray: &str,
) -> TmcResult<Holding> {
    let resources = match telescope {
        Telescope::Mid => transport
            .read_attr(subarray, names::RECEPTOR_ID_LIST)
            .await?
            .as_strings()
            .map(<[String]>::to_vec)
            .unwrap_or_default(),
        Telescope::Low => {
            let held = transport
                .read_attr(subarray, names::ASSIGNED_RESOURCES)
                .await?
                .to_json()
                .unwrap_or(Value::Null);
            let mut ids = Vec::new();
            for (key, prefix) in [("station_ids", "station"), ("station_beam_ids", "beam")] {
                if let Some(list) = held.get(key).and_then(Value::as_array) {
                    ids.extend(
                        list.iter()
                            .filter_map(Value::as_u64)
                            .map(|id| format!("{prefix}/{id}")),
                    );
                }
            }
            ids
        }
    };
    let obs_state = transport
        .read_attr(subarray, names::OBS_STATE)
        .await
        .ok()
        .and_then(|v| v.as_obs_state());
    Ok(Holding {
        resources,
        obs_state,
    })
}

/// Reject `requested` resource ids that any subarray holds or is still being
/// given. Claims of subarrays that finished resourcing are dropped.
///
/// # Errors
///
/// Returns `DuplicateResource` listing the taken ids, or the read error of a
/// subarray that cannot be checked.
pub async fn check_unallocated(
    transport: &dyn Transport,
    telescope: Telescope,
    subarrays: &[String],
    claims: &mut Claims,
    requested: &[String],
) -> TmcResult<()> {
    let holdings = join_all(subarrays.iter().map(|s| holding(transport, telescope, s))).await;

    let mut taken = BTreeSet::new();
    let mut resourcing = BTreeSet::new();
    for (subarray, holding) in subarrays.iter().zip(holdings) {
        let holding = holding?;
        taken.extend(holding.resources);
        if holding.obs_state == Some(ObsState::Resourcing) {
            resourcing.insert(subarray.as_str());
        }
    }
    claims
        .by_resource
        .retain(|_, subarray| resourcing.contains(subarray.as_str()));
    taken.extend(claims.by_resource.keys().cloned());

    let duplicates: Vec<String> = requested
        .iter()
        .filter(|r| taken.contains(*r))
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    debug!(%telescope, requested = requested.len(), taken = taken.len(), "allocation check");
    if duplicates.is_empty() {
        Ok(())
    } else {
        Err(TmcError::DuplicateResource { ids: duplicates })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use rstest::rstest;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;
    use tmc_core::{AttrValue, DeviceServer, LocalTransport, SubElementKind};
    use tmc_sim::SimulatedSubarray;

    #[test]
    fn targets() {
        assert_eq!(
            assign_target(Telescope::Mid, &json!({"subarrayID": 2})).unwrap(),
            2
        );
        assert_eq!(
            assign_target(Telescope::Low, &json!({"mccs": {"subarray_id": 1}})).unwrap(),
            1
        );
        assert!(assign_target(Telescope::Mid, &json!({"mccs": {"subarray_id": 1}})).is_err());
        assert_eq!(
            release_target(&json!({"subarray_id": 3, "release_all": true})).unwrap(),
            3
        );
        assert_eq!(
            release_target(&json!({"subarray_id": 3, "release_all": false}))
                .unwrap_err()
                .kind(),
            "NotImplemented"
        );
    }

    #[rstest]
    #[case::missing_id(json!({"release_all": true}), "InvalidPayload")]
    #[case::flag_not_bool(json!({"subarray_id": 1, "release_all": "yes"}), "InvalidPayload")]
    #[case::partial(json!({"subarray_id": 1, "release_all": false, "receptorIDList": ["0001"]}), "NotImplemented")]
    fn bad_release_documents(#[case] document: Value, #[case] kind: &str) {
        assert_eq!(release_target(&document).unwrap_err().kind(), kind);
    }

    fn subarray(transport: &LocalTransport, fqdn: &str, receptors: &[&str]) -> Arc<SimulatedSubarray> {
        let sim = Arc::new(SimulatedSubarray::new(
            fqdn,
            SubElementKind::Csp,
            Duration::from_millis(100),
        ));
        sim.attributes().set(
            names::RECEPTOR_ID_LIST,
            AttrValue::StringArray(receptors.iter().map(|r| (*r).to_owned()).collect()),
        );
        transport.register(sim.clone()).unwrap();
        sim
    }

    #[tokio::test]
    async fn held_receptors_are_duplicates() {
        let transport = LocalTransport::new();
        subarray(&transport, "sa/1", &["0001", "0002"]);
        subarray(&transport, "sa/2", &[]);
        let subarrays = vec!["sa/1".to_owned(), "sa/2".to_owned()];
        let mut claims = Claims::default();

        let err = check_unallocated(
            &transport,
            Telescope::Mid,
            &subarrays,
            &mut claims,
            &["0003".into(), "0002".into(), "0001".into()],
        )
        .await
        .unwrap_err();
        assert_eq!(
            err,
            TmcError::DuplicateResource {
                ids: vec!["0001".into(), "0002".into()]
            }
        );
        assert!(check_unallocated(&transport, Telescope::Mid, &subarrays, &mut claims, &["0003".into()])
            .await
            .is_ok());
    }

    #[test]
    fn low_requests_name_stations_and_beams() {
        let document = json!({"mccs": {"subarray_id": 1, "station_ids": [1, 2], "station_beam_ids": [3]}});
        assert_eq!(
            requested_resources(Telescope::Low, &document).unwrap(),
            ["station/1", "station/2", "beam/3"]
        );
        assert_eq!(
            requested_resources(Telescope::Low, &json!({"mccs": {"subarray_id": 1}}))
                .unwrap_err()
                .kind(),
            "InvalidPayload"
        );
    }

    #[tokio::test]
    async fn held_stations_are_duplicates() {
        let transport = LocalTransport::new();
        for (fqdn, held) in [
            ("sa/1", json!({"station_ids": [1, 2], "station_beam_ids": [1]})),
            ("sa/2", json!({})),
        ] {
            let sim = Arc::new(SimulatedSubarray::new(
                fqdn,
                SubElementKind::Mccs,
                Duration::from_millis(100),
            ));
            sim.attributes().set(names::ASSIGNED_RESOURCES, AttrValue::Json(held));
            transport.register(sim).unwrap();
        }
        let subarrays = vec!["sa/1".to_owned(), "sa/2".to_owned()];
        let mut claims = Claims::default();

        let requested = requested_resources(
            Telescope::Low,
            &json!({"mccs": {"subarray_id": 2, "station_ids": [2, 3], "station_beam_ids": [1, 2]}}),
        )
        .unwrap();
        let err = check_unallocated(&transport, Telescope::Low, &subarrays, &mut claims, &requested)
            .await
            .unwrap_err();
        assert_eq!(
            err,
            TmcError::DuplicateResource {
                ids: vec!["beam/1".into(), "station/2".into()]
            }
        );

        let free = ["station/3".to_owned(), "beam/2".to_owned()];
        check_unallocated(&transport, Telescope::Low, &subarrays, &mut claims, &free)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn claims_last_while_resourcing() {
        let transport = LocalTransport::new();
        let first = subarray(&transport, "sa/1", &[]);
        subarray(&transport, "sa/2", &[]);
        let subarrays = vec!["sa/1".to_owned(), "sa/2".to_owned()];
        let mut claims = Claims::default();
        claims.claim("sa/1", &["0001".into()]);

        first.force_obs_state(ObsState::Resourcing);
        let err = check_unallocated(&transport, Telescope::Mid, &subarrays, &mut claims, &["0001".into()])
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "DuplicateResource");

        first.force_obs_state(ObsState::Empty);
        check_unallocated(&transport, Telescope::Mid, &subarrays, &mut claims, &["0001".into()])
            .await
            .unwrap();
        assert!(claims.is_empty());
    }
}
