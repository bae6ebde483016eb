//! Whole-telescope properties that must hold across command sequences.

mod common;

use std::time::Duration;

use common::{low_assign, low_assign_with, mid_assign, TestTelescope, LATENCY};
use rstest::rstest;
use serde_json::json;
use tmc_core::{
    names, AttrValue, DeviceServer, HealthState, ObsState, OpState, ResultCode, SubElementKind,
    TmcConfig, TmcError,
};
use tmc_sim::Fault;

#[tokio::test(start_paused = true)]
async fn every_subscription_is_released_on_standby() {
    let t = TestTelescope::mid().await;
    let baseline = t.transport().subscription_count();

    t.start_up().await;
    assert!(t.transport().subscription_count() > baseline);
    assert!(t.node(1).subscription_count().await > 0);
    t.assign_mid(1, &["0001", "0002"]).await;

    let reply = t
        .central
        .command_inout("StandByTelescope", None)
        .await
        .unwrap();
    assert_eq!(reply.result_code, ResultCode::Ok, "{reply}");
    assert_eq!(t.transport().subscription_count(), baseline);
    assert_eq!(t.node(1).subscription_count().await, 0);
    assert_eq!(t.central.subscription_count().await, 0);
    assert_eq!(t.node(1).attributes().op_state(), Some(OpState::Off));
    assert_eq!(t.node(1).obs_state(), ObsState::Empty);
}

#[tokio::test(start_paused = true)]
async fn a_receptor_is_never_held_twice() {
    let t = TestTelescope::mid().await;
    t.start_up().await;

    let first = t
        .central
        .command_inout("AssignResources", Some(mid_assign(1, &["0001", "0002"])))
        .await
        .unwrap();
    assert_eq!(first.result_code, ResultCode::Started);
    assert_eq!(t.node(1).obs_state(), ObsState::Resourcing);

    let second = t
        .central
        .command_inout("AssignResources", Some(mid_assign(2, &["0002", "0003"])))
        .await;
    assert_eq!(second.unwrap_err().kind(), "DuplicateResource");

    assert!(t.reaches(1, ObsState::Idle, LATENCY * 5).await);
    t.central
        .command_inout("AssignResources", Some(mid_assign(2, &["0003"])))
        .await
        .unwrap();
    assert!(t.reaches(2, ObsState::Idle, LATENCY * 5).await);

    let one = t.node(1).assignment().await.receptors();
    let two = t.node(2).assignment().await.receptors();
    assert!(one.iter().all(|r| !two.contains(r)));
}

#[tokio::test(start_paused = true)]
async fn a_station_is_never_held_twice() {
    let t = TestTelescope::low_with_subarrays(2).await;
    t.start_up().await;

    let first = t
        .central
        .command_inout("AssignResources", Some(low_assign(1)))
        .await
        .unwrap();
    assert_eq!(first.result_code, ResultCode::Started);
    assert_eq!(t.node(1).obs_state(), ObsState::Resourcing);

    let in_flight = t
        .central
        .command_inout("AssignResources", Some(low_assign_with(2, &[2, 3], &[2])))
        .await
        .unwrap_err();
    assert_eq!(
        in_flight,
        TmcError::DuplicateResource {
            ids: vec!["station/2".into()]
        }
    );
    assert!(t.reaches(1, ObsState::Idle, LATENCY * 5).await);
    t.transport().clear_calls();

    let held = t
        .central
        .command_inout("AssignResources", Some(low_assign_with(2, &[3], &[1])))
        .await
        .unwrap_err();
    assert_eq!(
        held,
        TmcError::DuplicateResource {
            ids: vec!["beam/1".into()]
        }
    );
    assert_eq!(t.node(2).obs_state(), ObsState::Empty);
    assert!(t.commands_to(t.node(2).fqdn()).is_empty());

    t.central
        .command_inout("AssignResources", Some(low_assign_with(2, &[3, 4], &[2])))
        .await
        .unwrap();
    assert!(t.reaches(2, ObsState::Idle, LATENCY * 5).await);

    let stations = |id: u32| {
        let held = t
            .node(id)
            .attributes()
            .get(names::ASSIGNED_RESOURCES)
            .and_then(|v| v.to_json())
            .unwrap();
        held["station_ids"].as_array().unwrap().clone()
    };
    let (one, two) = (stations(1), stations(2));
    assert_eq!(one, [json!(1), json!(2)]);
    assert_eq!(two, [json!(3), json!(4)]);
}

#[tokio::test(start_paused = true)]
async fn assign_then_release_restores_empty() {
    let t = TestTelescope::mid().await;
    t.start_up().await;
    t.assign_mid(1, &["0001", "0004"]).await;

    let reply = t
        .central
        .command_inout(
            "ReleaseResources",
            Some(json!({"subarray_id": 1, "release_all": true})),
        )
        .await
        .unwrap();
    assert_eq!(reply.result_code, ResultCode::Started);
    assert!(t.reaches(1, ObsState::Empty, LATENCY * 5).await);
    assert!(t.node(1).assignment().await.is_empty());
    assert_eq!(
        t.node(1).attributes().get(names::RECEPTOR_ID_LIST),
        Some(AttrValue::StringArray(Vec::new()))
    );

    t.assign_mid(2, &["0001"]).await;
}

#[rstest]
#[case::configure("Configure")]
#[case::scan("Scan")]
#[case::end("End")]
#[case::obs_reset("ObsReset")]
#[tokio::test(start_paused = true)]
async fn commands_outside_their_states_are_not_allowed(#[case] command: &str) {
    let t = TestTelescope::mid().await;
    t.start_up().await;
    t.transport().clear_calls();

    let err = t
        .command(1, command, Some(json!({"id": 1})))
        .await
        .unwrap_err();
    assert_eq!(err.result_code(), ResultCode::NotAllowed);
    assert!(t.transport().calls().is_empty());
    assert_eq!(t.node(1).obs_state(), ObsState::Empty);
}

#[tokio::test(start_paused = true)]
async fn stalled_sub_element_times_out_into_fault() {
    let mut config = TmcConfig::default();
    config.telescope.subarrays = 1;
    config.commands.timeout_secs = Some(2);
    let t = TestTelescope::with_config(config).await;
    t.start_up().await;
    t.sims
        .subarray(SubElementKind::Sdp, 1)
        .unwrap()
        .faults()
        .arm("AssignResources", Fault::Stall);

    t.central
        .command_inout(
            "AssignResources",
            Some(json!({"subarrayID": 1, "dish": {"receptorIDList": ["0001"]}, "sdp": {"id": "pb-1"}})),
        )
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(t.node(1).obs_state(), ObsState::Resourcing);

    assert!(t.reaches(1, ObsState::Fault, Duration::from_secs(2)).await);
    let result = t
        .node(1)
        .attributes()
        .get(names::COMMAND_RESULT)
        .and_then(|v| v.to_json())
        .unwrap();
    assert_eq!(result["command"], json!("AssignResources"));
    assert_eq!(result["resultCode"], json!("FAILED"));
    assert!(result["message"].as_str().unwrap().contains("timed out"));
}

#[tokio::test(start_paused = true)]
async fn telescope_health_rolls_up_from_sub_elements() {
    let t = TestTelescope::mid().await;
    t.start_up().await;
    assert_eq!(t.central.telescope_health(), HealthState::Ok);

    t.sims
        .subarray(SubElementKind::Csp, 2)
        .unwrap()
        .set_health(HealthState::Degraded);
    tokio::time::sleep(LATENCY).await;
    assert_eq!(t.node(2).attributes().health_state(), Some(HealthState::Degraded));
    assert_eq!(t.central.telescope_health(), HealthState::Degraded);

    t.sims.masters[&SubElementKind::Sdp].set_health(HealthState::Failed);
    tokio::time::sleep(LATENCY).await;
    assert_eq!(t.central.telescope_health(), HealthState::Failed);
}
