mod support;

use fleet_core::contracts::OnlineResultPayload;
use fleet_core::{CheckStatus, REACHABILITY_CHECK_ID};
use fleet_runtime::monitor_sync::AlignOutcome;
use fleet_runtime::operations::{FleetOperations, OperationSettings, FIX_SOURCE, MANUAL_SOURCE};
use fleet_runtime::scheduler::BoundedScheduler;
use fleet_runtime::store::FleetStore;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use support::{fix_job, result, robot, wait_until, MockBackend};

fn operations(backend: &Arc<MockBackend>) -> (Arc<FleetStore>, Arc<FleetOperations>) {
    let store = Arc::new(FleetStore::default());
    store.replace_all(backend.robots.lock().unwrap().clone());
    let scheduler = Arc::new(BoundedScheduler::new(Arc::clone(&store), 4));
    let settings = OperationSettings {
        online_timeout_sec: 2.5,
        fix_poll_interval: Duration::from_millis(50),
        fix_settle_delay: Duration::from_millis(100),
        fix_timeout: Duration::from_secs(2),
    };
    let ops = Arc::new(FleetOperations::new(
        Arc::clone(&store),
        backend.clone(),
        scheduler,
        "console-test".to_string(),
        settings,
    ));
    (store, ops)
}

fn online(robot_id: &str, status: &str, details: &str) -> OnlineResultPayload {
    serde_json::from_value(json!({
        "robotId": robot_id,
        "status": status,
        "value": if status == "ok" { "online" } else { "offline" },
        "details": details,
    }))
    .unwrap()
}

#[tokio::test]
async fn full_test_run_stamps_and_infers_reachability() {
    let backend = MockBackend::new(vec![robot("r1", "warning")]);
    let (store, ops) = operations(&backend);

    let report = ops.run_tests(vec!["r1".to_string()], None).join().await.unwrap();
    assert!(report.is_clean());

    let record = store.robot("r1").unwrap();
    let battery = record.check("battery").unwrap();
    assert_eq!(battery.status, CheckStatus::Ok);
    assert_eq!(battery.source.as_deref(), Some(MANUAL_SOURCE));
    assert!(record.activity.last_full_test_at.is_some());
    assert_eq!(record.activity.last_full_test_source.as_deref(), Some(MANUAL_SOURCE));
    let reachability = record.check(REACHABILITY_CHECK_ID).unwrap();
    assert_eq!(reachability.status, CheckStatus::Ok);
    assert!(reachability.is_inferred());
    assert_eq!(record.test_debug["battery"].run_id.as_deref(), Some("run-r1"));
}

#[tokio::test]
async fn filtered_run_leaves_full_run_stamp_alone() {
    let backend = MockBackend::new(vec![robot("r1", "ok")]);
    backend
        .test_results
        .lock()
        .unwrap()
        .insert("r1".to_string(), vec![result("ssh", "error", "SSH connect timed out")]);
    let (store, ops) = operations(&backend);

    ops.test_robot("r1", Some(vec!["ssh".to_string()]))
        .await
        .unwrap();
    let record = store.robot("r1").unwrap();
    assert!(record.activity.last_full_test_at.is_none());
    assert_eq!(
        record.check(REACHABILITY_CHECK_ID).unwrap().status,
        CheckStatus::Error
    );
}

#[tokio::test]
async fn online_sweep_probes_each_robot_alone() {
    let backend = MockBackend::new(vec![robot("r1", "ok"), robot("r2", "ok")]);
    backend
        .online
        .lock()
        .unwrap()
        .insert("r1".to_string(), online("r1", "ok", "ssh ok"));
    let (store, ops) = operations(&backend);

    let report = ops
        .check_online(vec!["r1".to_string(), "r2".to_string()], true)
        .join()
        .await
        .unwrap();
    assert_eq!(report.succeeded, vec!["r1"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].robot_id, "r2");

    let requests = backend.online_requests.lock().unwrap().clone();
    assert_eq!(requests.len(), 2);
    for request in &requests {
        assert_eq!(request.robot_ids.len(), 1);
        assert_eq!(request.parallelism, 1);
        assert!(request.force_refresh);
        assert_eq!(request.timeout_sec, 2.5);
    }
    let reachability = store.robot("r1").unwrap();
    assert_eq!(
        reachability.check(REACHABILITY_CHECK_ID).unwrap().status,
        CheckStatus::Ok
    );
    assert!(store.robot("r2").unwrap().check(REACHABILITY_CHECK_ID).is_none());
}

#[tokio::test(start_paused = true)]
async fn fix_polls_through_transient_errors_and_merges_results() {
    let backend = MockBackend::new(vec![robot("r1", "error")]);
    *backend.fix_start.lock().unwrap() = Some(fix_job("job-1", "running", Vec::new()));
    {
        let mut polls = backend.fix_polls.lock().unwrap();
        polls.push_back(Err(503));
        polls.push_back(Ok(fix_job("job-1", "running", Vec::new())));
        polls.push_back(Ok(fix_job(
            "job-1",
            "succeeded",
            vec![result("battery", "ok", "recovered")],
        )));
    }
    let (store, ops) = operations(&backend);

    let report = ops
        .run_fix("restart".to_string(), vec!["r1".to_string()], None)
        .join()
        .await
        .unwrap();
    assert!(report.is_clean(), "{report}");

    let record = store.robot("r1").unwrap();
    let battery = record.check("battery").unwrap();
    assert_eq!(battery.status, CheckStatus::Ok);
    assert_eq!(battery.details, "recovered");
    assert_eq!(battery.source.as_deref(), Some(FIX_SOURCE));
    assert!(!store.is_busy("r1"));
}

#[tokio::test(start_paused = true)]
async fn failed_fix_reports_backend_reason() {
    let backend = MockBackend::new(vec![robot("r1", "error")]);
    *backend.fix_start.lock().unwrap() = Some(fix_job("job-2", "queued", Vec::new()));
    backend
        .fix_polls
        .lock()
        .unwrap()
        .push_back(Ok(fix_job("job-2", "failed", Vec::new())));
    let (store, ops) = operations(&backend);

    let report = ops
        .run_fix("restart".to_string(), vec!["r1".to_string()], None)
        .join()
        .await
        .unwrap();
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].error.contains("driver crashed"));
    assert_eq!(
        store.robot("r1").unwrap().check("battery").unwrap().status,
        CheckStatus::Error
    );
}

#[tokio::test(start_paused = true)]
async fn fix_gives_up_at_the_deadline() {
    let backend = MockBackend::new(vec![robot("r1", "error")]);
    *backend.fix_start.lock().unwrap() = Some(fix_job("job-3", "running", Vec::new()));
    let (_store, ops) = operations(&backend);

    let err = ops.fix_robot("r1", "restart", None).await.unwrap_err();
    assert!(err.to_string().contains("did not finish"), "{err}");
}

#[tokio::test]
async fn monitor_alignment_keeps_only_the_latest_target() {
    let backend = MockBackend::new(vec![robot("r1", "ok")]);
    backend.monitor_gate.close();
    let (_store, ops) = operations(&backend);

    let first = tokio::spawn({
        let ops = Arc::clone(&ops);
        async move { ops.set_parallelism(4).await }
    });
    wait_until(|| backend.monitor_patches.lock().unwrap().len() == 1).await;
    assert_eq!(ops.set_parallelism(6).await, (6, AlignOutcome::Queued));
    assert_eq!(ops.set_parallelism(9).await, (9, AlignOutcome::Queued));

    backend.monitor_gate.release(2);
    assert_eq!(first.await.unwrap(), (4, AlignOutcome::Applied(9)));
    assert_eq!(*backend.monitor_patches.lock().unwrap(), vec![4, 9]);
    assert_eq!(ops.scheduler().parallelism(), 9);

    backend.monitor_gate.release(1);
    assert_eq!(ops.set_parallelism(9).await, (9, AlignOutcome::Unchanged(9)));
    assert_eq!(ops.set_parallelism(500).await, (100, AlignOutcome::Applied(100)));
}
