mod support;

use fleet_runtime::scheduler::BoundedScheduler;
use fleet_runtime::store::{ActivityKind, FleetStore};
use fleet_runtime::{FleetBackend, OperationError};
use fleet_core::contracts::TestRunRequest;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use support::{robot, wait_until, MockBackend};
use tokio_util::sync::CancellationToken;

fn fleet(n: usize) -> (Arc<FleetStore>, Arc<MockBackend>, Vec<String>) {
    let ids: Vec<String> = (1..=n).map(|i| format!("r{i}")).collect();
    let robots = ids.iter().map(|id| robot(id, "ok")).collect();
    let store = Arc::new(FleetStore::default());
    let backend = MockBackend::new(robots);
    store.replace_all(backend.robots.lock().unwrap().clone());
    (store, backend, ids)
}

fn spawn_tests(
    scheduler: &Arc<BoundedScheduler>,
    backend: &Arc<MockBackend>,
    ids: Vec<String>,
) -> fleet_runtime::BatchTask {
    let backend = Arc::clone(backend);
    scheduler.spawn(ActivityKind::Testing, ids, move |robot_id| {
        let backend = Arc::clone(&backend);
        async move {
            let request = TestRunRequest {
                test_ids: None,
                page_session_id: "console-test".to_string(),
            };
            backend
                .run_tests(&robot_id, &request)
                .await
                .map(|_| ())
                .map_err(OperationError::from)
        }
    })
}

#[tokio::test]
async fn third_robot_starts_only_after_a_completion() {
    let (store, backend, ids) = fleet(5);
    backend.test_gate.close();
    let scheduler = Arc::new(BoundedScheduler::new(Arc::clone(&store), 2));

    let task = spawn_tests(&scheduler, &backend, ids.clone());
    wait_until(|| backend.started().len() == 2).await;
    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(backend.started().len(), 2);
    for id in &ids {
        assert!(store.is_busy(id), "{id} should be marked before work starts");
    }

    backend.test_gate.release(1);
    wait_until(|| backend.started().len() == 3).await;
    assert_eq!(backend.completed().len(), 1);

    backend.test_gate.release(4);
    let report = task.join().await.unwrap();
    assert_eq!(report.succeeded.len(), 5);
    assert!(report.is_clean());
    assert_eq!(backend.max_in_flight.load(Ordering::SeqCst), 2);
    for id in &ids {
        assert!(!store.is_busy(id));
    }
}

#[tokio::test]
async fn duplicate_ids_run_once() {
    let (store, backend, _) = fleet(3);
    let scheduler = Arc::new(BoundedScheduler::new(store, 4));
    let ids = vec!["r1", "r2", "r1", " r3 ", "r2", ""]
        .into_iter()
        .map(String::from)
        .collect();

    let report = spawn_tests(&scheduler, &backend, ids).join().await.unwrap();
    assert_eq!(report.requested, 3);
    assert_eq!(report.processed(), 3);
    let mut started = backend.started();
    started.sort();
    assert_eq!(started, vec!["r1", "r2", "r3"]);
}

#[tokio::test]
async fn never_exceeds_robot_count() {
    let (store, backend, ids) = fleet(3);
    backend.test_gate.close();
    let scheduler = Arc::new(BoundedScheduler::new(store, 50));

    let task = spawn_tests(&scheduler, &backend, ids);
    wait_until(|| backend.started().len() == 3).await;
    backend.test_gate.release(3);
    let report = task.join().await.unwrap();
    assert_eq!(report.succeeded.len(), 3);
    assert!(backend.max_in_flight.load(Ordering::SeqCst) <= 3);
}

#[tokio::test]
async fn failures_and_panics_do_not_stop_the_batch() {
    let (store, backend, ids) = fleet(4);
    backend.failing.lock().unwrap().insert("r2".to_string());
    backend.panicking.lock().unwrap().insert("r3".to_string());
    let scheduler = Arc::new(BoundedScheduler::new(Arc::clone(&store), 2));

    let report = spawn_tests(&scheduler, &backend, ids.clone()).join().await.unwrap();
    assert_eq!(report.processed(), 4);
    assert_eq!(report.succeeded.len(), 2);
    let mut failed: Vec<_> = report.failed.iter().map(|f| f.robot_id.as_str()).collect();
    failed.sort();
    assert_eq!(failed, vec!["r2", "r3"]);
    assert!(report
        .failed
        .iter()
        .any(|f| f.error.contains("operation panicked")));
    for id in &ids {
        assert!(!store.is_busy(id));
    }
}

#[tokio::test]
async fn busy_robots_are_skipped() {
    let (store, backend, ids) = fleet(3);
    let begun = store.try_begin(ActivityKind::Fixing, &["r2".to_string()]);
    assert_eq!(begun.accepted, vec!["r2"]);
    let scheduler = Arc::new(BoundedScheduler::new(Arc::clone(&store), 2));

    let report = spawn_tests(&scheduler, &backend, ids).join().await.unwrap();
    assert_eq!(report.skipped, vec!["r2"]);
    assert_eq!(report.succeeded.len(), 2);
    assert!(!backend.started().contains(&"r2".to_string()));
    assert!(store.local_activity("r2").fixing);
}

#[tokio::test]
async fn cancel_releases_every_robot() {
    let (store, backend, ids) = fleet(4);
    backend.test_gate.close();
    let scheduler = Arc::new(BoundedScheduler::new(Arc::clone(&store), 1));

    let task = spawn_tests(&scheduler, &backend, ids.clone());
    wait_until(|| backend.started().len() == 1).await;
    task.cancel();
    let report = task.join().await.unwrap();

    assert_eq!(report.succeeded.len(), 0);
    assert_eq!(report.cancelled.len(), 4);
    assert_eq!(backend.started().len(), 1);
    for id in &ids {
        assert!(!store.is_busy(id));
        assert!(store.countdown(id).is_none());
    }
}

#[tokio::test]
async fn empty_batch_is_a_no_op() {
    let (store, backend, _) = fleet(1);
    let scheduler = BoundedScheduler::new(store, 3);
    let report = scheduler
        .run(
            ActivityKind::Searching,
            Vec::new(),
            CancellationToken::new(),
            |_robot_id| async { Ok::<(), OperationError>(()) },
        )
        .await;
    assert_eq!(report.requested, 0);
    assert!(report.is_clean());
    assert!(backend.started().is_empty());
}
