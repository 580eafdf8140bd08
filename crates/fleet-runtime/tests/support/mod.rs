#![allow(dead_code)]

use async_trait::async_trait;
use fleet_core::contracts::{
    CommandRequest, CommandResponse, FixJob, FixRunRequest, MonitorConfig, MonitorConfigPatch,
    MonitorMode, OnlineCheckRequest, OnlineCheckResponse, OnlineResultPayload, RobotList,
    RobotSnapshot, TerminalClientMsg, TestResultPayload, TestRunRequest, TestRunResponse,
};
use fleet_runtime::backend::{FleetBackend, StreamEvent, TerminalStream};
use fleet_runtime::error::BackendError;
use serde_json::json;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use url::Url;

pub fn robot(id: &str, status: &str) -> RobotSnapshot {
    serde_json::from_value(json!({
        "id": id,
        "name": format!("Robot {id}"),
        "type": "rosbot",
        "ip": "10.0.0.1",
        "tests": {
            "battery": { "status": status, "value": "80%", "details": "pack ok" }
        }
    }))
    .expect("snapshot")
}

pub fn result(id: &str, status: &str, details: &str) -> TestResultPayload {
    serde_json::from_value(json!({
        "id": id,
        "status": status,
        "value": "v",
        "details": details,
    }))
    .expect("result payload")
}

pub fn fix_job(run_id: &str, status: &str, results: Vec<TestResultPayload>) -> FixJob {
    let results: Vec<_> = results
        .into_iter()
        .map(|result| {
            json!({
                "id": result.id,
                "status": result.status.as_str(),
                "value": result.value,
                "details": result.details,
            })
        })
        .collect();
    serde_json::from_value(json!({
        "runId": run_id,
        "fixId": "restart",
        "robotId": "r1",
        "status": status,
        "error": if status == "failed" { json!("driver crashed") } else { json!(null) },
        "testRun": { "results": results },
    }))
    .expect("fix job")
}

/// Polls `condition` until it holds or two seconds pass.
pub async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached");
}

/// Blocks callers while closed; each released permit lets one call through.
pub struct Gate {
    closed: AtomicBool,
    permits: Semaphore,
}

impl Gate {
    fn new() -> Self {
        Self {
            closed: AtomicBool::new(false),
            permits: Semaphore::new(0),
        }
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn release(&self, n: usize) {
        self.permits.add_permits(n);
    }

    async fn pass(&self) {
        if self.closed.load(Ordering::SeqCst) {
            if let Ok(permit) = self.permits.acquire().await {
                permit.forget();
            }
        }
    }
}

/// Test-side ends of a terminal stream handed to the runtime.
pub struct StreamHandle {
    pub to_client: mpsc::Sender<StreamEvent>,
    pub from_client: mpsc::Receiver<TerminalClientMsg>,
    pub closer: CancellationToken,
}

pub struct MockBackend {
    pub robots: Mutex<Vec<RobotSnapshot>>,
    pub fail_fetch: AtomicBool,
    pub fetch_gate: Gate,
    pub fetch_calls: AtomicUsize,

    pub test_gate: Gate,
    pub test_results: Mutex<HashMap<String, Vec<TestResultPayload>>>,
    pub failing: Mutex<HashSet<String>>,
    pub panicking: Mutex<HashSet<String>>,
    pub started: Mutex<Vec<String>>,
    pub completed: Mutex<Vec<String>>,
    pub in_flight: AtomicUsize,
    pub max_in_flight: AtomicUsize,

    pub online: Mutex<HashMap<String, OnlineResultPayload>>,
    pub online_requests: Mutex<Vec<OnlineCheckRequest>>,

    pub fix_start: Mutex<Option<FixJob>>,
    pub fix_polls: Mutex<VecDeque<Result<FixJob, u16>>>,

    pub monitor_gate: Gate,
    pub monitor_patches: Mutex<Vec<usize>>,

    pub session_gate: Gate,
    pub session_opens: AtomicUsize,
    pub session_closes: AtomicUsize,
    pub fail_session: AtomicBool,
    pub fail_stream: AtomicBool,
    pub streams: Mutex<Vec<StreamHandle>>,
    pub commands: Mutex<Vec<CommandRequest>>,
    pub fail_commands: AtomicBool,
}

impl MockBackend {
    pub fn new(robots: Vec<RobotSnapshot>) -> Arc<Self> {
        Arc::new(Self {
            robots: Mutex::new(robots),
            fail_fetch: AtomicBool::new(false),
            fetch_gate: Gate::new(),
            fetch_calls: AtomicUsize::new(0),
            test_gate: Gate::new(),
            test_results: Mutex::new(HashMap::new()),
            failing: Mutex::new(HashSet::new()),
            panicking: Mutex::new(HashSet::new()),
            started: Mutex::new(Vec::new()),
            completed: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            online: Mutex::new(HashMap::new()),
            online_requests: Mutex::new(Vec::new()),
            fix_start: Mutex::new(None),
            fix_polls: Mutex::new(VecDeque::new()),
            monitor_gate: Gate::new(),
            monitor_patches: Mutex::new(Vec::new()),
            session_gate: Gate::new(),
            session_opens: AtomicUsize::new(0),
            session_closes: AtomicUsize::new(0),
            fail_session: AtomicBool::new(false),
            fail_stream: AtomicBool::new(false),
            streams: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
            fail_commands: AtomicBool::new(false),
        })
    }

    pub fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    pub fn completed(&self) -> Vec<String> {
        self.completed.lock().unwrap().clone()
    }

    pub fn take_stream(&self) -> Option<StreamHandle> {
        self.streams.lock().unwrap().pop()
    }

    pub fn stream_count(&self) -> usize {
        self.streams.lock().unwrap().len()
    }

    fn unavailable(endpoint: &str) -> BackendError {
        BackendError::Status {
            endpoint: endpoint.to_string(),
            status: 503,
            detail: "unavailable".to_string(),
        }
    }
}

#[async_trait]
impl FleetBackend for MockBackend {
    async fn fetch_robots(&self) -> Result<RobotList, BackendError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.fetch_gate.pass().await;
        if self.fail_fetch.load(Ordering::SeqCst) {
            return Err(BackendError::Transport("connection refused".to_string()));
        }
        Ok(RobotList {
            robots: self.robots.lock().unwrap().clone(),
            rejected: 0,
        })
    }

    async fn run_tests(
        &self,
        robot_id: &str,
        _request: &TestRunRequest,
    ) -> Result<TestRunResponse, BackendError> {
        self.started.lock().unwrap().push(robot_id.to_string());
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        self.test_gate.pass().await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.completed.lock().unwrap().push(robot_id.to_string());

        if self.panicking.lock().unwrap().contains(robot_id) {
            panic!("probe crashed on {robot_id}");
        }
        if self.failing.lock().unwrap().contains(robot_id) {
            return Err(Self::unavailable("tests"));
        }
        let results = self
            .test_results
            .lock()
            .unwrap()
            .get(robot_id)
            .cloned()
            .unwrap_or_else(|| vec![result("battery", "ok", "pack ok")]);
        Ok(TestRunResponse {
            run_id: Some(format!("run-{robot_id}")),
            started_at: None,
            finished_at: None,
            results,
        })
    }

    async fn online_check(
        &self,
        request: &OnlineCheckRequest,
    ) -> Result<OnlineCheckResponse, BackendError> {
        self.online_requests.lock().unwrap().push(request.clone());
        let online = self.online.lock().unwrap();
        Ok(OnlineCheckResponse {
            results: request
                .robot_ids
                .iter()
                .filter_map(|robot_id| online.get(robot_id).cloned())
                .collect(),
        })
    }

    async fn start_fix(
        &self,
        _robot_id: &str,
        _fix_id: &str,
        _request: &FixRunRequest,
    ) -> Result<FixJob, BackendError> {
        self.fix_start
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Self::unavailable("fixes"))
    }

    async fn fix_status(&self, _robot_id: &str, _run_id: &str) -> Result<FixJob, BackendError> {
        match self.fix_polls.lock().unwrap().pop_front() {
            Some(Ok(job)) => Ok(job),
            Some(Err(status)) => Err(BackendError::Status {
                endpoint: "fix-jobs".to_string(),
                status,
                detail: "scripted".to_string(),
            }),
            None => Err(Self::unavailable("fix-jobs")),
        }
    }

    async fn open_terminal_session(
        &self,
        _robot_id: &str,
        _page_session_id: &str,
    ) -> Result<(), BackendError> {
        self.session_opens.fetch_add(1, Ordering::SeqCst);
        self.session_gate.pass().await;
        if self.fail_session.load(Ordering::SeqCst) {
            return Err(Self::unavailable("terminal"));
        }
        Ok(())
    }

    async fn close_terminal_session(
        &self,
        _robot_id: &str,
        _page_session_id: &str,
    ) -> Result<(), BackendError> {
        self.session_closes.fetch_add(1, Ordering::SeqCst);
        Err(Self::unavailable("terminal"))
    }

    async fn open_terminal_stream(&self, _endpoint: &Url) -> Result<TerminalStream, BackendError> {
        if self.fail_stream.load(Ordering::SeqCst) {
            return Err(BackendError::Stream("handshake refused".to_string()));
        }
        let (outbound, from_client) = mpsc::channel(16);
        let (to_client, inbound) = mpsc::channel(16);
        let closer = CancellationToken::new();
        self.streams.lock().unwrap().push(StreamHandle {
            to_client,
            from_client,
            closer: closer.clone(),
        });
        Ok(TerminalStream {
            outbound,
            inbound,
            closer,
        })
    }

    async fn run_command(
        &self,
        _robot_id: &str,
        request: &CommandRequest,
    ) -> Result<CommandResponse, BackendError> {
        self.commands.lock().unwrap().push(request.clone());
        if self.fail_commands.load(Ordering::SeqCst) {
            return Err(BackendError::Transport("connection refused".to_string()));
        }
        Ok(CommandResponse {
            output: format!("ran {}\n", request.command),
            exit_code: Some(0),
        })
    }

    async fn update_monitor_config(
        &self,
        patch: &MonitorConfigPatch,
    ) -> Result<MonitorConfig, BackendError> {
        let parallelism = patch.parallelism.unwrap_or(1);
        self.monitor_patches.lock().unwrap().push(parallelism);
        self.monitor_gate.pass().await;
        Ok(MonitorConfig {
            mode: MonitorMode::OnlineBattery,
            topics_interval_sec: 30.0,
            online_interval_sec: 5.0,
            battery_interval_sec: 10.0,
            parallelism,
        })
    }

    fn stream_endpoint(&self, robot_id: &str, page_session_id: &str) -> Result<Url, BackendError> {
        Url::parse(&format!(
            "ws://backend.test/api/robots/{robot_id}/terminal/ws?pageSessionId={page_session_id}"
        ))
        .map_err(|err| BackendError::Endpoint(err.to_string()))
    }
}
