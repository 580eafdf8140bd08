//! Test, reachability and fix workflows composed from the scheduler, the
//! store and the backend contract.

use crate::backend::FleetBackend;
use crate::config::RuntimeConfig;
use crate::error::OperationError;
use crate::monitor_sync::{AlignOutcome, MonitorAligner};
use crate::scheduler::{BatchTask, BoundedScheduler};
use crate::store::{ActivityKind, FleetStore};
use chrono::Utc;
use fleet_core::contracts::{
    FixJobStatus, FixRunRequest, OnlineCheckRequest, TestRunRequest, TestRunResponse,
};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

pub const MANUAL_SOURCE: &str = "manual";
pub const FIX_SOURCE: &str = "auto-fix";

#[derive(Debug, Clone)]
pub struct OperationSettings {
    pub online_timeout_sec: f64,
    pub fix_poll_interval: Duration,
    pub fix_settle_delay: Duration,
    pub fix_timeout: Duration,
}

impl From<&RuntimeConfig> for OperationSettings {
    fn from(config: &RuntimeConfig) -> Self {
        Self {
            online_timeout_sec: config.online_timeout_sec,
            fix_poll_interval: config.fix_poll_interval,
            fix_settle_delay: config.fix_settle_delay,
            fix_timeout: config.fix_timeout,
        }
    }
}

pub struct FleetOperations {
    store: Arc<FleetStore>,
    backend: Arc<dyn FleetBackend>,
    scheduler: Arc<BoundedScheduler>,
    aligner: MonitorAligner,
    page_session_id: String,
    settings: OperationSettings,
}

impl FleetOperations {
    pub fn new(
        store: Arc<FleetStore>,
        backend: Arc<dyn FleetBackend>,
        scheduler: Arc<BoundedScheduler>,
        page_session_id: String,
        settings: OperationSettings,
    ) -> Self {
        Self {
            aligner: MonitorAligner::new(Arc::clone(&backend)),
            store,
            backend,
            scheduler,
            page_session_id,
            settings,
        }
    }

    pub fn scheduler(&self) -> &Arc<BoundedScheduler> {
        &self.scheduler
    }

    /// Runs tests on every robot. `None` or an empty filter runs the full
    /// suite and stamps the robot's last full run.
    pub fn run_tests(self: &Arc<Self>, robot_ids: Vec<String>, test_ids: Option<Vec<String>>) -> BatchTask {
        let ops = Arc::clone(self);
        self.scheduler
            .spawn(ActivityKind::Testing, robot_ids, move |robot_id| {
                let ops = Arc::clone(&ops);
                let test_ids = test_ids.clone();
                async move { ops.test_robot(&robot_id, test_ids).await }
            })
    }

    pub async fn test_robot(
        &self,
        robot_id: &str,
        test_ids: Option<Vec<String>>,
    ) -> Result<(), OperationError> {
        let test_ids = test_ids.filter(|ids| !ids.is_empty());
        let full_run = test_ids.is_none();
        let request = TestRunRequest {
            test_ids,
            page_session_id: self.page_session_id.clone(),
        };
        let response = self.backend.run_tests(robot_id, &request).await?;
        debug!(
            event = "tests_completed",
            robot_id,
            results = response.results.len(),
            full_run
        );
        self.store
            .apply_test_run(robot_id, &response, full_run, MANUAL_SOURCE, Utc::now());
        Ok(())
    }

    /// Reachability sweep. Each robot is probed alone so the fleet bound,
    /// not the backend, limits concurrency.
    pub fn check_online(self: &Arc<Self>, robot_ids: Vec<String>, force_refresh: bool) -> BatchTask {
        let ops = Arc::clone(self);
        self.scheduler
            .spawn(ActivityKind::Searching, robot_ids, move |robot_id| {
                let ops = Arc::clone(&ops);
                async move { ops.check_robot_online(&robot_id, force_refresh).await }
            })
    }

    pub async fn check_robot_online(
        &self,
        robot_id: &str,
        force_refresh: bool,
    ) -> Result<(), OperationError> {
        let request = OnlineCheckRequest {
            robot_ids: vec![robot_id.to_string()],
            force_refresh,
            timeout_sec: self.settings.online_timeout_sec,
            parallelism: 1,
            page_session_id: self.page_session_id.clone(),
        };
        let response = self.backend.online_check(&request).await?;
        let results: Vec<_> = response
            .results
            .into_iter()
            .filter(|result| result.robot_id == robot_id)
            .collect();
        if results.is_empty() {
            return Err(OperationError::MissingResult(robot_id.to_string()));
        }
        self.store.apply_online_results(&results, Utc::now());
        Ok(())
    }

    pub fn run_fix(
        self: &Arc<Self>,
        fix_id: String,
        robot_ids: Vec<String>,
        params: Option<Map<String, Value>>,
    ) -> BatchTask {
        let ops = Arc::clone(self);
        self.scheduler
            .spawn(ActivityKind::Fixing, robot_ids, move |robot_id| {
                let ops = Arc::clone(&ops);
                let fix_id = fix_id.clone();
                let params = params.clone();
                async move { ops.fix_robot(&robot_id, &fix_id, params).await }
            })
    }

    /// Starts a fix job, polls it to completion, waits for the robot to
    /// settle, then merges the job's post-fix test results.
    pub async fn fix_robot(
        &self,
        robot_id: &str,
        fix_id: &str,
        params: Option<Map<String, Value>>,
    ) -> Result<(), OperationError> {
        let request = FixRunRequest {
            page_session_id: self.page_session_id.clone(),
            params,
        };
        let mut job = self.backend.start_fix(robot_id, fix_id, &request).await?;
        info!(event = "fix_started", robot_id, fix_id, run_id = %job.run_id);

        let started = Instant::now();
        let deadline = started + self.settings.fix_timeout;
        while !job.status.is_terminal() {
            if Instant::now() >= deadline {
                return Err(OperationError::FixTimedOut {
                    fix_id: fix_id.to_string(),
                    waited_ms: started.elapsed().as_millis(),
                });
            }
            tokio::time::sleep(self.settings.fix_poll_interval).await;
            job = match self.backend.fix_status(robot_id, &job.run_id).await {
                Ok(next) => next,
                Err(err) if err.is_transient() => {
                    debug!(event = "fix_poll_retry", robot_id, error = %err);
                    continue;
                }
                Err(err) => return Err(err.into()),
            };
        }

        if job.status == FixJobStatus::Failed {
            return Err(OperationError::FixFailed {
                fix_id: fix_id.to_string(),
                reason: job.error.clone().unwrap_or_else(|| "fix failed".to_string()),
            });
        }
        info!(
            event = "fix_succeeded",
            robot_id,
            fix_id,
            run_id = %job.run_id,
            events = job.events.len()
        );

        tokio::time::sleep(self.settings.fix_settle_delay).await;
        let results = job.post_test_results();
        if !results.is_empty() {
            let response = TestRunResponse {
                run_id: Some(job.run_id.clone()),
                started_at: job.started_at,
                finished_at: job.finished_at,
                results: results.to_vec(),
            };
            self.store
                .apply_test_run(robot_id, &response, false, FIX_SOURCE, Utc::now());
        }
        Ok(())
    }

    /// Updates the local bound and aligns the backend monitor with it.
    pub async fn set_parallelism(&self, parallelism: usize) -> (usize, AlignOutcome) {
        let applied = self.scheduler.set_parallelism(parallelism);
        let outcome = self.aligner.align(applied).await;
        (applied, outcome)
    }
}
