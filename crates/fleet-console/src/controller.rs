//! Wires the runtime together for one console process and renders fleet
//! state as plain text lines.

use anyhow::Context;
use fleet_core::{new_page_session_id, CheckStatus, RobotRecord, REACHABILITY_CHECK_ID};
use fleet_runtime::operations::OperationSettings;
use fleet_runtime::{
    BatchReport, BatchTask, BoundedScheduler, FleetBackend, FleetOperations, FleetStore,
    HttpBackend, Reconciler, RuntimeConfig, SessionManager,
};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::info;

const PROGRESS_INTERVAL: Duration = Duration::from_secs(2);

pub struct Console {
    pub store: Arc<FleetStore>,
    pub ops: Arc<FleetOperations>,
    pub reconciler: Arc<Reconciler>,
    pub sessions: SessionManager,
    pub page_session_id: String,
}

impl Console {
    pub fn build(config: &RuntimeConfig) -> anyhow::Result<Self> {
        let backend: Arc<dyn FleetBackend> = Arc::new(
            HttpBackend::new(config.backend_url.clone()).context("building backend client")?,
        );
        let page_session_id = new_page_session_id();
        let store = Arc::new(FleetStore::new(config.windows, config.smoothing));
        let scheduler = Arc::new(BoundedScheduler::new(Arc::clone(&store), config.parallelism));
        let ops = Arc::new(FleetOperations::new(
            Arc::clone(&store),
            Arc::clone(&backend),
            scheduler,
            page_session_id.clone(),
            OperationSettings::from(config),
        ));
        let reconciler = Arc::new(Reconciler::new(
            Arc::clone(&store),
            Arc::clone(&backend),
            config.poll_interval,
        ));
        let sessions = SessionManager::new(
            Arc::clone(&store),
            backend,
            page_session_id.clone(),
            config,
        );
        info!(
            event = "console_started",
            backend = %config.backend_url,
            page_session_id = %page_session_id,
            parallelism = config.parallelism
        );
        Ok(Self {
            store,
            ops,
            reconciler,
            sessions,
            page_session_id,
        })
    }

    pub async fn load(&self) -> anyhow::Result<usize> {
        let ids = self
            .reconciler
            .load()
            .await
            .context("loading the fleet")?;
        Ok(ids.len())
    }

    /// Turns command-line ids into the working selection.
    pub fn select_targets(&self, ids: &[String], all: bool) -> anyhow::Result<Vec<String>> {
        self.store.clear_selection();
        if all {
            self.store.select_all();
        } else {
            let unknown: Vec<&str> = ids
                .iter()
                .map(|id| id.trim())
                .filter(|id| !self.store.select(id))
                .collect();
            if !unknown.is_empty() {
                anyhow::bail!("unknown robot id(s): {}", unknown.join(", "));
            }
        }
        let selected = self.store.selected();
        if selected.is_empty() {
            anyhow::bail!("no robots selected; pass robot ids or --all");
        }
        Ok(selected)
    }

    /// Waits for a batch, printing countdowns while it runs. Cancelling
    /// `shutdown` cancels the batch and still returns its report.
    pub async fn wait_batch(
        &self,
        task: BatchTask,
        shutdown: &CancellationToken,
    ) -> anyhow::Result<BatchReport> {
        let batch_cancel = task.cancellation();
        let mut join = Box::pin(task.join());
        let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        ticker.tick().await;
        loop {
            tokio::select! {
                report = &mut join => return report.context("batch task failed"),
                _ = shutdown.cancelled(), if !batch_cancel.is_cancelled() => {
                    eprintln!("cancelling...");
                    batch_cancel.cancel();
                }
                _ = ticker.tick() => self.print_progress(),
            }
        }
    }

    fn print_progress(&self) {
        let now = Instant::now();
        let mut lines = Vec::new();
        for robot_id in self.store.robot_ids() {
            if let Some(label) = self.store.countdown_label(&robot_id, now) {
                lines.push(format!("{robot_id} {label}"));
            }
        }
        if !lines.is_empty() {
            eprintln!("  .. {}", lines.join(" | "));
        }
    }

    pub fn print_robots(&self, robot_ids: impl IntoIterator<Item = String>, detailed: bool) {
        let now = Instant::now();
        for robot_id in robot_ids {
            let Some(record) = self.store.robot(&robot_id) else {
                continue;
            };
            let label = self.store.countdown_label(&robot_id, now);
            println!("{}", render_robot(&record, label.as_deref()));
            if detailed {
                for line in render_checks(&record) {
                    println!("{line}");
                }
            }
        }
    }

    /// Polls until `shutdown`, printing each robot whose state changed.
    pub async fn watch(&self, shutdown: &CancellationToken) -> anyhow::Result<()> {
        self.load().await?;
        self.print_robots(self.store.robot_ids(), false);
        let (tx, mut rx) = mpsc::channel::<BTreeSet<String>>(16);
        let handle = Arc::clone(&self.reconciler).spawn(tx, shutdown.clone());
        while let Some(changed) = rx.recv().await {
            self.print_robots(changed, false);
        }
        handle.await.context("reconciler task failed")?;
        Ok(())
    }
}

pub fn render_robot(record: &RobotRecord, countdown: Option<&str>) -> String {
    let overall = record
        .overall_status()
        .map(|status| status.as_str())
        .unwrap_or("-");
    let online = record
        .check(REACHABILITY_CHECK_ID)
        .map(|check| {
            if check.is_inferred() {
                format!("{}*", check.status)
            } else {
                check.status.to_string()
            }
        })
        .unwrap_or_else(|| "?".to_string());
    let mut line = format!(
        "{:<14} {:<20} {:<8} online={:<9}",
        record.id, record.name, overall, online
    );
    if record.activity.is_busy() {
        line.push_str(" [backend busy]");
    }
    if let Some(countdown) = countdown {
        line.push_str(&format!(" [{countdown}]"));
    }
    line.trim_end().to_string()
}

pub fn render_checks(record: &RobotRecord) -> Vec<String> {
    record
        .tests
        .iter()
        .map(|(check_id, check)| {
            let marker = match check.status {
                CheckStatus::Ok => " ",
                CheckStatus::Warning => "!",
                CheckStatus::Error => "x",
            };
            format!(
                "  {marker} {check_id:<16} {:<8} {} ({})",
                check.status.as_str(),
                check.display_value(),
                check.display_details()
            )
        })
        .collect()
}

pub fn print_report(report: &BatchReport) {
    println!("{report}");
    for failure in &report.failed {
        println!("  failed  {}: {}", failure.robot_id, failure.error);
    }
    if !report.skipped.is_empty() {
        println!("  busy    {}", report.skipped.join(", "));
    }
    if !report.cancelled.is_empty() {
        println!("  stopped {}", report.cancelled.join(", "));
    }
}

/// `key=value`; the value is taken as JSON when it parses, else as text.
pub fn parse_param(raw: &str) -> Result<(String, Value), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty parameter name in {raw:?}"));
    }
    let value = serde_json::from_str(value.trim())
        .unwrap_or_else(|_| Value::String(value.trim().to_string()));
    Ok((key.to_string(), value))
}

pub fn params_map(params: Vec<(String, Value)>) -> Option<Map<String, Value>> {
    if params.is_empty() {
        None
    } else {
        Some(params.into_iter().collect())
    }
}
