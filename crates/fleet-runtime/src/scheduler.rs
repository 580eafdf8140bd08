//! Bounded fan-out of per-robot operations.
//!
//! A batch dedupes its robot ids, marks them active in the store before any
//! work starts, then drains a shared queue with at most `min(P, n)` workers
//! joined on the calling task.

use crate::config::clamp_parallelism;
use crate::store::{ActivityKind, FleetStore};
use futures_util::future::join_all;
use futures_util::FutureExt;
use std::any::Any;
use std::collections::{HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::task::{JoinError, JoinHandle};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchFailure {
    pub robot_id: String,
    pub error: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchReport {
    pub kind: ActivityKind,
    pub requested: usize,
    pub succeeded: Vec<String>,
    pub failed: Vec<BatchFailure>,
    /// Already busy with another operation when the batch started.
    pub skipped: Vec<String>,
    pub cancelled: Vec<String>,
}

impl BatchReport {
    fn new(kind: ActivityKind, requested: usize) -> Self {
        Self {
            kind,
            requested,
            succeeded: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
            cancelled: Vec::new(),
        }
    }

    pub fn processed(&self) -> usize {
        self.succeeded.len() + self.failed.len()
    }

    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty() && self.cancelled.is_empty()
    }

    /// Every robot that went through a worker, in completion order.
    pub fn touched(&self) -> impl Iterator<Item = &str> {
        self.succeeded
            .iter()
            .map(String::as_str)
            .chain(self.failed.iter().map(|failure| failure.robot_id.as_str()))
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} requested, {} ok, {} failed, {} skipped, {} cancelled",
            self.kind.as_str(),
            self.requested,
            self.succeeded.len(),
            self.failed.len(),
            self.skipped.len(),
            self.cancelled.len()
        )
    }
}

enum ItemOutcome {
    Succeeded,
    Failed(String),
    Cancelled,
}

/// A batch running on its own task with its own cancellation token.
#[derive(Debug)]
pub struct BatchTask {
    cancel: CancellationToken,
    handle: JoinHandle<BatchReport>,
}

impl BatchTask {
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub async fn join(self) -> Result<BatchReport, JoinError> {
        self.handle.await
    }
}

#[derive(Debug)]
pub struct BoundedScheduler {
    store: Arc<FleetStore>,
    parallelism: AtomicUsize,
}

impl BoundedScheduler {
    pub fn new(store: Arc<FleetStore>, parallelism: usize) -> Self {
        Self {
            store,
            parallelism: AtomicUsize::new(clamp_parallelism(parallelism)),
        }
    }

    pub fn parallelism(&self) -> usize {
        self.parallelism.load(Ordering::SeqCst)
    }

    /// Applies to batches started afterwards. Returns the clamped value.
    pub fn set_parallelism(&self, parallelism: usize) -> usize {
        let clamped = clamp_parallelism(parallelism);
        self.parallelism.store(clamped, Ordering::SeqCst);
        clamped
    }

    pub async fn run<F, Fut, E>(
        &self,
        kind: ActivityKind,
        robot_ids: Vec<String>,
        cancel: CancellationToken,
        op: F,
    ) -> BatchReport
    where
        F: Fn(String) -> Fut + Send + Sync,
        Fut: Future<Output = Result<(), E>> + Send,
        E: fmt::Display,
    {
        let requested = dedupe(robot_ids);
        let mut report = BatchReport::new(kind, requested.len());
        if requested.is_empty() {
            return report;
        }

        let begin = self.store.try_begin(kind, &requested);
        for robot_id in &begin.skipped {
            debug!(event = "batch_item_skipped", kind = kind.as_str(), robot_id = %robot_id);
        }
        report.skipped = begin.skipped;
        if begin.accepted.is_empty() {
            return report;
        }

        let workers = self.parallelism().min(begin.accepted.len());
        info!(
            event = "batch_started",
            kind = kind.as_str(),
            robots = begin.accepted.len(),
            workers
        );
        let queue = Mutex::new(VecDeque::from(begin.accepted));
        let outcomes = Mutex::new(Vec::new());
        join_all((0..workers).map(|_| self.worker(kind, &queue, &outcomes, &cancel, &op))).await;

        let leftover = queue.into_inner().unwrap_or_else(PoisonError::into_inner);
        for robot_id in leftover {
            self.store.finish(kind, &robot_id, None);
            report.cancelled.push(robot_id);
        }
        for (robot_id, outcome) in outcomes
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner)
        {
            match outcome {
                ItemOutcome::Succeeded => report.succeeded.push(robot_id),
                ItemOutcome::Failed(error) => report.failed.push(BatchFailure { robot_id, error }),
                ItemOutcome::Cancelled => report.cancelled.push(robot_id),
            }
        }
        info!(
            event = "batch_finished",
            kind = kind.as_str(),
            succeeded = report.succeeded.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            cancelled = report.cancelled.len()
        );
        report
    }

    async fn worker<F, Fut, E>(
        &self,
        kind: ActivityKind,
        queue: &Mutex<VecDeque<String>>,
        outcomes: &Mutex<Vec<(String, ItemOutcome)>>,
        cancel: &CancellationToken,
        op: &F,
    ) where
        F: Fn(String) -> Fut + Send + Sync,
        Fut: Future<Output = Result<(), E>> + Send,
        E: fmt::Display,
    {
        loop {
            if cancel.is_cancelled() {
                break;
            }
            let next = queue
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .pop_front();
            let Some(robot_id) = next else {
                break;
            };

            let started = Instant::now();
            let attempt = AssertUnwindSafe(async { op(robot_id.clone()).await }).catch_unwind();
            let outcome = tokio::select! {
                biased;
                _ = cancel.cancelled() => ItemOutcome::Cancelled,
                result = attempt => match result {
                    Ok(Ok(())) => ItemOutcome::Succeeded,
                    Ok(Err(err)) => ItemOutcome::Failed(err.to_string()),
                    Err(panic) => ItemOutcome::Failed(panic_message(panic)),
                },
            };

            let elapsed = match outcome {
                ItemOutcome::Cancelled => None,
                _ => Some(started.elapsed()),
            };
            if let ItemOutcome::Failed(error) = &outcome {
                warn!(
                    event = "batch_item_failed",
                    kind = kind.as_str(),
                    robot_id = %robot_id,
                    error = %error
                );
            }
            self.store.finish(kind, &robot_id, elapsed);
            outcomes
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .push((robot_id, outcome));
        }
    }

    /// Runs a batch on a new task. Cancelling the returned handle stops
    /// dequeuing and abandons in-flight operations.
    pub fn spawn<F, Fut, E>(
        self: &Arc<Self>,
        kind: ActivityKind,
        robot_ids: Vec<String>,
        op: F,
    ) -> BatchTask
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), E>> + Send + 'static,
        E: fmt::Display + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let scheduler = Arc::clone(self);
        let token = cancel.clone();
        let handle = tokio::spawn(async move { scheduler.run(kind, robot_ids, token, op).await });
        BatchTask { cancel, handle }
    }
}

/// First occurrence wins.
fn dedupe(robot_ids: Vec<String>) -> Vec<String> {
    let mut seen = HashSet::new();
    robot_ids
        .into_iter()
        .map(|robot_id| robot_id.trim().to_string())
        .filter(|robot_id| !robot_id.is_empty() && seen.insert(robot_id.clone()))
        .collect()
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("operation panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("operation panicked: {message}")
    } else {
        "operation panicked".to_string()
    }
}
