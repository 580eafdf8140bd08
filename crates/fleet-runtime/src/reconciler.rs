use crate::backend::FleetBackend;
use crate::error::BackendError;
use crate::store::{FleetStore, SnapshotDiff};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PollPhase {
    Idle = 0,
    Fetching = 1,
    Diffing = 2,
    Applied = 3,
}

impl PollPhase {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => PollPhase::Fetching,
            2 => PollPhase::Diffing,
            3 => PollPhase::Applied,
            _ => PollPhase::Idle,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Applied(SnapshotDiff),
    /// Another fetch was still outstanding.
    Skipped,
    /// The backend could not be read; local state was kept.
    Failed(String),
}

/// Returns the phase to idle however the cycle ends, including when the
/// polling future is dropped mid-fetch.
struct PhaseReset<'a>(&'a AtomicU8);

impl Drop for PhaseReset<'_> {
    fn drop(&mut self) {
        self.0.store(PollPhase::Idle as u8, Ordering::SeqCst);
    }
}

pub struct Reconciler {
    store: Arc<FleetStore>,
    backend: Arc<dyn FleetBackend>,
    interval: Duration,
    phase: AtomicU8,
}

impl Reconciler {
    pub fn new(store: Arc<FleetStore>, backend: Arc<dyn FleetBackend>, interval: Duration) -> Self {
        Self {
            store,
            backend,
            interval,
            phase: AtomicU8::new(PollPhase::Idle as u8),
        }
    }

    pub fn phase(&self) -> PollPhase {
        PollPhase::from_u8(self.phase.load(Ordering::SeqCst))
    }

    /// Initial load: replaces the whole fleet.
    pub async fn load(&self) -> Result<Vec<String>, BackendError> {
        let list = self.backend.fetch_robots().await?;
        if list.rejected > 0 {
            warn!(event = "snapshot_entries_rejected", rejected = list.rejected);
        }
        let ids = self.store.replace_all(list.robots);
        info!(event = "fleet_loaded", robots = ids.len());
        Ok(ids)
    }

    pub async fn poll_once(&self) -> PollOutcome {
        if self
            .phase
            .compare_exchange(
                PollPhase::Idle as u8,
                PollPhase::Fetching as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return PollOutcome::Skipped;
        }
        let _reset = PhaseReset(&self.phase);

        let fetched_at = self.store.local_revision();
        let list = match self.backend.fetch_robots().await {
            Ok(list) => list,
            Err(err) => {
                if err.is_transient() {
                    debug!(event = "snapshot_poll_failed", error = %err);
                } else {
                    warn!(event = "snapshot_poll_failed", error = %err);
                }
                return PollOutcome::Failed(err.to_string());
            }
        };
        if list.rejected > 0 {
            warn!(event = "snapshot_entries_rejected", rejected = list.rejected);
        }

        self.phase
            .store(PollPhase::Diffing as u8, Ordering::SeqCst);
        let diff = self.store.apply_snapshot(&list.robots, fetched_at);
        self.phase
            .store(PollPhase::Applied as u8, Ordering::SeqCst);
        if !diff.changed.is_empty() || !diff.held.is_empty() {
            debug!(
                event = "snapshot_applied",
                changed = diff.changed.len(),
                added = diff.added,
                held = diff.held.len()
            );
        }
        PollOutcome::Applied(diff)
    }

    /// Polls on a fixed interval until `cancel` fires. Non-empty change sets
    /// are sent on `changes`; missed ticks are skipped.
    pub fn spawn(
        self: Arc<Self>,
        changes: mpsc::Sender<BTreeSet<String>>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let outcome = tokio::select! {
                    _ = cancel.cancelled() => break,
                    outcome = self.poll_once() => outcome,
                };
                if let PollOutcome::Applied(diff) = outcome {
                    if !diff.changed.is_empty() && changes.send(diff.changed).await.is_err() {
                        break;
                    }
                }
            }
            debug!(event = "reconciler_stopped");
        })
    }
}
