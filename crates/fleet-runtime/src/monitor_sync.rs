//! Keeps the backend monitor's parallelism aligned with the operator's
//! fleet parallelism. Rapid changes collapse: only the latest target is sent
//! once the in-flight update resolves.

use crate::backend::FleetBackend;
use crate::config::clamp_parallelism;
use fleet_core::contracts::MonitorConfigPatch;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AlignOutcome {
    /// The backend now runs with this parallelism.
    Applied(usize),
    /// Already aligned, nothing sent.
    Unchanged(usize),
    /// Another caller is updating; it will pick up this target.
    Queued,
    Failed(String),
}

#[derive(Debug, Default)]
struct AlignState {
    in_flight: bool,
    pending: Option<usize>,
    applied: Option<usize>,
}

/// Clears `in_flight` if an update future is dropped before it resolves.
struct InFlightGuard<'a> {
    aligner: &'a MonitorAligner,
    armed: bool,
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.aligner.state().in_flight = false;
        }
    }
}

pub struct MonitorAligner {
    backend: Arc<dyn FleetBackend>,
    state: Mutex<AlignState>,
}

impl MonitorAligner {
    pub fn new(backend: Arc<dyn FleetBackend>) -> Self {
        Self {
            backend,
            state: Mutex::new(AlignState::default()),
        }
    }

    fn state(&self) -> MutexGuard<'_, AlignState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn align(&self, parallelism: usize) -> AlignOutcome {
        let target = clamp_parallelism(parallelism);
        {
            let mut state = self.state();
            state.pending = Some(target);
            if state.in_flight {
                return AlignOutcome::Queued;
            }
            if state.applied == Some(target) {
                state.pending = None;
                return AlignOutcome::Unchanged(target);
            }
            state.in_flight = true;
        }

        let mut guard = InFlightGuard {
            aligner: self,
            armed: true,
        };
        let mut last = AlignOutcome::Unchanged(target);
        loop {
            let next = {
                let mut state = self.state();
                match state.pending.take() {
                    Some(next) if state.applied != Some(next) => next,
                    _ => {
                        state.in_flight = false;
                        guard.armed = false;
                        break;
                    }
                }
            };
            match self
                .backend
                .update_monitor_config(&MonitorConfigPatch::parallelism(next))
                .await
            {
                Ok(config) => {
                    self.state().applied = Some(config.parallelism);
                    info!(
                        event = "monitor_parallelism_aligned",
                        requested = next,
                        applied = config.parallelism
                    );
                    last = AlignOutcome::Applied(config.parallelism);
                }
                Err(err) => {
                    warn!(event = "monitor_parallelism_failed", requested = next, error = %err);
                    last = AlignOutcome::Failed(err.to_string());
                }
            }
        }
        last
    }
}
