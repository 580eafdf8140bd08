//! Canonical in-memory fleet state.
//!
//! All mutation goes through short synchronous critical sections on one
//! mutex; nothing here is ever held across an `.await`. Callers receive
//! clones, never references into the store.

use crate::config::CountdownWindows;
use crate::timing::{Countdown, CountdownMode, LatencyEstimator};
use chrono::{DateTime, Utc};
use fleet_core::contracts::{OnlineResultPayload, RobotSnapshot, TestRunResponse};
use fleet_core::reachability::infer_reachability;
use fleet_core::{RobotRecord, TestDebugEntry, REACHABILITY_CHECK_ID};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActivityKind {
    Testing,
    Searching,
    Fixing,
}

impl ActivityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActivityKind::Testing => "testing",
            ActivityKind::Searching => "searching",
            ActivityKind::Fixing => "fixing",
        }
    }

    pub fn countdown_mode(&self) -> CountdownMode {
        match self {
            ActivityKind::Testing => CountdownMode::Scanning,
            ActivityKind::Searching => CountdownMode::Finding,
            ActivityKind::Fixing => CountdownMode::Fixing,
        }
    }
}

/// Which local activity sets hold a robot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocalActivity {
    pub testing: bool,
    pub searching: bool,
    pub fixing: bool,
}

impl LocalActivity {
    pub fn is_busy(&self) -> bool {
        self.testing || self.searching || self.fixing
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BeginOutcome {
    pub accepted: Vec<String>,
    pub skipped: Vec<String>,
}

/// Outcome of merging one polled snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotDiff {
    pub changed: BTreeSet<String>,
    pub added: usize,
    /// Robots whose polled test/activity fields were discarded this pass.
    pub held: BTreeSet<String>,
}

#[derive(Debug)]
struct FleetState {
    robots: BTreeMap<String, RobotRecord>,
    testing: HashSet<String>,
    searching: HashSet<String>,
    fixing: HashSet<String>,
    countdowns: HashMap<String, Countdown>,
    selection: BTreeSet<String>,
    estimator: LatencyEstimator,
    /// Bumped on every local write to a robot's test or activity fields.
    revision: u64,
    written_at: HashMap<String, u64>,
}

impl FleetState {
    fn set_mut(&mut self, kind: ActivityKind) -> &mut HashSet<String> {
        match kind {
            ActivityKind::Testing => &mut self.testing,
            ActivityKind::Searching => &mut self.searching,
            ActivityKind::Fixing => &mut self.fixing,
        }
    }

    fn local_activity(&self, robot_id: &str) -> LocalActivity {
        LocalActivity {
            testing: self.testing.contains(robot_id),
            searching: self.searching.contains(robot_id),
            fixing: self.fixing.contains(robot_id),
        }
    }

    fn is_busy(&self, robot_id: &str) -> bool {
        self.local_activity(robot_id).is_busy()
    }

    fn touch(&mut self, robot_id: &str) {
        self.revision += 1;
        self.written_at.insert(robot_id.to_string(), self.revision);
    }

    fn written_since(&self, robot_id: &str, revision: u64) -> bool {
        self.written_at
            .get(robot_id)
            .is_some_and(|written| *written > revision)
    }
}

#[derive(Debug)]
pub struct FleetStore {
    inner: Mutex<FleetState>,
}

impl Default for FleetStore {
    fn default() -> Self {
        Self::new(CountdownWindows::default(), crate::config::DEFAULT_SMOOTHING)
    }
}

impl FleetStore {
    pub fn new(windows: CountdownWindows, smoothing: f64) -> Self {
        Self {
            inner: Mutex::new(FleetState {
                robots: BTreeMap::new(),
                testing: HashSet::new(),
                searching: HashSet::new(),
                fixing: HashSet::new(),
                countdowns: HashMap::new(),
                selection: BTreeSet::new(),
                estimator: LatencyEstimator::new(windows, smoothing),
                revision: 0,
                written_at: HashMap::new(),
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, FleetState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Full reload. The only operation that removes records.
    pub fn replace_all(&self, snapshots: Vec<RobotSnapshot>) -> Vec<String> {
        let mut state = self.state();
        state.robots = snapshots
            .into_iter()
            .map(|snapshot| {
                let record = RobotRecord::from_snapshot(snapshot);
                (record.id.clone(), record)
            })
            .collect();
        let FleetState {
            robots,
            selection,
            written_at,
            ..
        } = &mut *state;
        selection.retain(|robot_id| robots.contains_key(robot_id));
        written_at.retain(|robot_id, _| robots.contains_key(robot_id));
        state.robots.keys().cloned().collect()
    }

    pub fn robot(&self, robot_id: &str) -> Option<RobotRecord> {
        self.state().robots.get(robot_id).cloned()
    }

    pub fn robots(&self) -> Vec<RobotRecord> {
        self.state().robots.values().cloned().collect()
    }

    pub fn robot_ids(&self) -> Vec<String> {
        self.state().robots.keys().cloned().collect()
    }

    pub fn contains(&self, robot_id: &str) -> bool {
        self.state().robots.contains_key(robot_id)
    }

    /// Marks every free robot as active for `kind` and starts its countdown.
    /// Robots already busy in any set are returned as skipped.
    pub fn try_begin(&self, kind: ActivityKind, robot_ids: &[String]) -> BeginOutcome {
        let now = Instant::now();
        let mut state = self.state();
        let estimate = state.estimator.estimate(kind.countdown_mode());
        let mut outcome = BeginOutcome::default();
        for robot_id in robot_ids {
            if state.is_busy(robot_id) {
                outcome.skipped.push(robot_id.clone());
                continue;
            }
            state.set_mut(kind).insert(robot_id.clone());
            state.touch(robot_id);
            state.countdowns.insert(
                robot_id.clone(),
                Countdown::start(kind.countdown_mode(), estimate, now),
            );
            outcome.accepted.push(robot_id.clone());
        }
        outcome
    }

    /// Releases `robot_id` from `kind`. A measured `elapsed` feeds the
    /// estimator; cancelled work passes `None`.
    pub fn finish(&self, kind: ActivityKind, robot_id: &str, elapsed: Option<Duration>) {
        let mut state = self.state();
        if !state.set_mut(kind).remove(robot_id) {
            return;
        }
        state.touch(robot_id);
        if let Some(elapsed) = elapsed {
            state.estimator.observe(kind.countdown_mode(), elapsed);
        }
        if !state.is_busy(robot_id) {
            state.countdowns.remove(robot_id);
        }
    }

    pub fn is_busy(&self, robot_id: &str) -> bool {
        self.state().is_busy(robot_id)
    }

    pub fn local_activity(&self, robot_id: &str) -> LocalActivity {
        self.state().local_activity(robot_id)
    }

    pub fn countdown(&self, robot_id: &str) -> Option<Countdown> {
        self.state().countdowns.get(robot_id).copied()
    }

    pub fn countdown_label(&self, robot_id: &str, now: Instant) -> Option<String> {
        self.countdown(robot_id).map(|countdown| countdown.label(now))
    }

    pub fn select(&self, robot_id: &str) -> bool {
        let mut state = self.state();
        if !state.robots.contains_key(robot_id) {
            return false;
        }
        state.selection.insert(robot_id.to_string())
    }

    /// Returns whether the robot is selected afterwards.
    pub fn toggle(&self, robot_id: &str) -> bool {
        let mut state = self.state();
        if state.selection.remove(robot_id) {
            return false;
        }
        if !state.robots.contains_key(robot_id) {
            return false;
        }
        state.selection.insert(robot_id.to_string());
        true
    }

    pub fn select_all(&self) -> usize {
        let mut state = self.state();
        let ids: Vec<String> = state.robots.keys().cloned().collect();
        state.selection.extend(ids);
        state.selection.len()
    }

    pub fn clear_selection(&self) {
        self.state().selection.clear();
    }

    pub fn selected(&self) -> Vec<String> {
        self.state().selection.iter().cloned().collect()
    }

    /// Merges a completed test run for one robot. Returns false for an
    /// unknown robot.
    pub fn apply_test_run(
        &self,
        robot_id: &str,
        response: &TestRunResponse,
        full_run: bool,
        source: &str,
        now: DateTime<Utc>,
    ) -> bool {
        let mut guard = self.state();
        let state = &mut *guard;
        let Some(record) = state.robots.get_mut(robot_id) else {
            return false;
        };
        let checked_at = response.finished_at.unwrap_or(now);
        let previous_reachability = record.tests.get(REACHABILITY_CHECK_ID).cloned();
        for result in &response.results {
            record
                .tests
                .insert(result.id.clone(), result.to_check(checked_at, source));
            record.test_debug.insert(
                result.id.clone(),
                TestDebugEntry {
                    run_id: response.run_id.clone(),
                    recorded_at: now,
                    status: result.status,
                    steps: result.steps.clone(),
                },
            );
        }
        if let Some(inferred) =
            infer_reachability(&response.results, previous_reachability.as_ref(), now)
        {
            record
                .tests
                .insert(REACHABILITY_CHECK_ID.to_string(), inferred);
        }
        if full_run {
            record.activity.last_full_test_at = Some(now);
            record.activity.last_full_test_source = Some(source.to_string());
        }
        state.touch(robot_id);
        true
    }

    /// Merges reachability sweep results into each robot's `online` check.
    pub fn apply_online_results(
        &self,
        results: &[OnlineResultPayload],
        now: DateTime<Utc>,
    ) -> BTreeSet<String> {
        let mut state = self.state();
        let mut changed = BTreeSet::new();
        for result in results {
            let Some(record) = state.robots.get_mut(&result.robot_id) else {
                continue;
            };
            let check = result.to_check(now);
            if record.tests.get(REACHABILITY_CHECK_ID) != Some(&check) {
                record
                    .tests
                    .insert(REACHABILITY_CHECK_ID.to_string(), check);
                changed.insert(result.robot_id.clone());
            }
        }
        for robot_id in &changed {
            state.touch(robot_id);
        }
        changed
    }

    /// Current local write revision. Take it before fetching a snapshot and
    /// hand it back to [`FleetStore::apply_snapshot`].
    pub fn local_revision(&self) -> u64 {
        self.state().revision
    }

    /// Applies a polled snapshot under the precedence rule: robots held by
    /// any local activity set, or written locally after `fetched_at` was
    /// taken, keep their test and activity fields. Identity fields always
    /// follow the backend. Robots missing from the snapshot are kept.
    pub fn apply_snapshot(&self, snapshots: &[RobotSnapshot], fetched_at: u64) -> SnapshotDiff {
        let mut guard = self.state();
        let state = &mut *guard;
        let mut diff = SnapshotDiff::default();
        for snapshot in snapshots {
            let busy =
                state.is_busy(&snapshot.id) || state.written_since(&snapshot.id, fetched_at);
            match state.robots.get_mut(&snapshot.id) {
                None => {
                    state
                        .robots
                        .insert(snapshot.id.clone(), RobotRecord::from_snapshot(snapshot.clone()));
                    diff.added += 1;
                    diff.changed.insert(snapshot.id.clone());
                }
                Some(record) => {
                    if !record.same_identity(snapshot) {
                        record.apply_identity(snapshot);
                        diff.changed.insert(snapshot.id.clone());
                    }
                    if busy {
                        diff.held.insert(snapshot.id.clone());
                    } else if !record.same_observed_state(snapshot) {
                        record.apply_observed_state(snapshot);
                        diff.changed.insert(snapshot.id.clone());
                    }
                }
            }
        }
        diff
    }
}
