//! Execution monitor for metrics and telemetry.
//!
//! Counts lifecycle events as the engine commits them and captures
//! point-in-time snapshots for dashboards.

use crate::lifecycle::StepOutcome;
use crate::throttle::ErrorClass;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use serde::Serialize;
use skein_core::{Heartbeat, StepState};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Execution metrics
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Metrics {
    /// Steps claimed for a lifecycle run
    pub steps_claimed: u64,
    /// Steps completed
    pub steps_completed: u64,
    /// Steps failed, forced failures included
    pub steps_failed: u64,
    /// Steps skipped
    pub steps_skipped: u64,
    /// Runs that ended in a defer
    pub steps_deferred: u64,
    /// Attempts that failed and were rescheduled
    pub retries: u64,
    /// Retries caused by a lock timeout
    pub lock_timeouts: u64,
    /// Children persisted from `execute`
    pub children_spawned: u64,
    /// Parents resolved by a join
    pub joins_resolved: u64,
    /// Commits rejected because the claim was gone
    pub claims_lost: u64,
    /// Running claims whose lease ran out
    pub stale_requeued: u64,
    /// Child blocks found without a valid parent
    pub orphaned_blocks: u64,
}

impl Metrics {
    /// Create new metrics
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a claim
    pub fn record_claim(&mut self) {
        self.steps_claimed += 1;
    }

    /// Record a committed run outcome
    pub fn record_outcome(&mut self, outcome: &StepOutcome) {
        match outcome {
            StepOutcome::Completed => self.steps_completed += 1,
            StepOutcome::Skipped => self.steps_skipped += 1,
            StepOutcome::Deferred { .. } => self.steps_deferred += 1,
            StepOutcome::AwaitingChildren { spawned, .. } => {
                self.children_spawned += *spawned as u64;
            }
            StepOutcome::Retrying { class, .. } => {
                self.retries += 1;
                if *class == ErrorClass::Transient {
                    self.lock_timeouts += 1;
                }
            }
            StepOutcome::Failed { .. } => self.steps_failed += 1,
            StepOutcome::Waiting { .. } => {}
            StepOutcome::ClaimLost => self.claims_lost += 1,
        }
    }

    /// Record a failure written outside a lifecycle run
    pub fn record_forced_failure(&mut self) {
        self.steps_failed += 1;
    }

    /// Record a resolved join
    pub fn record_join(&mut self) {
        self.joins_resolved += 1;
    }

    /// Record requeued stale claims
    pub fn record_requeued(&mut self, count: usize) {
        self.stale_requeued += count as u64;
    }

    /// Record an orphaned child block
    pub fn record_orphaned_block(&mut self) {
        self.orphaned_blocks += 1;
    }

    /// Steps that reached a terminal state
    #[must_use]
    pub fn terminal(&self) -> u64 {
        self.steps_completed + self.steps_failed + self.steps_skipped
    }

    /// Get success rate (0.0 - 1.0) over terminal steps
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        let terminal = self.terminal();
        if terminal == 0 {
            return 1.0;
        }
        (self.steps_completed + self.steps_skipped) as f64 / terminal as f64
    }

    /// Get failure rate (0.0 - 1.0) over terminal steps
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        let terminal = self.terminal();
        if terminal == 0 {
            return 0.0;
        }
        self.steps_failed as f64 / terminal as f64
    }

    /// Reset metrics
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Telemetry data point
#[derive(Debug, Clone, Serialize)]
pub struct Telemetry {
    /// Wall-clock capture time
    pub captured_at: DateTime<Utc>,
    /// Time since the monitor started
    pub uptime: Duration,
    /// Current metrics snapshot
    pub metrics: Metrics,
    /// Step counts per state
    pub steps_by_state: IndexMap<StepState, usize>,
    /// Shard heartbeats
    pub shards: Vec<Heartbeat>,
}

impl Telemetry {
    /// Steps in `state`
    #[must_use]
    pub fn count(&self, state: StepState) -> usize {
        self.steps_by_state.get(&state).copied().unwrap_or(0)
    }

    /// Steps not yet terminal
    #[must_use]
    pub fn open_steps(&self) -> usize {
        self.count(StepState::Pending) + self.count(StepState::Running)
    }
}

/// Execution monitor
///
/// Shared by every task driving the engine; all methods take `&self`.
pub struct ExecutionMonitor {
    metrics: Mutex<Metrics>,
    start_time: Mutex<Instant>,
    telemetry_history: Mutex<VecDeque<Telemetry>>,
    max_history: usize,
}

impl ExecutionMonitor {
    /// Create a new monitor
    #[must_use]
    pub fn new(max_history: usize) -> Self {
        Self {
            metrics: Mutex::new(Metrics::new()),
            start_time: Mutex::new(Instant::now()),
            telemetry_history: Mutex::new(VecDeque::new()),
            max_history,
        }
    }

    /// Get current metrics
    #[must_use]
    pub fn metrics(&self) -> Metrics {
        guard(&self.metrics).clone()
    }

    /// Update metrics in place
    pub fn record(&self, update: impl FnOnce(&mut Metrics)) {
        update(&mut guard(&self.metrics));
    }

    /// Capture a telemetry snapshot
    pub fn capture_telemetry(
        &self,
        steps_by_state: IndexMap<StepState, usize>,
        shards: Vec<Heartbeat>,
    ) -> Telemetry {
        let telemetry = Telemetry {
            captured_at: Utc::now(),
            uptime: guard(&self.start_time).elapsed(),
            metrics: self.metrics(),
            steps_by_state,
            shards,
        };

        let mut history = guard(&self.telemetry_history);
        history.push_back(telemetry.clone());
        while history.len() > self.max_history {
            history.pop_front();
        }
        telemetry
    }

    /// Get telemetry history, oldest first
    #[must_use]
    pub fn history(&self) -> Vec<Telemetry> {
        guard(&self.telemetry_history).iter().cloned().collect()
    }

    /// Reset the monitor
    pub fn reset(&self) {
        guard(&self.metrics).reset();
        *guard(&self.start_time) = Instant::now();
        guard(&self.telemetry_history).clear();
    }
}

impl Default for ExecutionMonitor {
    fn default() -> Self {
        Self::new(1000)
    }
}

impl std::fmt::Debug for ExecutionMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionMonitor")
            .field("metrics", &self.metrics())
            .field("max_history", &self.max_history)
            .finish()
    }
}

// Counters stay usable after a panicking writer.
fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
