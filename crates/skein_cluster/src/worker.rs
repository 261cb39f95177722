//! Shard-bound polling worker.
//!
//! Each poll cycle stamps the shard heartbeat, runs eligible steps up to the
//! cycle budget, sweeps parked joins, requeues expired claims, and closes the
//! heartbeat cycle. Shutdown is cooperative: a running cycle always finishes.

use crate::config::WorkerConfig;
use serde::{Deserialize, Serialize};
use skein_core::{CoreError, CycleId, WorkerId};
use skein_runtime::{Engine, StepOutcome};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Worker errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WorkerError {
    /// Configuration rejected
    #[error("invalid worker config: {0}")]
    InvalidConfig(String),

    /// Engine or store failure during a cycle
    #[error(transparent)]
    Core(#[from] CoreError),

    /// Worker task panicked or was aborted
    #[error("worker task failed: {0}")]
    TaskFailed(String),
}

/// Worker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerState {
    /// Between cycles
    Idle,
    /// Inside a poll cycle
    Polling,
    /// Stopped
    Shutdown,
}

/// What one poll cycle did
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    /// Heartbeat cycle token
    pub cycle: CycleId,
    /// Steps claimed and run
    pub steps_run: usize,
    /// Runs ending Completed or Skipped
    pub completed: usize,
    /// Runs ending Failed
    pub failed: usize,
    /// Runs rescheduled after a failed attempt
    pub retried: usize,
    /// Parents resolved by the join sweep
    pub joins_resolved: usize,
    /// Expired claims
    pub requeued: usize,
    /// Runs whose join cascade met an orphaned child block
    pub orphaned: usize,
}

impl CycleReport {
    /// Empty report for `cycle`
    #[must_use]
    pub const fn new(cycle: CycleId) -> Self {
        Self {
            cycle,
            steps_run: 0,
            completed: 0,
            failed: 0,
            retried: 0,
            joins_resolved: 0,
            requeued: 0,
            orphaned: 0,
        }
    }

    fn record(&mut self, outcome: &StepOutcome) {
        self.steps_run += 1;
        match outcome {
            StepOutcome::Completed | StepOutcome::Skipped => self.completed += 1,
            StepOutcome::Failed { .. } => self.failed += 1,
            StepOutcome::Retrying { .. } => self.retried += 1,
            _ => {}
        }
    }

    /// Whether the cycle changed anything
    #[must_use]
    pub const fn did_work(&self) -> bool {
        self.steps_run > 0 || self.joins_resolved > 0 || self.requeued > 0
    }
}

/// Worker statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerStats {
    /// Worker id
    pub worker_id: WorkerId,
    /// Shard polled
    pub shard: String,
    /// Current state
    pub state: WorkerState,
    /// Poll cycles finished
    pub cycles: u64,
    /// Poll cycles aborted by an error
    pub failed_cycles: u64,
    /// Steps run
    pub steps_run: u64,
    /// Steps completed or skipped
    pub steps_completed: u64,
    /// Steps failed
    pub steps_failed: u64,
    /// Parents resolved by the sweep
    pub joins_resolved: u64,
}

impl WorkerStats {
    fn new(worker_id: WorkerId, shard: &str) -> Self {
        Self {
            worker_id,
            shard: shard.to_string(),
            state: WorkerState::Idle,
            cycles: 0,
            failed_cycles: 0,
            steps_run: 0,
            steps_completed: 0,
            steps_failed: 0,
            joins_resolved: 0,
        }
    }

    fn absorb(&mut self, report: &CycleReport) {
        self.cycles += 1;
        self.steps_run += report.steps_run as u64;
        self.steps_completed += report.completed as u64;
        self.steps_failed += report.failed as u64;
        self.joins_resolved += report.joins_resolved as u64;
    }
}

/// Polling worker bound to one shard
pub struct Worker {
    id: WorkerId,
    config: WorkerConfig,
    engine: Arc<Engine>,
    state: RwLock<WorkerState>,
    stats: RwLock<WorkerStats>,
}

impl Worker {
    /// Create a worker
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` if the configuration does not validate
    pub fn new(engine: Arc<Engine>, config: WorkerConfig) -> Result<Self, WorkerError> {
        config.validate()?;
        let id = WorkerId::new();
        Ok(Self {
            id,
            stats: RwLock::new(WorkerStats::new(id, &config.shard)),
            config,
            engine,
            state: RwLock::new(WorkerState::Idle),
        })
    }

    /// Worker id, recorded as `claimed_by` on the steps it runs
    #[must_use]
    pub const fn id(&self) -> WorkerId {
        self.id
    }

    /// Shard polled
    #[must_use]
    pub fn shard(&self) -> &str {
        &self.config.shard
    }

    /// Configuration
    #[must_use]
    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Current state
    pub async fn state(&self) -> WorkerState {
        *self.state.read().await
    }

    /// Statistics so far
    pub async fn stats(&self) -> WorkerStats {
        let mut stats = self.stats.read().await.clone();
        stats.state = self.state().await;
        stats
    }

    /// Run one poll cycle
    ///
    /// The heartbeat cycle is closed even when the cycle fails part way.
    ///
    /// # Errors
    ///
    /// Returns error if the shard is unknown or the store fails. An
    /// orphaned child block is counted in the report and the cycle goes on.
    pub async fn poll_once(&self) -> Result<CycleReport, WorkerError> {
        let shard = self.shard();
        let cycle = CycleId::new();
        self.engine.touch_heartbeat(shard, cycle).await?;
        self.transition(WorkerState::Idle, WorkerState::Polling).await;

        let driven = self.drive(cycle).await;
        let closed = self.engine.complete_cycle(shard, cycle).await;
        self.transition(WorkerState::Polling, WorkerState::Idle).await;

        {
            let mut stats = self.stats.write().await;
            match &driven {
                Ok(report) => stats.absorb(report),
                Err(_) => stats.failed_cycles += 1,
            }
        }
        if !closed? {
            debug!(shard, %cycle, "heartbeat cycle taken over by another poller");
        }
        driven
    }

    async fn drive(&self, cycle: CycleId) -> Result<CycleReport, WorkerError> {
        let shard = self.shard();
        let mut report = CycleReport::new(cycle);

        while report.steps_run < self.config.max_steps_per_cycle {
            match self.engine.run_next(shard, self.id).await {
                Ok(Some((step_id, outcome))) => {
                    debug!(%step_id, shard, outcome = outcome.label(), "step run");
                    report.record(&outcome);
                }
                Ok(None) => break,
                // Committed already; the engine has logged and counted it.
                Err(CoreError::OrphanedChildBlock { .. }) => {
                    report.steps_run += 1;
                    report.orphaned += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }

        report.joins_resolved = self.engine.resolve_joins(Some(shard)).await?;
        report.requeued = self
            .engine
            .requeue_stale(self.engine.config().lease())
            .await?
            .len();
        Ok(report)
    }

    /// Poll until `shutdown` is cancelled
    ///
    /// Cycle errors are logged and followed by the full idle backoff; they
    /// never stop the worker.
    pub async fn run(&self, shutdown: CancellationToken) -> WorkerStats {
        let shard = self.shard();
        info!(worker = %self.id, shard, "worker started");
        let mut pause = self.config.poll_interval();

        while !shutdown.is_cancelled() {
            pause = match self.poll_once().await {
                Ok(report) if report.steps_run >= self.config.max_steps_per_cycle => Duration::ZERO,
                Ok(report) if report.did_work() => self.config.poll_interval(),
                Ok(_) => self.next_idle(pause),
                Err(err) => {
                    error!(worker = %self.id, shard, error = %err, "poll cycle failed");
                    self.config.idle_backoff()
                }
            };

            tokio::select! {
                () = shutdown.cancelled() => break,
                () = tokio::time::sleep(pause) => {}
            }
        }

        *self.state.write().await = WorkerState::Shutdown;
        let stats = self.stats().await;
        info!(worker = %self.id, shard, cycles = stats.cycles, steps = stats.steps_run, "worker stopped");
        stats
    }

    fn next_idle(&self, pause: Duration) -> Duration {
        pause
            .saturating_mul(2)
            .max(self.config.poll_interval())
            .min(self.config.idle_backoff())
    }

    async fn transition(&self, from: WorkerState, to: WorkerState) {
        let mut state = self.state.write().await;
        if *state == from {
            *state = to;
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
