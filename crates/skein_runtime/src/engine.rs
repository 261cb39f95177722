//! Engine: the facade workers and callers drive.
//!
//! Combines the store, the unit registry, the lifecycle runner and the
//! dispatcher. Every state change is committed through the store's
//! conditional operations; the engine itself holds no step state.

use crate::config::EngineConfig;
use crate::dispatcher::ShardDispatcher;
use crate::lifecycle::{LifecycleRun, StepOutcome, StepRunner};
use crate::lock::{InMemoryLocks, LockManager};
use crate::monitor::{ExecutionMonitor, Metrics, Telemetry};
use crate::registry::UnitRegistry;
use crate::scheduler::{JoinDecision, WaveBarrier, evaluate_join, resolve_parent};
use crate::store::{MemoryStore, StepStore};
use crate::throttle::ErrorClass;
use crate::unit::{StepContext, Unit, UnitError};
use chrono::{DateTime, Utc};
use skein_core::{
    BlockId, ClaimToken, CoreError, CoreResult, CycleId, FailureDetail, Heartbeat, NewStep, Shard,
    Step, StepId, WorkerId,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Orchestration engine
pub struct Engine {
    store: Arc<dyn StepStore>,
    registry: Arc<UnitRegistry>,
    runner: StepRunner,
    dispatcher: ShardDispatcher,
    config: EngineConfig,
    monitor: ExecutionMonitor,
    /// Claimant recorded on parents this engine joins
    joiner: WorkerId,
}

impl Engine {
    /// Create an engine over a store and lock manager
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn new(
        config: EngineConfig,
        registry: UnitRegistry,
        store: Arc<dyn StepStore>,
        locks: Arc<dyn LockManager>,
    ) -> CoreResult<Self> {
        let throttle = config.throttle()?;
        Ok(Self {
            store,
            registry: Arc::new(registry),
            runner: StepRunner::new(throttle, locks),
            dispatcher: ShardDispatcher::new(config.dispatch),
            config,
            monitor: ExecutionMonitor::default(),
            joiner: WorkerId::new(),
        })
    }

    /// Engine over a fresh in-memory store and lock table
    ///
    /// # Errors
    ///
    /// Returns error if the configuration is invalid
    pub fn in_memory(config: EngineConfig, registry: UnitRegistry) -> CoreResult<Self> {
        Self::new(
            config,
            registry,
            Arc::new(MemoryStore::new()),
            Arc::new(InMemoryLocks::new()),
        )
    }

    /// Backing store
    #[must_use]
    pub fn store(&self) -> &Arc<dyn StepStore> {
        &self.store
    }

    /// Unit registry
    #[must_use]
    pub fn registry(&self) -> &UnitRegistry {
        &self.registry
    }

    /// Lock manager shared with step bodies
    #[must_use]
    pub fn locks(&self) -> &Arc<dyn LockManager> {
        self.runner.locks()
    }

    /// Engine configuration
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Execution monitor
    #[must_use]
    pub fn monitor(&self) -> &ExecutionMonitor {
        &self.monitor
    }

    /// Current metrics
    #[must_use]
    pub fn metrics(&self) -> Metrics {
        self.monitor.metrics()
    }

    /// Capture a telemetry snapshot
    ///
    /// # Errors
    ///
    /// Returns error if the store is unavailable
    pub async fn telemetry(&self) -> CoreResult<Telemetry> {
        let counts = self.store.count_by_state().await?;
        let shards = self.store.shards().await?;
        Ok(self
            .monitor
            .capture_telemetry(counts, shards.iter().map(Shard::heartbeat).collect()))
    }

    // Shard control

    /// Register a shard, open for dispatch
    ///
    /// # Errors
    ///
    /// Returns error if the store is unavailable
    pub async fn register_shard(&self, name: &str) -> CoreResult<bool> {
        let created = self.store.register_shard(Shard::new(name)).await?;
        if created {
            info!(shard = name, "shard registered");
        }
        Ok(created)
    }

    /// Flip a shard's circuit breaker
    ///
    /// Running steps are untouched; only new claims stop.
    ///
    /// # Errors
    ///
    /// Returns error if the shard does not exist
    pub async fn set_can_dispatch(&self, shard: &str, can_dispatch: bool) -> CoreResult<()> {
        self.store.set_can_dispatch(shard, can_dispatch).await?;
        info!(shard, can_dispatch, "shard circuit breaker set");
        Ok(())
    }

    /// Heartbeat fields of a shard
    ///
    /// # Errors
    ///
    /// Returns error if the shard does not exist
    pub async fn read_heartbeat(&self, shard: &str) -> CoreResult<Heartbeat> {
        Ok(self.store.shard(shard).await?.heartbeat())
    }

    /// Mark a poll cycle as in flight on `shard`
    ///
    /// # Errors
    ///
    /// Returns error if the shard does not exist
    pub async fn touch_heartbeat(&self, shard: &str, cycle: CycleId) -> CoreResult<()> {
        self.store.touch_heartbeat(shard, cycle, Utc::now()).await
    }

    /// Close a poll cycle; `false` if another cycle replaced it
    ///
    /// # Errors
    ///
    /// Returns error if the shard does not exist
    pub async fn complete_cycle(&self, shard: &str, cycle: CycleId) -> CoreResult<bool> {
        self.store.complete_cycle(shard, cycle, Utc::now()).await
    }

    /// Shards whose in-flight cycle has run longer than `threshold`
    ///
    /// # Errors
    ///
    /// Returns error if the threshold is out of range or the store fails
    pub async fn stalled_shards(&self, threshold: Duration) -> CoreResult<Vec<Heartbeat>> {
        let threshold = to_chrono("threshold", threshold)?;
        let now = Utc::now();
        Ok(self
            .store
            .shards()
            .await?
            .iter()
            .map(Shard::heartbeat)
            .filter(|heartbeat| heartbeat.is_stalled(now, threshold))
            .collect())
    }

    // Creation and lookup

    /// Create one step
    ///
    /// # Errors
    ///
    /// See [`create_steps`](Self::create_steps)
    pub async fn create_step(&self, request: NewStep) -> CoreResult<Step> {
        self.create_steps(vec![request])
            .await?
            .pop()
            .ok_or_else(|| CoreError::Internal {
                message: "no step created".to_string(),
            })
    }

    /// Create steps atomically, assigning each a shard
    ///
    /// A request without `block_id` starts a new single-wave block. Steps
    /// placed in a block owned by a parent are linked to it. A parent created
    /// with a pre-allocated child block should be created in the same call as
    /// its children, otherwise it joins over an empty block.
    ///
    /// # Errors
    ///
    /// Returns error if a unit type is unknown, no shard is open, or a step
    /// names a parent that does not own its block
    pub async fn create_steps(&self, requests: Vec<NewStep>) -> CoreResult<Vec<Step>> {
        let shards = self.store.shards().await?;
        let mut steps = self.materialize(requests, &shards)?;
        self.link_parents(&mut steps).await?;
        self.store.insert_steps(steps.clone()).await?;
        for step in &steps {
            info!(
                step_id = %step.id,
                block_id = %step.block_id,
                unit_type = %step.unit_type,
                shard = %step.shard,
                wave = step.wave_index,
                "step created"
            );
        }
        Ok(steps)
    }

    /// Fetch a step
    ///
    /// # Errors
    ///
    /// Returns error if the step does not exist
    pub async fn get_step(&self, id: StepId) -> CoreResult<Step> {
        self.store.get(id).await
    }

    /// Every step of a block
    ///
    /// # Errors
    ///
    /// Returns error if the store fails
    pub async fn block_steps(&self, block: BlockId) -> CoreResult<Vec<Step>> {
        self.store.block_steps(block).await
    }

    fn materialize(&self, requests: Vec<NewStep>, shards: &[Shard]) -> CoreResult<Vec<Step>> {
        requests
            .into_iter()
            .map(|request| {
                let unit = self.registry.get(&request.unit_type)?;
                let join_policy = unit.join_policy().unwrap_or(self.config.default_join_policy);
                let block = request.block_id.unwrap_or_default();
                let shard = self.dispatcher.assign(shards)?;
                Ok(Step::from_request(
                    request,
                    block,
                    shard,
                    self.config.default_max_attempts,
                    join_policy,
                ))
            })
            .collect()
    }

    /// Fill in or check `parent_step_id` against the block owners
    async fn link_parents(&self, steps: &mut [Step]) -> CoreResult<()> {
        let mut owners: HashMap<BlockId, Option<StepId>> = steps
            .iter()
            .filter_map(|step| step.child_block_id.map(|block| (block, Some(step.id))))
            .collect();

        for step in steps.iter_mut() {
            let owner = match owners.get(&step.block_id) {
                Some(owner) => *owner,
                None => {
                    let owner = self
                        .store
                        .parent_of_block(step.block_id)
                        .await?
                        .map(|parent| parent.id);
                    owners.insert(step.block_id, owner);
                    owner
                }
            };
            match (step.parent_step_id, owner) {
                (None, owner) => step.parent_step_id = owner,
                (Some(declared), Some(owner)) if declared == owner => {}
                (Some(declared), _) => {
                    return Err(CoreError::OrphanedChildBlock {
                        block: step.block_id,
                        reason: format!("step names parent {} which does not own the block", declared),
                    });
                }
            }
        }
        Ok(())
    }

    // Claiming and running

    /// Claim the next eligible step on `shard`
    ///
    /// # Errors
    ///
    /// Returns error if the store fails
    pub async fn claim_next(&self, shard: &str, worker: WorkerId) -> CoreResult<Option<Step>> {
        let claimed = self.store.claim_next(shard, worker, Utc::now()).await?;
        if let Some(step) = &claimed {
            self.monitor.record(Metrics::record_claim);
            debug!(step_id = %step.id, shard, %worker, "step claimed");
        }
        Ok(claimed)
    }

    /// Claim a specific step
    ///
    /// At most one of any number of concurrent callers succeeds.
    ///
    /// # Errors
    ///
    /// Returns error if the step does not exist or the store fails
    pub async fn try_claim(&self, id: StepId, worker: WorkerId) -> CoreResult<Option<Step>> {
        let claimed = self.store.try_claim(id, worker, Utc::now()).await?;
        if claimed.is_some() {
            self.monitor.record(Metrics::record_claim);
            debug!(step_id = %id, %worker, "step claimed");
        }
        Ok(claimed)
    }

    /// Claim and run the next eligible step on `shard`
    ///
    /// # Errors
    ///
    /// Returns error if the store fails or a join hits an orphaned block
    pub async fn run_next(
        &self,
        shard: &str,
        worker: WorkerId,
    ) -> CoreResult<Option<(StepId, StepOutcome)>> {
        match self.claim_next(shard, worker).await? {
            Some(step) => {
                let id = step.id;
                let outcome = self.run_claimed(step).await?;
                Ok(Some((id, outcome)))
            }
            None => Ok(None),
        }
    }

    /// Drive a claimed step through its lifecycle and commit the outcome
    ///
    /// # Errors
    ///
    /// Returns error if the step is not claimed, the store fails, or the
    /// join cascade hits an orphaned block
    pub async fn run_claimed(&self, step: Step) -> CoreResult<StepOutcome> {
        let token = claim_token(&step)?;
        let block = step.block_id;
        let id = step.id;

        let unit = match self.registry.get(&step.unit_type) {
            Ok(unit) => unit,
            Err(err) => {
                error!(step_id = %id, unit_type = %step.unit_type, "no unit registered for step");
                let run = self.runner.reject(step, UnitError::from(err));
                let outcome = self.apply(None, run, token, Vec::new()).await?;
                self.settle(id, block, &outcome).await?;
                return Ok(outcome);
            }
        };

        let run = self
            .while_claimed(id, token, self.runner.run(unit.as_ref(), step))
            .await;
        let (run, children) = self.place_children(unit.as_ref(), run).await?;
        let outcome = self.apply(Some(unit.as_ref()), run, token, children).await?;
        self.settle(id, block, &outcome).await?;
        Ok(outcome)
    }

    /// Materialize children queued by `execute`
    ///
    /// If they cannot be placed the attempt fails instead.
    async fn place_children(
        &self,
        unit: &dyn Unit,
        mut run: LifecycleRun,
    ) -> CoreResult<(LifecycleRun, Vec<Step>)> {
        let requests = std::mem::take(&mut run.spawned);
        if requests.is_empty() {
            return Ok((run, Vec::new()));
        }

        let shards = self.store.shards().await?;
        match self.materialize(requests, &shards) {
            Ok(children) => Ok((run, children)),
            Err(err) => {
                warn!(step_id = %run.step.id, error = %err, "could not place child steps");
                let LifecycleRun { mut step, ctx, .. } = run;
                step.child_block_id = None;
                step.awaiting_children = false;
                step.result = None;
                Ok((self.runner.fail(unit, step, ctx, UnitError::from(err)), Vec::new()))
            }
        }
    }

    /// Commit a run, then record, log and notify
    async fn apply(
        &self,
        unit: Option<&dyn Unit>,
        run: LifecycleRun,
        token: ClaimToken,
        children: Vec<Step>,
    ) -> CoreResult<StepOutcome> {
        let LifecycleRun {
            step, outcome, ctx, ..
        } = run;
        let id = step.id;
        let attempt = step.attempt_count;

        if !self.store.commit(step, token, children).await? {
            warn!(step_id = %id, outcome = outcome.label(), "claim lost, discarding result");
            let lost = StepOutcome::ClaimLost;
            self.monitor.record(|metrics| metrics.record_outcome(&lost));
            return Ok(lost);
        }
        self.monitor.record(|metrics| metrics.record_outcome(&outcome));

        match &outcome {
            StepOutcome::Completed | StepOutcome::Skipped => {
                info!(step_id = %id, unit_type = %ctx.unit_type, shard = %ctx.shard, outcome = outcome.label(), "step finished");
            }
            StepOutcome::Failed { error } => {
                error!(step_id = %id, unit_type = %ctx.unit_type, shard = %ctx.shard, attempt, error = %error, "step failed");
                if let Some(unit) = unit {
                    unit.on_failure(&ctx, error).await;
                }
            }
            StepOutcome::AwaitingChildren { block, spawned } => {
                info!(step_id = %id, block_id = %block, children = spawned, "step spawned child block");
            }
            StepOutcome::Retrying { error, class: ErrorClass::Transient, delay } => {
                warn!(step_id = %id, attempt, ?delay, error = %error, "lock timeout, step requeued");
            }
            other => {
                debug!(step_id = %id, attempt, outcome = other.label(), "step requeued");
            }
        }
        Ok(outcome)
    }

    /// Follow-up after a committed run: join cascade and parent joins
    async fn settle(&self, id: StepId, block: BlockId, outcome: &StepOutcome) -> CoreResult<()> {
        if outcome.is_terminal() {
            self.cascade(block).await?;
        } else if let StepOutcome::AwaitingChildren { .. } = outcome {
            if let Some(parent_block) = self.join_parent(id).await? {
                self.cascade(parent_block).await?;
            }
        }
        Ok(())
    }

    // Joins

    /// Resolve parents up the tree once `block` is drained
    async fn cascade(&self, block: BlockId) -> CoreResult<()> {
        let mut next = Some(block);
        while let Some(block) = next.take() {
            let members = self.store.block_steps(block).await?;
            if !WaveBarrier::from_steps(&members).is_drained() {
                break;
            }
            let indexed = self.store.parent_of_block(block).await?;
            let parent = match resolve_parent(block, &members, indexed.as_ref()) {
                Ok(Some(parent)) => parent,
                Ok(None) => break,
                Err(err) => {
                    self.monitor.record(Metrics::record_orphaned_block);
                    error!(block_id = %block, error = %err, "orphaned child block");
                    return Err(err);
                }
            };
            next = self.join_parent(parent).await?;
        }
        Ok(())
    }

    /// Claim and resolve one parent against its child block
    ///
    /// Returns the parent's own block when the parent became terminal.
    async fn join_parent(&self, parent: StepId) -> CoreResult<Option<BlockId>> {
        let Some(parent) = self.store.claim_join(parent, self.joiner, Utc::now()).await? else {
            return Ok(None);
        };
        let token = claim_token(&parent)?;
        let block = parent.block_id;
        let child_block = parent.child_block_id.ok_or_else(|| CoreError::Internal {
            message: format!("parent {} has no child block", parent.id),
        })?;
        let children = self.store.block_steps(child_block).await?;

        let (unit, run) = match self.registry.get(&parent.unit_type) {
            Ok(unit) => {
                let id = parent.id;
                let run = self
                    .while_claimed(id, token, self.runner.join(unit.as_ref(), parent, &children))
                    .await;
                (Some(unit), run)
            }
            Err(err) => (None, self.runner.reject(parent, UnitError::from(err))),
        };
        let outcome = self.apply(unit.as_deref(), run, token, Vec::new()).await?;

        if outcome.is_terminal() {
            self.monitor.record(Metrics::record_join);
            debug!(block_id = %child_block, children = children.len(), outcome = outcome.label(), "child block joined");
            Ok(Some(block))
        } else {
            Ok(None)
        }
    }

    /// Sweep parents whose child block is done
    ///
    /// Picks up joins the cascade could not take at the time, e.g. because
    /// the parent's shard was closed or a finalize retry was backing off.
    /// An orphaned block further up is logged and counted, and the sweep
    /// moves on to the next parent.
    ///
    /// # Errors
    ///
    /// Returns error if the store fails
    pub async fn resolve_joins(&self, shard: Option<&str>) -> CoreResult<usize> {
        let mut resolved = 0;
        for parent in self.store.awaiting_parents(shard).await? {
            let Some(child_block) = parent.child_block_id else {
                continue;
            };
            let children = self.store.block_steps(child_block).await?;
            if matches!(
                evaluate_join(&children, parent.join_policy),
                JoinDecision::Waiting { .. }
            ) {
                continue;
            }
            if let Some(block) = self.join_parent(parent.id).await? {
                resolved += 1;
                match self.cascade(block).await {
                    Ok(()) | Err(CoreError::OrphanedChildBlock { .. }) => {}
                    Err(err) => return Err(err),
                }
            }
        }
        Ok(resolved)
    }

    // Recovery

    /// Fail a step from outside, without running any hook
    ///
    /// A worker still running it loses its commit. Returns `false` if the
    /// step was already terminal.
    ///
    /// # Errors
    ///
    /// Returns error if the step does not exist or the cascade fails
    pub async fn force_fail(&self, id: StepId, reason: &str) -> CoreResult<bool> {
        let step = self.store.get(id).await?;
        let detail = FailureDetail::new(reason, None, step.attempt_count);
        match self.store.force_fail(id, detail).await? {
            Some(failed) => {
                self.monitor.record(Metrics::record_forced_failure);
                info!(step_id = %id, reason, "step force-failed");
                self.cascade(failed.block_id).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Expire claims older than `lease`
    ///
    /// Each expiry spends an attempt: the step goes back to Pending and runs
    /// again from the start, or fails once its attempts are used up. Workers
    /// renew their claims while hooks run, so only a dead or wedged worker
    /// lets a lease run out. Returns the ids of every expired step.
    ///
    /// # Errors
    ///
    /// Returns error if the lease is out of range or the store fails
    pub async fn requeue_stale(&self, lease: Duration) -> CoreResult<Vec<StepId>> {
        let lease = to_chrono("lease", lease)?;
        let now = Utc::now();
        let cutoff = now.checked_sub_signed(lease).unwrap_or(DateTime::<Utc>::MIN_UTC);
        let expired = self.store.requeue_stale(cutoff).await?;
        if !expired.is_empty() {
            self.monitor.record(|metrics| metrics.record_requeued(expired.len()));
        }

        for step in &expired {
            if !step.is_terminal() {
                warn!(step_id = %step.id, attempt = step.attempt_count, "claim lease expired, step requeued");
                continue;
            }
            self.monitor.record(Metrics::record_forced_failure);
            error!(step_id = %step.id, unit_type = %step.unit_type, attempt = step.attempt_count, "claim lease expired, attempts exhausted");
            if let Ok(unit) = self.registry.get(&step.unit_type) {
                let ctx = StepContext::new(step, Arc::clone(self.locks()));
                let err = UnitError::LeaseExpired {
                    attempts: step.attempt_count,
                };
                unit.on_failure(&ctx, &err).await;
            }
            match self.cascade(step.block_id).await {
                Ok(()) | Err(CoreError::OrphanedChildBlock { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(expired.iter().map(|step| step.id).collect())
    }

    /// Run `work` while renewing the claim on `id`
    ///
    /// Renewal stops once the claim is lost; `work` still runs to the end
    /// and its commit is then rejected.
    async fn while_claimed<F: Future>(&self, id: StepId, token: ClaimToken, work: F) -> F::Output {
        tokio::pin!(work);
        let renew = self.keep_claim(id, token);
        tokio::pin!(renew);
        tokio::select! {
            biased;
            output = &mut work => output,
            () = &mut renew => work.await,
        }
    }

    /// Renew a claim every third of the lease until it is lost
    async fn keep_claim(&self, id: StepId, token: ClaimToken) {
        let every = (self.config.lease() / 3).max(Duration::from_millis(1));
        loop {
            tokio::time::sleep(every).await;
            match self.store.renew_claim(id, token, Utc::now()).await {
                Ok(true) => {}
                Ok(false) => {
                    warn!(step_id = %id, "claim lost while hooks were running");
                    return;
                }
                Err(err) => warn!(step_id = %id, error = %err, "claim renewal failed"),
            }
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

fn claim_token(step: &Step) -> CoreResult<ClaimToken> {
    step.claim_token.ok_or_else(|| CoreError::Validation {
        field: "claim_token".to_string(),
        reason: format!("step {} is not claimed", step.id),
    })
}

fn to_chrono(field: &str, duration: Duration) -> CoreResult<chrono::Duration> {
    chrono::Duration::from_std(duration).map_err(|err| CoreError::Validation {
        field: field.to_string(),
        reason: err.to_string(),
    })
}
