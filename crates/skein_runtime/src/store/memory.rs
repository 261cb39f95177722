//! In-memory step store for tests and single-process runs.

use super::StepStore;
use crate::scheduler::WaveBarrier;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use skein_core::{
    BlockId, ClaimToken, CoreError, CoreResult, CycleId, FailureDetail, Shard, Step, StepId,
    StepState, WorkerId,
};
use std::collections::HashMap;
use std::sync::Mutex;

#[derive(Default)]
struct Tables {
    steps: IndexMap<StepId, Step>,
    blocks: HashMap<BlockId, Vec<StepId>>,
    parents: HashMap<BlockId, StepId>,
    shards: IndexMap<String, Shard>,
}

impl Tables {
    fn step(&self, id: StepId) -> CoreResult<&Step> {
        self.steps.get(&id).ok_or_else(|| CoreError::step_not_found(id))
    }

    fn block(&self, block: BlockId) -> impl Iterator<Item = &Step> {
        self.blocks
            .get(&block)
            .into_iter()
            .flatten()
            .filter_map(|id| self.steps.get(id))
    }

    fn barrier(&self, block: BlockId) -> WaveBarrier {
        WaveBarrier::from_steps(self.block(block))
    }

    fn shard_open(&self, name: &str) -> bool {
        self.shards.get(name).is_some_and(|shard| shard.can_dispatch)
    }

    fn admits(&self, step: &Step, now: DateTime<Utc>) -> bool {
        step.is_claimable(now)
            && self.shard_open(&step.shard)
            && self.barrier(step.block_id).admits(step.wave_index)
    }

    /// Reject a batch that would clash with stored ids or block owners
    fn check_new(&self, steps: &[Step]) -> CoreResult<()> {
        let mut owners: HashMap<BlockId, StepId> = HashMap::new();
        for step in steps {
            if self.steps.contains_key(&step.id) {
                return Err(CoreError::AlreadyExists {
                    kind: "step".to_string(),
                    id: step.id.to_string(),
                });
            }
            if let Some(block) = step.child_block_id {
                self.check_owner(block, step.id)?;
                if owners.insert(block, step.id).is_some() {
                    return Err(owner_clash(block));
                }
            }
        }
        Ok(())
    }

    fn check_owner(&self, block: BlockId, owner: StepId) -> CoreResult<()> {
        match self.parents.get(&block) {
            Some(existing) if *existing != owner => Err(owner_clash(block)),
            _ => Ok(()),
        }
    }

    fn insert(&mut self, step: Step) {
        if let Some(block) = step.child_block_id {
            self.parents.insert(block, step.id);
        }
        self.blocks.entry(step.block_id).or_default().push(step.id);
        self.steps.insert(step.id, step);
    }

    fn claim(&mut self, id: StepId, worker: WorkerId, now: DateTime<Utc>) -> Option<Step> {
        let step = self.steps.get_mut(&id)?;
        step.state = StepState::Running;
        step.claimed_by = Some(worker);
        step.claim_token = Some(ClaimToken::new());
        step.claimed_at = Some(now);
        step.updated_at = now;
        Some(step.clone())
    }

    fn shard_mut(&mut self, name: &str) -> CoreResult<&mut Shard> {
        self.shards
            .get_mut(name)
            .ok_or_else(|| CoreError::shard_not_found(name))
    }
}

fn owner_clash(block: BlockId) -> CoreError {
    CoreError::AlreadyExists {
        kind: "child block owner".to_string(),
        id: block.to_string(),
    }
}

/// Step store held in process memory
///
/// One mutex guards every table, so eligibility checks and claims are a
/// single critical section.
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
}

impl MemoryStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn tables(&self) -> CoreResult<std::sync::MutexGuard<'_, Tables>> {
        self.tables.lock().map_err(|_| CoreError::Storage {
            message: "memory store poisoned".to_string(),
        })
    }
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (steps, shards) = self
            .tables
            .lock()
            .map(|tables| (tables.steps.len(), tables.shards.len()))
            .unwrap_or_default();
        f.debug_struct("MemoryStore")
            .field("steps", &steps)
            .field("shards", &shards)
            .finish()
    }
}

#[async_trait]
impl StepStore for MemoryStore {
    async fn insert_steps(&self, steps: Vec<Step>) -> CoreResult<()> {
        let mut tables = self.tables()?;
        tables.check_new(&steps)?;
        for step in steps {
            tables.insert(step);
        }
        Ok(())
    }

    async fn get(&self, id: StepId) -> CoreResult<Step> {
        self.tables()?.step(id).cloned()
    }

    async fn block_steps(&self, block: BlockId) -> CoreResult<Vec<Step>> {
        Ok(self.tables()?.block(block).cloned().collect())
    }

    async fn parent_of_block(&self, block: BlockId) -> CoreResult<Option<Step>> {
        let tables = self.tables()?;
        Ok(tables
            .parents
            .get(&block)
            .and_then(|id| tables.steps.get(id))
            .cloned())
    }

    async fn claim_next(
        &self,
        shard: &str,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<Step>> {
        let mut tables = self.tables()?;
        if !tables.shard_open(shard) {
            return Ok(None);
        }

        let mut barriers: HashMap<BlockId, WaveBarrier> = HashMap::new();
        let mut chosen = None;
        for step in tables.steps.values() {
            if step.shard != shard || !step.is_claimable(now) {
                continue;
            }
            let barrier = *barriers
                .entry(step.block_id)
                .or_insert_with(|| tables.barrier(step.block_id));
            if barrier.admits(step.wave_index) {
                chosen = Some(step.id);
                break;
            }
        }

        Ok(chosen.and_then(|id| tables.claim(id, worker, now)))
    }

    async fn try_claim(
        &self,
        id: StepId,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<Step>> {
        let mut tables = self.tables()?;
        let eligible = tables.admits(tables.step(id)?, now);
        Ok(if eligible {
            tables.claim(id, worker, now)
        } else {
            None
        })
    }

    async fn claim_join(
        &self,
        id: StepId,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<Step>> {
        let mut tables = self.tables()?;
        let step = tables.step(id)?;
        let ready = step.state == StepState::Pending
            && step.awaiting_children
            && step.is_due(now)
            && tables.shard_open(&step.shard)
            && tables.barrier(step.block_id).admits(step.wave_index);
        Ok(if ready {
            tables.claim(id, worker, now)
        } else {
            None
        })
    }

    async fn commit(
        &self,
        mut step: Step,
        expected: ClaimToken,
        spawned: Vec<Step>,
    ) -> CoreResult<bool> {
        let mut tables = self.tables()?;
        let current = tables.step(step.id)?;
        if current.state != StepState::Running || current.claim_token != Some(expected) {
            return Ok(false);
        }
        if !StepState::Running.can_transition_to(step.state) {
            return Err(CoreError::InvalidTransition {
                step: step.id,
                from: StepState::Running,
                to: step.state,
            });
        }
        if let Some(block) = step.child_block_id {
            tables.check_owner(block, step.id)?;
        }
        tables.check_new(&spawned)?;

        step.release_claim();
        step.updated_at = Utc::now();
        if let Some(block) = step.child_block_id {
            tables.parents.insert(block, step.id);
        }
        tables.steps.insert(step.id, step);
        for child in spawned {
            tables.insert(child);
        }
        Ok(true)
    }

    async fn force_fail(&self, id: StepId, detail: FailureDetail) -> CoreResult<Option<Step>> {
        let mut tables = self.tables()?;
        let step = tables
            .steps
            .get_mut(&id)
            .ok_or_else(|| CoreError::step_not_found(id))?;
        if step.is_terminal() {
            return Ok(None);
        }
        step.state = StepState::Failed;
        step.failure_detail = Some(detail);
        step.release_claim();
        step.updated_at = Utc::now();
        Ok(Some(step.clone()))
    }

    async fn renew_claim(
        &self,
        id: StepId,
        token: ClaimToken,
        now: DateTime<Utc>,
    ) -> CoreResult<bool> {
        let mut tables = self.tables()?;
        let step = tables
            .steps
            .get_mut(&id)
            .ok_or_else(|| CoreError::step_not_found(id))?;
        if step.state != StepState::Running || step.claim_token != Some(token) {
            return Ok(false);
        }
        step.claimed_at = Some(now);
        Ok(true)
    }

    async fn requeue_stale(&self, cutoff: DateTime<Utc>) -> CoreResult<Vec<Step>> {
        let mut tables = self.tables()?;
        let now = Utc::now();
        let mut expired = Vec::new();
        for step in tables.steps.values_mut() {
            let stale = step.state == StepState::Running
                && step.claimed_at.map_or(true, |at| at < cutoff);
            if !stale {
                continue;
            }
            step.attempt_count += 1;
            if step.attempts_exhausted() {
                step.state = StepState::Failed;
                step.failure_detail = Some(FailureDetail::new(
                    "claim lease expired",
                    None,
                    step.attempt_count,
                ));
            } else {
                step.state = StepState::Pending;
            }
            step.release_claim();
            step.updated_at = now;
            expired.push(step.clone());
        }
        Ok(expired)
    }

    async fn awaiting_parents(&self, shard: Option<&str>) -> CoreResult<Vec<Step>> {
        Ok(self
            .tables()?
            .steps
            .values()
            .filter(|step| step.state == StepState::Pending && step.awaiting_children)
            .filter(|step| shard.map_or(true, |name| step.shard == name))
            .cloned()
            .collect())
    }

    async fn list_steps(&self) -> CoreResult<Vec<Step>> {
        Ok(self.tables()?.steps.values().cloned().collect())
    }

    async fn count_by_state(&self) -> CoreResult<IndexMap<StepState, usize>> {
        let tables = self.tables()?;
        let mut counts: IndexMap<StepState, usize> =
            StepState::ALL.iter().map(|state| (*state, 0)).collect();
        for step in tables.steps.values() {
            *counts.entry(step.state).or_default() += 1;
        }
        Ok(counts)
    }

    async fn register_shard(&self, shard: Shard) -> CoreResult<bool> {
        let mut tables = self.tables()?;
        if tables.shards.contains_key(&shard.name) {
            return Ok(false);
        }
        tables.shards.insert(shard.name.clone(), shard);
        Ok(true)
    }

    async fn shard(&self, name: &str) -> CoreResult<Shard> {
        self.tables()?
            .shards
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::shard_not_found(name))
    }

    async fn shards(&self) -> CoreResult<Vec<Shard>> {
        Ok(self.tables()?.shards.values().cloned().collect())
    }

    async fn set_can_dispatch(&self, name: &str, can_dispatch: bool) -> CoreResult<()> {
        self.tables()?.shard_mut(name)?.can_dispatch = can_dispatch;
        Ok(())
    }

    async fn touch_heartbeat(
        &self,
        name: &str,
        cycle: CycleId,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        let mut tables = self.tables()?;
        let shard = tables.shard_mut(name)?;
        shard.in_flight_cycle_id = Some(cycle);
        shard.cycle_started_at = Some(now);
        Ok(())
    }

    async fn complete_cycle(
        &self,
        name: &str,
        cycle: CycleId,
        now: DateTime<Utc>,
    ) -> CoreResult<bool> {
        let mut tables = self.tables()?;
        let shard = tables.shard_mut(name)?;
        if shard.in_flight_cycle_id != Some(cycle) {
            return Ok(false);
        }
        shard.in_flight_cycle_id = None;
        shard.cycle_started_at = None;
        shard.last_cycle_completed_at = Some(now);
        Ok(true)
    }
}
