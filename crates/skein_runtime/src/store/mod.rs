//! Persistence seam for steps and shards.
//!
//! Every state change goes through a conditional operation: a claim only
//! succeeds on an eligible Pending step, and a commit only succeeds while the
//! caller still holds the claim it was given. A durable backend implements the
//! same contract with conditional updates.

mod memory;

pub use memory::MemoryStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use skein_core::{
    BlockId, ClaimToken, CoreResult, CycleId, FailureDetail, Shard, Step, StepId, StepState,
    WorkerId,
};

/// Storage backend for steps and shards
#[async_trait]
pub trait StepStore: Send + Sync {
    /// Persist new steps atomically
    ///
    /// Steps carrying a `child_block_id` are indexed as the owner of that block.
    async fn insert_steps(&self, steps: Vec<Step>) -> CoreResult<()>;

    /// Fetch a step
    async fn get(&self, id: StepId) -> CoreResult<Step>;

    /// Every step of a block
    async fn block_steps(&self, block: BlockId) -> CoreResult<Vec<Step>>;

    /// Step registered as owner of `block`
    async fn parent_of_block(&self, block: BlockId) -> CoreResult<Option<Step>>;

    /// Claim the oldest eligible step of `shard`
    async fn claim_next(
        &self,
        shard: &str,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<Step>>;

    /// Claim one specific step if it is eligible
    ///
    /// Of any number of concurrent callers for the same step, at most one
    /// gets `Some`.
    async fn try_claim(
        &self,
        id: StepId,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<Step>>;

    /// Claim a parent whose child block may be ready for joining
    async fn claim_join(
        &self,
        id: StepId,
        worker: WorkerId,
        now: DateTime<Utc>,
    ) -> CoreResult<Option<Step>>;

    /// Write the outcome of a claimed run
    ///
    /// Succeeds only while the stored step is Running under `expected`. The
    /// claim is released and `spawned` children are inserted in the same
    /// write. Returns `false` when the claim was lost.
    async fn commit(&self, step: Step, expected: ClaimToken, spawned: Vec<Step>)
    -> CoreResult<bool>;

    /// Move a non-terminal step to Failed without a claim
    ///
    /// Returns the failed step, or `None` if it was already terminal.
    async fn force_fail(&self, id: StepId, detail: FailureDetail) -> CoreResult<Option<Step>>;

    /// Extend a claim while its holder is still running the step
    ///
    /// Stamps `claimed_at = now` only while the stored step is Running under
    /// `token`. Returns `false` when the claim was lost.
    async fn renew_claim(&self, id: StepId, token: ClaimToken, now: DateTime<Utc>)
    -> CoreResult<bool>;

    /// Expire Running claims taken before `cutoff`
    ///
    /// Each expiry spends an attempt. Steps with attempts left go back to
    /// Pending, the rest become Failed. Returns the updated steps.
    async fn requeue_stale(&self, cutoff: DateTime<Utc>) -> CoreResult<Vec<Step>>;

    /// Pending parents waiting on their child block
    async fn awaiting_parents(&self, shard: Option<&str>) -> CoreResult<Vec<Step>>;

    /// Every step, in creation order
    async fn list_steps(&self) -> CoreResult<Vec<Step>>;

    /// Step counts per state
    async fn count_by_state(&self) -> CoreResult<IndexMap<StepState, usize>>;

    /// Register a shard; returns `false` if it already existed
    async fn register_shard(&self, shard: Shard) -> CoreResult<bool>;

    /// Fetch a shard
    async fn shard(&self, name: &str) -> CoreResult<Shard>;

    /// Every shard
    async fn shards(&self) -> CoreResult<Vec<Shard>>;

    /// Flip a shard's circuit breaker
    async fn set_can_dispatch(&self, name: &str, can_dispatch: bool) -> CoreResult<()>;

    /// Mark a poll cycle as in flight
    async fn touch_heartbeat(&self, name: &str, cycle: CycleId, now: DateTime<Utc>)
    -> CoreResult<()>;

    /// Close the in-flight cycle if it is still `cycle`
    async fn complete_cycle(&self, name: &str, cycle: CycleId, now: DateTime<Utc>)
    -> CoreResult<bool>;
}
