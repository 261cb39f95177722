//! Step records.
//!
//! A [`Step`] is one persisted unit of work. Steps sharing a `block_id` form a
//! block; within a block, steps sharing a `wave_index` form a wave. A step with
//! a `child_block_id` is a parent and only completes once every step of that
//! child block is terminal.

use crate::{BlockId, ClaimToken, StepId, StepState, WorkerId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Weak reference to a business entity, for grouping and dashboards only
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubjectRef {
    /// Entity kind, e.g. `position`
    pub kind: String,
    /// Entity id in its own system
    pub id: String,
}

impl SubjectRef {
    /// Create a new subject reference
    #[must_use]
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl std::fmt::Display for SubjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// How a parent resolves when some of its children failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinPolicy {
    /// Any Failed child fails the parent
    #[default]
    FailFast,
    /// The parent completes regardless of child outcomes
    IgnoreFailures,
}

/// Error context captured on a failed attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    /// Error message
    pub message: String,
    /// External status code, when the error carried one
    pub status: Option<u16>,
    /// Attempt count at the time of the failure
    pub attempt: u32,
    /// When the failure was recorded
    pub recorded_at: DateTime<Utc>,
}

impl FailureDetail {
    /// Create a failure detail stamped now
    #[must_use]
    pub fn new(message: impl Into<String>, status: Option<u16>, attempt: u32) -> Self {
        Self {
            message: message.into(),
            status,
            attempt,
            recorded_at: Utc::now(),
        }
    }
}

/// Creation request for a step
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewStep {
    /// Registered unit type to run
    pub unit_type: String,
    /// Opaque input payload
    pub arguments: serde_json::Value,
    /// Block to join; `None` allocates a fresh block
    pub block_id: Option<BlockId>,
    /// Wave within the block; `None` means wave 0
    pub wave_index: Option<u32>,
    /// Pre-allocated child block, making this a pure join point
    pub child_block_id: Option<BlockId>,
    /// Parent owning `block_id`, when the block is a child block
    pub parent_step_id: Option<StepId>,
    /// Attempt budget; `None` uses the engine default
    pub max_attempts: Option<u32>,
    /// Join policy override for parents
    pub join_policy: Option<JoinPolicy>,
    /// Observability-only back reference
    pub subject_ref: Option<SubjectRef>,
}

impl NewStep {
    /// Create a request for a step in wave 0 of a new block
    #[must_use]
    pub fn new(unit_type: impl Into<String>, arguments: serde_json::Value) -> Self {
        Self {
            unit_type: unit_type.into(),
            arguments,
            block_id: None,
            wave_index: None,
            child_block_id: None,
            parent_step_id: None,
            max_attempts: None,
            join_policy: None,
            subject_ref: None,
        }
    }

    /// Place the step in an existing block at the given wave
    #[must_use]
    pub fn in_block(mut self, block_id: BlockId, wave_index: u32) -> Self {
        self.block_id = Some(block_id);
        self.wave_index = Some(wave_index);
        self
    }

    /// Place the step in `parent`'s child block at the given wave
    #[must_use]
    pub fn in_child_block(mut self, parent: StepId, block_id: BlockId, wave_index: u32) -> Self {
        self.block_id = Some(block_id);
        self.wave_index = Some(wave_index);
        self.parent_step_id = Some(parent);
        self
    }

    /// Make the step a pure join point over `child_block_id`
    #[must_use]
    pub fn with_child_block(mut self, child_block_id: BlockId) -> Self {
        self.child_block_id = Some(child_block_id);
        self
    }

    /// Set the attempt budget
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Override the join policy
    #[must_use]
    pub fn with_join_policy(mut self, policy: JoinPolicy) -> Self {
        self.join_policy = Some(policy);
        self
    }

    /// Attach a subject reference
    #[must_use]
    pub fn with_subject(mut self, subject: SubjectRef) -> Self {
        self.subject_ref = Some(subject);
        self
    }
}

/// One schedulable unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    /// Step id
    pub id: StepId,
    /// Registered unit type
    pub unit_type: String,
    /// Opaque input payload
    pub arguments: serde_json::Value,
    /// Sibling set this step belongs to
    pub block_id: BlockId,
    /// Ordering position within the block
    pub wave_index: u32,
    /// Block this step waits on, when it is a parent
    pub child_block_id: Option<BlockId>,
    /// Parent owning `block_id`, when the block is a child block
    pub parent_step_id: Option<StepId>,
    /// Join policy, meaningful once `child_block_id` is set
    pub join_policy: JoinPolicy,
    /// Unit work is done and the step waits for its child block
    pub awaiting_children: bool,
    /// Worker partition, fixed at creation
    pub shard: String,
    /// Lifecycle state
    pub state: StepState,
    /// Failed attempts so far
    pub attempt_count: u32,
    /// Attempt budget
    pub max_attempts: u32,
    /// Output captured on success
    pub result: Option<serde_json::Value>,
    /// Error context of the last failed attempt
    pub failure_detail: Option<FailureDetail>,
    /// Observability-only back reference
    pub subject_ref: Option<SubjectRef>,
    /// Earliest time the step may be claimed again
    pub not_before: Option<DateTime<Utc>>,
    /// Worker holding the current claim
    pub claimed_by: Option<WorkerId>,
    /// Token of the current claim
    pub claim_token: Option<ClaimToken>,
    /// When the current claim was taken
    pub claimed_at: Option<DateTime<Utc>>,
    /// Creation time
    pub created_at: DateTime<Utc>,
    /// Last write time
    pub updated_at: DateTime<Utc>,
}

impl Step {
    /// Materialize a creation request
    ///
    /// Block, wave and attempt defaults must already be resolved by the
    /// caller; `shard` comes from the dispatcher.
    #[must_use]
    pub fn from_request(
        request: NewStep,
        block_id: BlockId,
        shard: String,
        max_attempts: u32,
        join_policy: JoinPolicy,
    ) -> Self {
        let now = Utc::now();
        let awaiting_children = request.child_block_id.is_some();
        Self {
            id: StepId::new(),
            unit_type: request.unit_type,
            arguments: request.arguments,
            block_id,
            wave_index: request.wave_index.unwrap_or(0),
            child_block_id: request.child_block_id,
            parent_step_id: request.parent_step_id,
            join_policy: request.join_policy.unwrap_or(join_policy),
            awaiting_children,
            shard,
            state: StepState::Pending,
            attempt_count: 0,
            max_attempts: request.max_attempts.unwrap_or(max_attempts).max(1),
            result: None,
            failure_detail: None,
            subject_ref: request.subject_ref,
            not_before: None,
            claimed_by: None,
            claim_token: None,
            claimed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Whether the step reached a final state
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether the step owns a child block
    #[must_use]
    pub const fn is_parent(&self) -> bool {
        self.child_block_id.is_some()
    }

    /// Whether the backoff window has elapsed
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.not_before.map_or(true, |at| at <= now)
    }

    /// Whether one more failure would exceed the attempt budget
    #[must_use]
    pub const fn attempts_exhausted(&self) -> bool {
        self.attempt_count >= self.max_attempts
    }

    /// Whether a worker may run this step's unit logic
    ///
    /// Parents waiting on their child block are resolved by the join
    /// cascade, never by a regular claim.
    #[must_use]
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.state == StepState::Pending && !self.awaiting_children && self.is_due(now)
    }

    /// Drop the claim fields
    pub fn release_claim(&mut self) {
        self.claimed_by = None;
        self.claim_token = None;
        self.claimed_at = None;
    }
}
