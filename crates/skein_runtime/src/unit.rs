//! Unit trait: the hook contract business logic implements.
//!
//! A unit is registered once under its `unit_type` and driven by the
//! lifecycle runner for every step of that type. Hooks never reach for
//! ambient state; everything about the running step is in the
//! [`StepContext`] they receive.

use crate::lock::{LockGuard, LockManager};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use skein_core::{BlockId, CoreError, JoinPolicy, NewStep, Step, StepId, SubjectRef};
use std::sync::Arc;
use std::time::Duration;

/// Error raised by a unit hook
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UnitError {
    /// Failure reported by an external system
    #[error("{message}")]
    External {
        /// Status code, when the external system returned one
        status: Option<u16>,
        /// Error message
        message: String,
    },

    /// A named lock could not be taken in time
    #[error("lock `{name}` not acquired within {timeout:?}")]
    LockTimeout {
        /// Lock name
        name: String,
        /// How long the step waited
        timeout: Duration,
    },

    /// Arguments did not decode into what the unit expects
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// `check_precondition` returned false
    #[error("precondition not met for {0}")]
    PreconditionFailed(String),

    /// `verify` returned false
    #[error("verification failed for {0}")]
    VerificationFailed(String),

    /// Fail-fast join over a child block with failed members
    #[error("{failed} of {total} children failed in {block}")]
    ChildrenFailed {
        /// Child block
        block: BlockId,
        /// Failed children
        failed: usize,
        /// Size of the block
        total: usize,
    },

    /// The claim expired before the run committed, with no attempts left
    #[error("claim lease expired after {attempts} attempts")]
    LeaseExpired {
        /// Attempts spent
        attempts: u32,
    },

    /// Anything else
    #[error("{0}")]
    Message(String),

    /// Core layer failure surfaced inside a hook
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl UnitError {
    /// External failure with an optional status code
    #[must_use]
    pub fn external(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::External {
            status,
            message: message.into(),
        }
    }

    /// Free-form failure
    #[must_use]
    pub fn msg(message: impl Into<String>) -> Self {
        Self::Message(message.into())
    }

    /// Message part of the observable signature
    #[must_use]
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Status code, if any
    #[must_use]
    pub const fn status(&self) -> Option<u16> {
        match self {
            Self::External { status, .. } => *status,
            _ => None,
        }
    }
}

impl From<serde_json::Error> for UnitError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidArguments(err.to_string())
    }
}

/// Everything a hook may know about the step it runs for
pub struct StepContext {
    /// Step id
    pub step_id: StepId,
    /// Unit type
    pub unit_type: String,
    /// Raw arguments
    pub arguments: serde_json::Value,
    /// Block the step belongs to
    pub block_id: BlockId,
    /// Wave within the block
    pub wave_index: u32,
    /// Failed attempts so far
    pub attempt_count: u32,
    /// Attempt budget
    pub max_attempts: u32,
    /// Shard the step runs on
    pub shard: String,
    /// Observability reference
    pub subject_ref: Option<SubjectRef>,
    locks: Arc<dyn LockManager>,
    child_block: Option<BlockId>,
    children: Vec<NewStep>,
}

impl StepContext {
    /// Build the context for a claimed step
    #[must_use]
    pub fn new(step: &Step, locks: Arc<dyn LockManager>) -> Self {
        Self {
            step_id: step.id,
            unit_type: step.unit_type.clone(),
            arguments: step.arguments.clone(),
            block_id: step.block_id,
            wave_index: step.wave_index,
            attempt_count: step.attempt_count,
            max_attempts: step.max_attempts,
            shard: step.shard.clone(),
            subject_ref: step.subject_ref.clone(),
            locks,
            child_block: step.child_block_id,
            children: Vec::new(),
        }
    }

    /// Decode the arguments
    ///
    /// # Errors
    ///
    /// Returns `InvalidArguments` if the payload does not match `T`
    pub fn args<T: DeserializeOwned>(&self) -> Result<T, UnitError> {
        Ok(serde_json::from_value(self.arguments.clone())?)
    }

    /// Make this step a parent
    ///
    /// Allocates the child block on first call and returns the same id on
    /// later calls. The block and its children are persisted when `execute`
    /// returns successfully.
    pub fn spawn_child_block(&mut self) -> BlockId {
        *self.child_block.get_or_insert_with(BlockId::new)
    }

    /// Queue a child step in wave `wave_index` of this step's child block
    ///
    /// Allocates the child block if needed.
    pub fn add_child(&mut self, request: NewStep, wave_index: u32) -> BlockId {
        let block = self.spawn_child_block();
        self.children
            .push(request.in_child_block(self.step_id, block, wave_index));
        block
    }

    /// Child block allocated during this run, if any
    #[must_use]
    pub const fn child_block(&self) -> Option<BlockId> {
        self.child_block
    }

    /// Children queued during this run
    #[must_use]
    pub fn children(&self) -> &[NewStep] {
        &self.children
    }

    /// Hand the queued children over for persistence
    pub fn take_children(&mut self) -> Vec<NewStep> {
        std::mem::take(&mut self.children)
    }

    /// Lock manager shared by all steps
    #[must_use]
    pub fn locks(&self) -> &Arc<dyn LockManager> {
        &self.locks
    }

    /// Take a named lock, mapping a timeout to [`UnitError::LockTimeout`]
    ///
    /// # Errors
    ///
    /// Returns `LockTimeout` if the lock is still held after `timeout`
    pub async fn lock(&self, name: &str, timeout: Duration) -> Result<LockGuard, UnitError> {
        crate::lock::lock(&self.locks, name, timeout)
            .await?
            .ok_or_else(|| UnitError::LockTimeout {
                name: name.to_string(),
                timeout,
            })
    }
}

impl std::fmt::Debug for StepContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepContext")
            .field("step_id", &self.step_id)
            .field("unit_type", &self.unit_type)
            .field("block_id", &self.block_id)
            .field("wave_index", &self.wave_index)
            .field("attempt_count", &self.attempt_count)
            .field("child_block", &self.child_block)
            .field("children", &self.children.len())
            .finish()
    }
}

/// Executable logic behind a `unit_type`
///
/// Only `execute` is required. Hooks run in this order on every claim:
/// `should_skip`, `should_defer`, `check_precondition`, `execute`, `verify`,
/// `finalize`. `on_failure` runs once, when the step becomes Failed.
///
/// `finalize` may run more than once if a worker dies between it and the
/// Completed write; implementations must make it idempotent.
#[async_trait]
pub trait Unit: Send + Sync {
    /// Registry key
    fn unit_type(&self) -> &str;

    /// Already satisfied; finish as Skipped without executing
    async fn should_skip(&self, _ctx: &StepContext) -> Result<bool, UnitError> {
        Ok(false)
    }

    /// Wait this long before spending an attempt
    async fn should_defer(&self, _ctx: &StepContext) -> Result<Option<Duration>, UnitError> {
        Ok(None)
    }

    /// Hard gate; false fails the step without retry
    async fn check_precondition(&self, _ctx: &StepContext) -> Result<bool, UnitError> {
        Ok(true)
    }

    /// Main logic
    async fn execute(&self, ctx: &mut StepContext) -> Result<serde_json::Value, UnitError>;

    /// Re-check ground truth after a successful `execute`
    async fn verify(&self, _ctx: &StepContext, _result: &serde_json::Value) -> Result<bool, UnitError> {
        Ok(true)
    }

    /// Last side effects before Completed
    async fn finalize(&self, _ctx: &StepContext, _result: &serde_json::Value) -> Result<(), UnitError> {
        Ok(())
    }

    /// Notification hook for a terminal failure
    async fn on_failure(&self, _ctx: &StepContext, _err: &UnitError) {}

    /// Unit-specific ignorable errors, on top of the configured allow-list
    fn is_ignorable(&self, _err: &UnitError) -> bool {
        false
    }

    /// Join policy for child blocks this unit spawns
    fn join_policy(&self) -> Option<JoinPolicy> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lock::InMemoryLocks;
    use serde::Deserialize;
    use serde_json::json;
    use skein_core::JoinPolicy;

    fn make_ctx(arguments: serde_json::Value) -> StepContext {
        let step = Step::from_request(
            NewStep::new("fetch_klines", arguments),
            BlockId::new(),
            "alpha".to_string(),
            3,
            JoinPolicy::FailFast,
        );
        StepContext::new(&step, Arc::new(InMemoryLocks::new()))
    }

    #[derive(Debug, Deserialize, PartialEq)]
    struct KlineArgs {
        symbol: String,
        interval: String,
    }

    #[test]
    fn test_args_decode() {
        let ctx = make_ctx(json!({"symbol": "ETHUSDT", "interval": "1h"}));
        let args: KlineArgs = ctx.args().unwrap();
        assert_eq!(args.symbol, "ETHUSDT");
        assert_eq!(args.interval, "1h");
    }

    #[test]
    fn test_args_decode_error() {
        let ctx = make_ctx(json!({"symbol": 12}));
        let err = ctx.args::<KlineArgs>().unwrap_err();
        assert!(matches!(err, UnitError::InvalidArguments(_)));
    }

    #[test]
    fn test_spawn_child_block_is_stable() {
        let mut ctx = make_ctx(json!({}));
        assert!(ctx.child_block().is_none());
        let first = ctx.spawn_child_block();
        let second = ctx.spawn_child_block();
        assert_eq!(first, second);
    }

    #[test]
    fn test_add_child_links_parent() {
        let mut ctx = make_ctx(json!({}));
        let block = ctx.add_child(NewStep::new("compute_indicator", json!({"symbol": "BTCUSDT"})), 1);
        let children = ctx.take_children();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].block_id, Some(block));
        assert_eq!(children[0].wave_index, Some(1));
        assert_eq!(children[0].parent_step_id, Some(ctx.step_id));
        assert!(ctx.children().is_empty());
    }

    #[tokio::test]
    async fn test_ctx_lock_timeout() {
        let ctx = make_ctx(json!({}));
        let _held = ctx.lock("positions:BTCUSDT", Duration::from_millis(10)).await.unwrap();
        let err = ctx
            .lock("positions:BTCUSDT", Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, UnitError::LockTimeout { .. }));
    }

    #[test]
    fn test_unit_error_status() {
        assert_eq!(UnitError::external(Some(418), "teapot").status(), Some(418));
        assert_eq!(UnitError::msg("boom").status(), None);
        assert_eq!(UnitError::external(None, "boom").to_string(), "boom");
    }
}
