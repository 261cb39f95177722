//! Step lifecycle: drives a claimed step through its unit's hooks.
//!
//! The runner never writes to the store. It returns the step as it should be
//! committed together with the outcome, and the engine commits it under the
//! claim token. `on_failure` is left to the engine too, so that it only fires
//! for a Failed transition that was actually written.

use crate::lock::LockManager;
use crate::scheduler::{JoinDecision, evaluate_join};
use crate::throttle::{ErrorClass, RateLimitState, ThrottlePolicy};
use crate::unit::{StepContext, Unit, UnitError};
use chrono::{DateTime, Utc};
use skein_core::{BlockId, FailureDetail, NewStep, Step, StepState};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// What a run did to the step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Finished successfully
    Completed,
    /// `should_skip` said there was nothing to do
    Skipped,
    /// Back to Pending without spending an attempt
    Deferred {
        /// Wait before the next claim
        delay: Duration,
    },
    /// Unit work done; the step now waits on its child block
    AwaitingChildren {
        /// The child block
        block: BlockId,
        /// Children created by this run
        spawned: usize,
    },
    /// Attempt spent, back to Pending with backoff
    Retrying {
        /// Error of the failed attempt
        error: UnitError,
        /// How the error was classified
        class: ErrorClass,
        /// Wait before the next claim
        delay: Duration,
    },
    /// Terminal failure
    Failed {
        /// Error that ended the step
        error: UnitError,
    },
    /// Join attempted while children were still open
    Waiting {
        /// Non-terminal children
        open: usize,
    },
    /// The claim was lost before the outcome could be written
    ClaimLost,
}

impl StepOutcome {
    /// Whether the outcome leaves the step in a terminal state
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Skipped | Self::Failed { .. })
    }

    /// Short label for logs
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Completed => "completed",
            Self::Skipped => "skipped",
            Self::Deferred { .. } => "deferred",
            Self::AwaitingChildren { .. } => "awaiting_children",
            Self::Retrying { .. } => "retrying",
            Self::Failed { .. } => "failed",
            Self::Waiting { .. } => "waiting",
            Self::ClaimLost => "claim_lost",
        }
    }
}

/// Result of driving one claimed step
#[derive(Debug)]
pub struct LifecycleRun {
    /// Step as it should be committed
    pub step: Step,
    /// What happened
    pub outcome: StepOutcome,
    /// Children queued by `execute`, not yet materialized
    pub spawned: Vec<NewStep>,
    /// Context the hooks ran with
    pub ctx: StepContext,
}

/// Drives hooks in order and decides the next state
#[derive(Clone)]
pub struct StepRunner {
    throttle: ThrottlePolicy,
    locks: Arc<dyn LockManager>,
}

impl StepRunner {
    /// Create a runner
    #[must_use]
    pub fn new(throttle: ThrottlePolicy, locks: Arc<dyn LockManager>) -> Self {
        Self { throttle, locks }
    }

    /// Throttle policy in use
    #[must_use]
    pub fn throttle(&self) -> &ThrottlePolicy {
        &self.throttle
    }

    /// Lock manager handed to every context
    #[must_use]
    pub fn locks(&self) -> &Arc<dyn LockManager> {
        &self.locks
    }

    /// Run a claimed step's hooks
    ///
    /// `skip -> defer -> precondition -> execute -> verify -> finalize`. A
    /// step whose `execute` spawned children stops before `finalize`; that
    /// runs when the child block is joined.
    pub async fn run(&self, unit: &dyn Unit, step: Step) -> LifecycleRun {
        let mut ctx = StepContext::new(&step, Arc::clone(&self.locks));
        debug!(step_id = %step.id, unit_type = %step.unit_type, attempt = step.attempt_count, "running step");

        match unit.should_skip(&ctx).await {
            Ok(true) => return finish(step, ctx, StepState::Skipped, StepOutcome::Skipped),
            Ok(false) => {}
            Err(err) => return self.fail(unit, step, ctx, err),
        }

        match unit.should_defer(&ctx).await {
            Ok(Some(wait)) => return self.defer(step, ctx, wait),
            Ok(None) => {}
            Err(err) => return self.fail(unit, step, ctx, err),
        }

        match unit.check_precondition(&ctx).await {
            Ok(true) => {}
            Ok(false) => {
                let err = UnitError::PreconditionFailed(step.unit_type.clone());
                return terminal_failure(step, ctx, err);
            }
            Err(err) => return self.fail(unit, step, ctx, err),
        }

        let result = match unit.execute(&mut ctx).await {
            Ok(result) => result,
            Err(err) => return self.fail(unit, step, ctx, err),
        };

        match unit.verify(&ctx, &result).await {
            Ok(true) => {}
            Ok(false) => {
                let err = UnitError::VerificationFailed(step.unit_type.clone());
                return self.fail(unit, step, ctx, err);
            }
            Err(err) => return self.fail(unit, step, ctx, err),
        }

        if let Some(block) = ctx.child_block() {
            if step.child_block_id.is_none() {
                return await_children(step, ctx, block, result);
            }
        }

        match unit.finalize(&ctx, &result).await {
            Ok(()) => {
                let mut step = step;
                step.result = Some(result);
                finish(step, ctx, StepState::Completed, StepOutcome::Completed)
            }
            Err(err) => self.fail(unit, step, ctx, err),
        }
    }

    /// Resolve a claimed parent against its child block
    ///
    /// Only `finalize` runs; the unit's own work was done before the
    /// children were spawned.
    pub async fn join(&self, unit: &dyn Unit, parent: Step, children: &[Step]) -> LifecycleRun {
        let ctx = StepContext::new(&parent, Arc::clone(&self.locks));
        let block = parent.child_block_id.unwrap_or(parent.block_id);

        match evaluate_join(children, parent.join_policy) {
            JoinDecision::Waiting { open } => {
                let mut parent = parent;
                parent.state = StepState::Pending;
                LifecycleRun {
                    step: parent,
                    outcome: StepOutcome::Waiting { open },
                    spawned: Vec::new(),
                    ctx,
                }
            }
            JoinDecision::Fail { failed, total } => {
                let err = UnitError::ChildrenFailed {
                    block,
                    failed: failed.len(),
                    total,
                };
                terminal_failure(parent, ctx, err)
            }
            JoinDecision::Complete { tolerated_failures } => {
                if tolerated_failures > 0 {
                    debug!(step_id = %parent.id, block_id = %block, tolerated_failures, "joining past failed children");
                }
                let result = parent.result.clone().unwrap_or(serde_json::Value::Null);
                match unit.finalize(&ctx, &result).await {
                    Ok(()) => {
                        let mut parent = parent;
                        parent.awaiting_children = false;
                        finish(parent, ctx, StepState::Completed, StepOutcome::Completed)
                    }
                    Err(err) => self.fail(unit, parent, ctx, err),
                }
            }
        }
    }

    /// Fail a step whose unit cannot be driven at all
    #[must_use]
    pub fn reject(&self, step: Step, err: UnitError) -> LifecycleRun {
        let ctx = StepContext::new(&step, Arc::clone(&self.locks));
        terminal_failure(step, ctx, err)
    }

    /// Failure path for an attempt
    ///
    /// Consumes an attempt. Ignorable and transient errors retry silently;
    /// fatal ones retry until the budget is exhausted, then fail the step.
    #[must_use]
    pub fn fail(&self, unit: &dyn Unit, mut step: Step, ctx: StepContext, err: UnitError) -> LifecycleRun {
        let class = self.throttle.classify(&err, unit.is_ignorable(&err));
        step.attempt_count += 1;

        if step.attempts_exhausted() {
            warn!(step_id = %step.id, attempt = step.attempt_count, error = %err, "attempts exhausted");
            return terminal_failure(step, ctx, err);
        }
        step.failure_detail = Some(FailureDetail::new(err.message(), err.status(), step.attempt_count));

        let delay = self.throttle.backoff_for(step.attempt_count, &RateLimitState::none());
        match class {
            ErrorClass::Fatal => {
                warn!(step_id = %step.id, attempt = step.attempt_count, ?delay, error = %err, "attempt failed, retrying");
            }
            ErrorClass::Ignorable | ErrorClass::Transient => {
                debug!(step_id = %step.id, attempt = step.attempt_count, ?delay, ?class, error = %err, "retrying quietly");
            }
        }
        step.state = StepState::Pending;
        step.not_before = Some(after(delay));
        LifecycleRun {
            step,
            outcome: StepOutcome::Retrying {
                error: err,
                class,
                delay,
            },
            spawned: Vec::new(),
            ctx,
        }
    }

    fn defer(&self, mut step: Step, ctx: StepContext, wait: Duration) -> LifecycleRun {
        let delay = self
            .throttle
            .backoff_for(step.attempt_count, &RateLimitState::retry_after(wait));
        debug!(step_id = %step.id, ?delay, "deferring step");
        step.state = StepState::Pending;
        step.not_before = Some(after(delay));
        LifecycleRun {
            step,
            outcome: StepOutcome::Deferred { delay },
            spawned: Vec::new(),
            ctx,
        }
    }
}

impl std::fmt::Debug for StepRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StepRunner")
            .field("throttle", &self.throttle)
            .finish_non_exhaustive()
    }
}

fn finish(mut step: Step, ctx: StepContext, state: StepState, outcome: StepOutcome) -> LifecycleRun {
    step.state = state;
    step.not_before = None;
    LifecycleRun {
        step,
        outcome,
        spawned: Vec::new(),
        ctx,
    }
}

fn terminal_failure(mut step: Step, ctx: StepContext, err: UnitError) -> LifecycleRun {
    step.failure_detail = Some(FailureDetail::new(err.message(), err.status(), step.attempt_count));
    step.state = StepState::Failed;
    LifecycleRun {
        step,
        outcome: StepOutcome::Failed { error: err },
        spawned: Vec::new(),
        ctx,
    }
}

fn await_children(mut step: Step, mut ctx: StepContext, block: BlockId, result: serde_json::Value) -> LifecycleRun {
    let spawned = ctx.take_children();
    step.child_block_id = Some(block);
    step.awaiting_children = true;
    step.result = Some(result);
    step.state = StepState::Pending;
    step.not_before = None;
    debug!(step_id = %step.id, block_id = %block, children = spawned.len(), "step awaiting child block");
    LifecycleRun {
        step,
        outcome: StepOutcome::AwaitingChildren {
            block,
            spawned: spawned.len(),
        },
        spawned,
        ctx,
    }
}

fn after(delay: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(delay)
        .ok()
        .and_then(|delay| now.checked_add_signed(delay))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}
