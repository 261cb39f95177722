//! Block and join scheduling rules.
//!
//! Two pure rules drive everything:
//! - the wave barrier: a Pending step at wave `i` may be claimed only once
//!   every step of its block with a smaller wave is terminal;
//! - the join: a parent completes once every step of its child block is
//!   terminal, failing instead when the join policy says so.

use skein_core::{BlockId, CoreError, CoreResult, JoinPolicy, Step, StepId, StepState};

/// Barrier state of one block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaveBarrier {
    /// Smallest wave that still has a non-terminal step
    lowest_open: Option<u32>,
}

impl WaveBarrier {
    /// Compute the barrier from the steps of one block
    pub fn from_steps<'a, I>(steps: I) -> Self
    where
        I: IntoIterator<Item = &'a Step>,
    {
        let lowest_open = steps
            .into_iter()
            .filter(|step| !step.is_terminal())
            .map(|step| step.wave_index)
            .min();
        Self { lowest_open }
    }

    /// Whether steps at `wave_index` may leave Pending
    #[must_use]
    pub fn admits(&self, wave_index: u32) -> bool {
        self.lowest_open.map_or(true, |lowest| wave_index <= lowest)
    }

    /// Smallest wave with unfinished work
    #[must_use]
    pub const fn lowest_open(&self) -> Option<u32> {
        self.lowest_open
    }

    /// Whether every step of the block is terminal
    #[must_use]
    pub const fn is_drained(&self) -> bool {
        self.lowest_open.is_none()
    }
}

/// Full eligibility predicate for claiming `step`
///
/// `block_steps` are the steps sharing `step.block_id` (may include `step`).
#[must_use]
pub fn is_eligible(
    step: &Step,
    block_steps: &[Step],
    shard_can_dispatch: bool,
    now: chrono::DateTime<chrono::Utc>,
) -> bool {
    shard_can_dispatch
        && step.is_claimable(now)
        && WaveBarrier::from_steps(block_steps.iter().filter(|s| s.block_id == step.block_id))
            .admits(step.wave_index)
}

/// Outcome of evaluating a parent's child block
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinDecision {
    /// Children still running or pending
    Waiting {
        /// Non-terminal children
        open: usize,
    },
    /// Parent may complete
    Complete {
        /// Children that failed but were tolerated
        tolerated_failures: usize,
    },
    /// Parent must fail
    Fail {
        /// Failed children
        failed: Vec<StepId>,
        /// Size of the child block
        total: usize,
    },
}

/// Evaluate a child block against its parent's join policy
#[must_use]
pub fn evaluate_join(children: &[Step], policy: JoinPolicy) -> JoinDecision {
    let open = children.iter().filter(|child| !child.is_terminal()).count();
    if open > 0 {
        return JoinDecision::Waiting { open };
    }

    let failed: Vec<StepId> = children
        .iter()
        .filter(|child| child.state == StepState::Failed)
        .map(|child| child.id)
        .collect();

    match policy {
        JoinPolicy::FailFast if !failed.is_empty() => JoinDecision::Fail {
            failed,
            total: children.len(),
        },
        _ => JoinDecision::Complete {
            tolerated_failures: failed.len(),
        },
    }
}

/// Check the parent link of a block
///
/// `indexed_parent` is the step the store has registered as owning `block`.
/// Returns the parent id for a child block, `None` for a root block, and an
/// `OrphanedChildBlock` error when the children name a parent that does not
/// own the block.
///
/// # Errors
///
/// Returns `OrphanedChildBlock` on any inconsistency
pub fn resolve_parent(
    block: BlockId,
    children: &[Step],
    indexed_parent: Option<&Step>,
) -> CoreResult<Option<StepId>> {
    let declared = children.iter().find_map(|child| child.parent_step_id);

    match indexed_parent {
        None => match declared {
            None => Ok(None),
            Some(parent) => Err(CoreError::OrphanedChildBlock {
                block,
                reason: format!("declared parent {} does not own the block", parent),
            }),
        },
        Some(parent) => {
            if parent.child_block_id != Some(block) {
                return Err(CoreError::OrphanedChildBlock {
                    block,
                    reason: format!("indexed parent {} points elsewhere", parent.id),
                });
            }
            if let Some(stray) = children
                .iter()
                .filter_map(|child| child.parent_step_id)
                .find(|declared| *declared != parent.id)
            {
                return Err(CoreError::OrphanedChildBlock {
                    block,
                    reason: format!("child declares parent {} but {} owns the block", stray, parent.id),
                });
            }
            Ok(Some(parent.id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use skein_core::NewStep;

    fn make_step(block: BlockId, wave: u32, state: StepState) -> Step {
        let mut step = Step::from_request(
            NewStep::new("compute_indicator", json!({})).in_block(block, wave),
            block,
            "alpha".to_string(),
            3,
            JoinPolicy::FailFast,
        );
        step.state = state;
        step
    }

    #[test]
    fn test_barrier_empty_block() {
        let barrier = WaveBarrier::from_steps(std::iter::empty());
        assert!(barrier.is_drained());
        assert!(barrier.admits(0));
        assert!(barrier.admits(10));
    }

    #[test]
    fn test_barrier_holds_later_waves() {
        let block = BlockId::new();
        let steps = vec![
            make_step(block, 1, StepState::Completed),
            make_step(block, 1, StepState::Running),
            make_step(block, 1, StepState::Pending),
            make_step(block, 2, StepState::Pending),
        ];
        let barrier = WaveBarrier::from_steps(&steps);
        assert_eq!(barrier.lowest_open(), Some(1));
        assert!(barrier.admits(1));
        assert!(!barrier.admits(2));
    }

    #[test]
    fn test_barrier_non_contiguous_waves() {
        let block = BlockId::new();
        let steps = vec![
            make_step(block, 0, StepState::Failed),
            make_step(block, 5, StepState::Skipped),
            make_step(block, 40, StepState::Pending),
        ];
        assert!(WaveBarrier::from_steps(&steps).admits(40));
    }

    #[test]
    fn test_is_eligible() {
        let block = BlockId::new();
        let first = make_step(block, 0, StepState::Running);
        let second = make_step(block, 1, StepState::Pending);
        let steps = vec![first.clone(), second.clone()];
        let now = Utc::now();

        assert!(!is_eligible(&second, &steps, true, now));

        let mut done = first;
        done.state = StepState::Completed;
        let steps = vec![done, second.clone()];
        assert!(is_eligible(&second, &steps, true, now));
        assert!(!is_eligible(&second, &steps, false, now));
    }

    #[test]
    fn test_is_eligible_ignores_other_blocks() {
        let block = BlockId::new();
        let step = make_step(block, 3, StepState::Pending);
        let other = make_step(BlockId::new(), 0, StepState::Running);
        assert!(is_eligible(&step, &[other, step.clone()], true, Utc::now()));
    }

    #[test]
    fn test_evaluate_join_waiting() {
        let block = BlockId::new();
        let children = vec![
            make_step(block, 0, StepState::Completed),
            make_step(block, 0, StepState::Running),
        ];
        assert_eq!(
            evaluate_join(&children, JoinPolicy::FailFast),
            JoinDecision::Waiting { open: 1 }
        );
    }

    #[test]
    fn test_evaluate_join_policies() {
        let block = BlockId::new();
        let children = vec![
            make_step(block, 0, StepState::Completed),
            make_step(block, 0, StepState::Failed),
            make_step(block, 0, StepState::Skipped),
        ];

        match evaluate_join(&children, JoinPolicy::FailFast) {
            JoinDecision::Fail { failed, total } => {
                assert_eq!(failed, vec![children[1].id]);
                assert_eq!(total, 3);
            }
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(
            evaluate_join(&children, JoinPolicy::IgnoreFailures),
            JoinDecision::Complete { tolerated_failures: 1 }
        );
    }

    #[test]
    fn test_evaluate_join_empty_block_completes() {
        assert_eq!(
            evaluate_join(&[], JoinPolicy::FailFast),
            JoinDecision::Complete { tolerated_failures: 0 }
        );
    }

    #[test]
    fn test_resolve_parent_root_block() {
        let block = BlockId::new();
        let children = vec![make_step(block, 0, StepState::Completed)];
        assert_eq!(resolve_parent(block, &children, None).unwrap(), None);
    }

    #[test]
    fn test_resolve_parent_linked() {
        let block = BlockId::new();
        let mut parent = make_step(BlockId::new(), 0, StepState::Pending);
        parent.child_block_id = Some(block);
        let mut child = make_step(block, 0, StepState::Completed);
        child.parent_step_id = Some(parent.id);

        assert_eq!(resolve_parent(block, &[child], Some(&parent)).unwrap(), Some(parent.id));
    }

    #[test]
    fn test_resolve_parent_orphaned() {
        let block = BlockId::new();
        let mut child = make_step(block, 0, StepState::Completed);
        child.parent_step_id = Some(StepId::new());

        let err = resolve_parent(block, &[child.clone()], None).unwrap_err();
        assert!(matches!(err, CoreError::OrphanedChildBlock { .. }));

        let mut parent = make_step(BlockId::new(), 0, StepState::Pending);
        parent.child_block_id = Some(block);
        let err = resolve_parent(block, &[child], Some(&parent)).unwrap_err();
        assert!(matches!(err, CoreError::OrphanedChildBlock { .. }));
    }
}
