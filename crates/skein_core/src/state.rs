//! Step lifecycle states.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a step
///
/// `Pending -> Running -> {Completed | Failed | Skipped}`, with
/// `Running -> Pending` as the only way back (defer, retry, waiting on a
/// child block). Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepState {
    /// Waiting to be claimed
    Pending,
    /// Claimed by exactly one worker
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Intentionally not run
    Skipped,
}

impl StepState {
    /// All states, in lifecycle order
    pub const ALL: [StepState; 5] = [
        StepState::Pending,
        StepState::Running,
        StepState::Completed,
        StepState::Failed,
        StepState::Skipped,
    ];

    /// Whether no further transitions can leave this state
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }

    /// Whether the automaton allows `self -> next`
    ///
    /// `Pending -> Failed` is allowed for forced failures and fail-fast joins,
    /// which resolve a step without a worker claim.
    #[must_use]
    pub const fn can_transition_to(self, next: StepState) -> bool {
        match (self, next) {
            (Self::Pending, Self::Running) => true,
            (Self::Pending, Self::Failed) => true,
            (Self::Running, Self::Pending) => true,
            (Self::Running, Self::Completed) => true,
            (Self::Running, Self::Failed) => true,
            (Self::Running, Self::Skipped) => true,
            _ => false,
        }
    }

    /// Lowercase name, as stored
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl std::fmt::Display for StepState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
