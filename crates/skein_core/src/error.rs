//! Core error types for skein.

use crate::{BlockId, StepId, StepState};

/// Core result type
pub type CoreResult<T> = Result<T, CoreError>;

/// Core error type
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoreError {
    /// Invalid encoding of a stored payload
    #[error("Invalid encoding: {reason}")]
    InvalidEncoding { reason: String },

    /// Validation error
    #[error("Validation failed for {field}: {reason}")]
    Validation { field: String, reason: String },

    /// Not found
    #[error("{kind} not found: {id}")]
    NotFound { kind: String, id: String },

    /// Already exists
    #[error("{kind} already exists: {id}")]
    AlreadyExists { kind: String, id: String },

    /// A state change that the step automaton does not allow
    #[error("Invalid transition for {step}: {from:?} -> {to:?}")]
    InvalidTransition {
        step: StepId,
        from: StepState,
        to: StepState,
    },

    /// A child block whose declared parent does not own it
    #[error("Orphaned child block {block}: {reason}")]
    OrphanedChildBlock { block: BlockId, reason: String },

    /// No shard currently accepts new steps
    #[error("No dispatchable shard available")]
    NoDispatchableShard,

    /// Persistence layer failure
    #[error("Storage error: {message}")]
    Storage {
        /// Error message
        message: String,
    },

    /// Internal error (for unexpected errors)
    #[error("Internal error: {message}")]
    Internal {
        /// Error message
        message: String,
    },
}

impl CoreError {
    /// Shorthand for a missing step
    #[must_use]
    pub fn step_not_found(id: StepId) -> Self {
        Self::NotFound {
            kind: "step".to_string(),
            id: id.to_string(),
        }
    }

    /// Shorthand for a missing shard
    #[must_use]
    pub fn shard_not_found(name: &str) -> Self {
        Self::NotFound {
            kind: "shard".to_string(),
            id: name.to_string(),
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::InvalidEncoding {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CoreError::NotFound {
            kind: "step".to_string(),
            id: "step_123".to_string(),
        };
        assert_eq!(format!("{}", err), "step not found: step_123");

        assert_eq!(
            CoreError::NoDispatchableShard.to_string(),
            "No dispatchable shard available"
        );
    }

    #[test]
    fn test_invalid_transition_display() {
        let step = StepId::new();
        let err = CoreError::InvalidTransition {
            step,
            from: StepState::Completed,
            to: StepState::Running,
        };
        let s = err.to_string();
        assert!(s.contains(&step.to_string()));
        assert!(s.contains("Completed"));
    }

    #[test]
    fn test_shard_not_found() {
        let err = CoreError::shard_not_found("alpha");
        assert_eq!(err.to_string(), "shard not found: alpha");
    }

    #[test]
    fn test_from_serde_json() {
        let err: CoreError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(matches!(err, CoreError::InvalidEncoding { .. }));
    }
}
