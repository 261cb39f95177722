//! skein core types
//!
//! Pure records and identifiers shared by every skein crate. Nothing in here
//! performs I/O; the persistence and execution layers live in `skein_runtime`.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod id;
pub mod shard;
pub mod state;
pub mod step;

// Re-exports
pub use error::{CoreError, CoreResult};
pub use id::{BlockId, ClaimToken, CycleId, StepId, WorkerId};
pub use shard::{Heartbeat, Shard};
pub use state::StepState;
pub use step::{FailureDetail, JoinPolicy, NewStep, Step, SubjectRef};
