//! skein runtime
//!
//! Step orchestration: wave barriers and child-block joins, shard dispatch
//! with a circuit breaker, the step lifecycle and its unit hooks, retry
//! backoff with error classification, and named advisory locks.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod lifecycle;
pub mod lock;
pub mod monitor;
pub mod registry;
pub mod scheduler;
pub mod store;
pub mod throttle;
pub mod unit;

pub use config::EngineConfig;
pub use dispatcher::{DispatchPolicy, ShardDispatcher};
pub use engine::Engine;
pub use lifecycle::{LifecycleRun, StepOutcome, StepRunner};
pub use lock::{InMemoryLocks, LockGuard, LockManager, with_lock};
pub use monitor::{ExecutionMonitor, Metrics, Telemetry};
pub use registry::UnitRegistry;
pub use scheduler::{JoinDecision, WaveBarrier, evaluate_join, is_eligible, resolve_parent};
pub use store::{MemoryStore, StepStore};
pub use throttle::{
    BackoffPolicy, ErrorClass, ErrorClassifier, IgnorableSignature, RateLimitState, ThrottlePolicy,
};
pub use unit::{StepContext, Unit, UnitError};
