//! skein cluster
//!
//! Polling workers bound to one shard each, and a pool that runs several
//! of them per shard with cooperative shutdown.

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod pool;
pub mod worker;

pub use config::WorkerConfig;
pub use pool::WorkerPool;
pub use worker::{CycleReport, Worker, WorkerError, WorkerState, WorkerStats};
