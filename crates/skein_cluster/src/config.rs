//! Worker configuration.

use crate::worker::WorkerError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Worker configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Shard this worker polls
    pub shard: String,
    /// Pause after a cycle that did some work, in milliseconds
    pub poll_interval_ms: u64,
    /// Upper bound of the idle pause, in milliseconds
    pub idle_backoff_ms: u64,
    /// Steps run per poll cycle before the sweep and heartbeat
    pub max_steps_per_cycle: usize,
}

impl WorkerConfig {
    /// Config for a worker on `shard`
    #[must_use]
    pub fn new(shard: impl Into<String>) -> Self {
        Self {
            shard: shard.into(),
            ..Self::default()
        }
    }

    /// Set the shard
    #[must_use]
    pub fn with_shard(mut self, shard: impl Into<String>) -> Self {
        self.shard = shard.into();
        self
    }

    /// Set the poll interval
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval_ms = duration_ms(interval);
        self
    }

    /// Set the idle backoff cap
    #[must_use]
    pub fn with_idle_backoff(mut self, cap: Duration) -> Self {
        self.idle_backoff_ms = duration_ms(cap);
        self
    }

    /// Set the per-cycle step budget
    #[must_use]
    pub fn with_max_steps_per_cycle(mut self, max: usize) -> Self {
        self.max_steps_per_cycle = max;
        self
    }

    /// Poll interval
    #[must_use]
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Idle backoff cap
    #[must_use]
    pub const fn idle_backoff(&self) -> Duration {
        Duration::from_millis(self.idle_backoff_ms)
    }

    /// Check the configuration
    ///
    /// # Errors
    ///
    /// Returns `InvalidConfig` for an empty shard name, a zero step budget,
    /// or an idle cap below the poll interval
    pub fn validate(&self) -> Result<(), WorkerError> {
        if self.shard.is_empty() {
            return Err(WorkerError::InvalidConfig("shard must not be empty".to_string()));
        }
        if self.max_steps_per_cycle == 0 {
            return Err(WorkerError::InvalidConfig(
                "max_steps_per_cycle must be at least 1".to_string(),
            ));
        }
        if self.idle_backoff_ms < self.poll_interval_ms {
            return Err(WorkerError::InvalidConfig(format!(
                "idle_backoff_ms {} is below poll_interval_ms {}",
                self.idle_backoff_ms, self.poll_interval_ms
            )));
        }
        Ok(())
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            shard: "default".to_string(),
            poll_interval_ms: 100,
            idle_backoff_ms: 2_000,
            max_steps_per_cycle: 32,
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
