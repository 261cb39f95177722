//! Group dispatcher: shard assignment at step creation.
//!
//! Only shards with `can_dispatch = true` receive new steps. Round-robin walks
//! the open shards in name order so every open shard gets work.

use serde::{Deserialize, Serialize};
use skein_core::{CoreError, CoreResult, Shard};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Shard assignment policy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchPolicy {
    /// Cycle through open shards in name order
    #[default]
    RoundRobin,
}

/// Picks a shard for each new step
#[derive(Debug, Default)]
pub struct ShardDispatcher {
    policy: DispatchPolicy,
    cursor: AtomicUsize,
}

impl ShardDispatcher {
    /// Create a dispatcher
    #[must_use]
    pub fn new(policy: DispatchPolicy) -> Self {
        Self {
            policy,
            cursor: AtomicUsize::new(0),
        }
    }

    /// Assignment policy
    #[must_use]
    pub const fn policy(&self) -> DispatchPolicy {
        self.policy
    }

    /// Choose a shard among `shards`
    ///
    /// # Errors
    ///
    /// Returns `NoDispatchableShard` when every shard is closed
    pub fn assign(&self, shards: &[Shard]) -> CoreResult<String> {
        let mut open: Vec<&str> = shards
            .iter()
            .filter(|shard| shard.can_dispatch)
            .map(|shard| shard.name.as_str())
            .collect();
        if open.is_empty() {
            return Err(CoreError::NoDispatchableShard);
        }
        open.sort_unstable();

        match self.policy {
            DispatchPolicy::RoundRobin => {
                let slot = self.cursor.fetch_add(1, Ordering::Relaxed) % open.len();
                Ok(open[slot].to_string())
            }
        }
    }
}
