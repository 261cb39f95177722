//! Shard records: named worker partitions with a circuit breaker.

use crate::CycleId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One named worker partition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    /// Unique shard name
    pub name: String,
    /// Circuit breaker: when false, no new claims for this shard
    pub can_dispatch: bool,
    /// Token of the poll cycle currently in progress
    pub in_flight_cycle_id: Option<CycleId>,
    /// When the last poll cycle finished
    pub last_cycle_completed_at: Option<DateTime<Utc>>,
    /// When the in-flight cycle started
    pub cycle_started_at: Option<DateTime<Utc>>,
}

impl Shard {
    /// Create an open shard
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            can_dispatch: true,
            in_flight_cycle_id: None,
            last_cycle_completed_at: None,
            cycle_started_at: None,
        }
    }

    /// Set the circuit breaker
    #[must_use]
    pub fn with_dispatch(mut self, can_dispatch: bool) -> Self {
        self.can_dispatch = can_dispatch;
        self
    }

    /// Liveness view of this shard
    #[must_use]
    pub fn heartbeat(&self) -> Heartbeat {
        Heartbeat {
            shard: self.name.clone(),
            in_flight_cycle_id: self.in_flight_cycle_id,
            cycle_started_at: self.cycle_started_at,
            last_cycle_completed_at: self.last_cycle_completed_at,
        }
    }
}

/// Heartbeat fields read by an external liveness monitor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    /// Shard name
    pub shard: String,
    /// Cycle in progress, if any
    pub in_flight_cycle_id: Option<CycleId>,
    /// Start of the cycle in progress
    pub cycle_started_at: Option<DateTime<Utc>>,
    /// End of the last finished cycle
    pub last_cycle_completed_at: Option<DateTime<Utc>>,
}

impl Heartbeat {
    /// Whether a cycle has been in flight for longer than `threshold`
    #[must_use]
    pub fn is_stalled(&self, now: DateTime<Utc>, threshold: chrono::Duration) -> bool {
        match (self.in_flight_cycle_id, self.cycle_started_at) {
            (Some(_), Some(started)) => now - started > threshold,
            _ => false,
        }
    }
}
