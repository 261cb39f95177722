//! Engine configuration.

use crate::dispatcher::DispatchPolicy;
use crate::throttle::{BackoffPolicy, IgnorableSignature, ThrottlePolicy};
use serde::{Deserialize, Serialize};
use skein_core::{CoreError, CoreResult, JoinPolicy};
use std::time::Duration;

/// Engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Attempt budget for steps created without one
    pub default_max_attempts: u32,
    /// Retry backoff
    pub backoff: BackoffPolicy,
    /// Ignorable-error allow-list
    pub ignorable: Vec<IgnorableSignature>,
    /// Claims older than this are considered abandoned, in milliseconds
    pub lease_ms: u64,
    /// Shard assignment policy
    pub dispatch: DispatchPolicy,
    /// Join policy for parents whose unit does not choose one
    pub default_join_policy: JoinPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_max_attempts: 3,
            backoff: BackoffPolicy::default(),
            ignorable: Vec::new(),
            lease_ms: 300_000,
            dispatch: DispatchPolicy::default(),
            default_join_policy: JoinPolicy::FailFast,
        }
    }
}

impl EngineConfig {
    /// Create the default configuration
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default attempt budget
    #[must_use]
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.default_max_attempts = max_attempts;
        self
    }

    /// Set the backoff policy
    #[must_use]
    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Add an ignorable-error signature
    #[must_use]
    pub fn with_ignorable(mut self, signature: IgnorableSignature) -> Self {
        self.ignorable.push(signature);
        self
    }

    /// Set the claim lease
    #[must_use]
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease_ms = u64::try_from(lease.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the default join policy
    #[must_use]
    pub fn with_join_policy(mut self, policy: JoinPolicy) -> Self {
        self.default_join_policy = policy;
        self
    }

    /// Claim lease
    #[must_use]
    pub const fn lease(&self) -> Duration {
        Duration::from_millis(self.lease_ms)
    }

    /// Check values and compile the throttle policy
    ///
    /// # Errors
    ///
    /// Returns error on a zero attempt budget or a bad allow-list pattern
    pub fn throttle(&self) -> CoreResult<ThrottlePolicy> {
        if self.default_max_attempts == 0 {
            return Err(CoreError::Validation {
                field: "default_max_attempts".to_string(),
                reason: "must be at least 1".to_string(),
            });
        }
        ThrottlePolicy::from_config(self.backoff, &self.ignorable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.default_max_attempts, 3);
        assert_eq!(config.lease(), Duration::from_secs(300));
        assert_eq!(config.default_join_policy, JoinPolicy::FailFast);
        assert!(config.throttle().is_ok());
    }

    #[test]
    fn test_builders() {
        let config = EngineConfig::new()
            .with_max_attempts(5)
            .with_backoff(BackoffPolicy::None)
            .with_ignorable(IgnorableSignature::status(429))
            .with_lease(Duration::from_secs(30))
            .with_join_policy(JoinPolicy::IgnoreFailures);

        assert_eq!(config.default_max_attempts, 5);
        assert_eq!(config.lease_ms, 30_000);
        assert_eq!(config.ignorable.len(), 1);
        assert_eq!(config.throttle().unwrap().classifier().len(), 1);
    }

    #[test]
    fn test_validation() {
        let config = EngineConfig::new().with_max_attempts(0);
        assert!(matches!(config.throttle(), Err(CoreError::Validation { .. })));

        let config = EngineConfig::new().with_ignorable(IgnorableSignature::matches("(-1021"));
        assert!(matches!(config.throttle(), Err(CoreError::Validation { .. })));
    }

    #[test]
    fn test_partial_json() {
        let config: EngineConfig = serde_json::from_str(
            r#"{"default_max_attempts": 7, "backoff": {"kind": "fixed", "delay_ms": 500}}"#,
        )
        .unwrap();
        assert_eq!(config.default_max_attempts, 7);
        assert_eq!(config.backoff, BackoffPolicy::Fixed { delay_ms: 500 });
        assert_eq!(config.lease_ms, 300_000);
    }
}
