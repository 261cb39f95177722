//! Throttle policy: retry backoff and error classification.
//!
//! Backoff is computed from a step's attempt count and whatever rate-limit
//! state the caller observed externally. Classification decides whether an
//! execution error is retried silently or goes down the failure path; it only
//! looks at the error's observable signature, never at mutable state.

use crate::unit::UnitError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use skein_core::{CoreError, CoreResult};
use std::time::Duration;

/// Backoff strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackoffPolicy {
    /// Retry immediately
    None,
    /// Same delay for every attempt
    Fixed {
        /// Delay in milliseconds
        delay_ms: u64,
    },
    /// `base * 2^(attempt - 1)`, capped
    Exponential {
        /// First delay in milliseconds
        base_ms: u64,
        /// Upper bound in milliseconds
        cap_ms: u64,
    },
}

impl BackoffPolicy {
    /// Fixed delay
    #[must_use]
    pub fn fixed(delay: Duration) -> Self {
        Self::Fixed {
            delay_ms: duration_ms(delay),
        }
    }

    /// Exponential delay with a cap
    #[must_use]
    pub fn exponential(base: Duration, cap: Duration) -> Self {
        Self::Exponential {
            base_ms: duration_ms(base),
            cap_ms: duration_ms(cap),
        }
    }

    /// Delay before the next try, given the failed attempts so far
    ///
    /// No failed attempt means no delay.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        match *self {
            Self::None => Duration::ZERO,
            Self::Fixed { delay_ms } => Duration::from_millis(delay_ms),
            Self::Exponential { base_ms, cap_ms } => {
                let exponent = attempt - 1;
                let factor = 2u64.checked_pow(exponent).unwrap_or(u64::MAX);
                Duration::from_millis(base_ms.saturating_mul(factor).min(cap_ms))
            }
        }
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::Exponential {
            base_ms: 1_000,
            cap_ms: 300_000,
        }
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Rate-limit state observed outside the step, e.g. an exchange's
/// `Retry-After` header or remaining request weight
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitState {
    /// Minimum wait demanded by the external system
    pub retry_after: Option<Duration>,
}

impl RateLimitState {
    /// No external constraint
    #[must_use]
    pub const fn none() -> Self {
        Self { retry_after: None }
    }

    /// Wait at least `delay`
    #[must_use]
    pub const fn retry_after(delay: Duration) -> Self {
        Self {
            retry_after: Some(delay),
        }
    }
}

/// One entry of the ignorable-error allow-list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "match", rename_all = "snake_case")]
pub enum IgnorableSignature {
    /// Message contains this text
    MessageContains {
        /// Substring to look for
        text: String,
    },
    /// Message matches this regular expression
    MessageMatches {
        /// Regex source
        pattern: String,
    },
    /// External status code equals this value
    Status {
        /// Status code
        code: u16,
    },
}

impl IgnorableSignature {
    /// Match on a message substring
    #[must_use]
    pub fn contains(text: impl Into<String>) -> Self {
        Self::MessageContains { text: text.into() }
    }

    /// Match on a message regex
    #[must_use]
    pub fn matches(pattern: impl Into<String>) -> Self {
        Self::MessageMatches {
            pattern: pattern.into(),
        }
    }

    /// Match on a status code
    #[must_use]
    pub const fn status(code: u16) -> Self {
        Self::Status { code }
    }
}

/// How an execution error is handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Retried silently: attempt consumed, no notification
    Ignorable,
    /// Resource contention (lock timeout): retried like an ignorable error
    Transient,
    /// Retried until exhausted, then terminal
    Fatal,
}

/// Compiled allow-list
#[derive(Debug, Clone, Default)]
pub struct ErrorClassifier {
    substrings: Vec<String>,
    patterns: Vec<Regex>,
    statuses: Vec<u16>,
}

impl ErrorClassifier {
    /// Compile an allow-list
    ///
    /// # Errors
    ///
    /// Returns error if a regex pattern does not compile
    pub fn new(signatures: &[IgnorableSignature]) -> CoreResult<Self> {
        let mut classifier = Self::default();
        for signature in signatures {
            match signature {
                IgnorableSignature::MessageContains { text } => {
                    classifier.substrings.push(text.clone());
                }
                IgnorableSignature::MessageMatches { pattern } => {
                    let regex = Regex::new(pattern).map_err(|err| CoreError::Validation {
                        field: "ignorable".to_string(),
                        reason: format!("bad pattern `{}`: {}", pattern, err),
                    })?;
                    classifier.patterns.push(regex);
                }
                IgnorableSignature::Status { code } => classifier.statuses.push(*code),
            }
        }
        Ok(classifier)
    }

    /// Whether an error with this signature is on the allow-list
    #[must_use]
    pub fn is_ignorable(&self, message: &str, status: Option<u16>) -> bool {
        if let Some(code) = status {
            if self.statuses.contains(&code) {
                return true;
            }
        }
        self.substrings.iter().any(|text| message.contains(text.as_str()))
            || self.patterns.iter().any(|regex| regex.is_match(message))
    }

    /// Number of allow-list entries
    #[must_use]
    pub fn len(&self) -> usize {
        self.substrings.len() + self.patterns.len() + self.statuses.len()
    }

    /// Whether the allow-list is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Backoff plus classification
#[derive(Debug, Clone, Default)]
pub struct ThrottlePolicy {
    backoff: BackoffPolicy,
    classifier: ErrorClassifier,
}

impl ThrottlePolicy {
    /// Create a throttle policy
    #[must_use]
    pub fn new(backoff: BackoffPolicy, classifier: ErrorClassifier) -> Self {
        Self {
            backoff,
            classifier,
        }
    }

    /// Build from configuration
    ///
    /// # Errors
    ///
    /// Returns error if an allow-list pattern does not compile
    pub fn from_config(backoff: BackoffPolicy, ignorable: &[IgnorableSignature]) -> CoreResult<Self> {
        Ok(Self::new(backoff, ErrorClassifier::new(ignorable)?))
    }

    /// Delay before the next try
    ///
    /// The longer of the policy delay and any externally demanded wait.
    #[must_use]
    pub fn backoff_for(&self, attempt: u32, external: &RateLimitState) -> Duration {
        let delay = self.backoff.delay_for(attempt);
        match external.retry_after {
            Some(wait) => delay.max(wait),
            None => delay,
        }
    }

    /// Classify an execution error
    ///
    /// `unit_ignorable` is the unit's own verdict; either it or the
    /// allow-list can mark an error ignorable.
    #[must_use]
    pub fn classify(&self, err: &UnitError, unit_ignorable: bool) -> ErrorClass {
        if matches!(err, UnitError::LockTimeout { .. }) {
            return ErrorClass::Transient;
        }
        if unit_ignorable || self.classifier.is_ignorable(&err.message(), err.status()) {
            ErrorClass::Ignorable
        } else {
            ErrorClass::Fatal
        }
    }

    /// Backoff strategy
    #[must_use]
    pub const fn backoff(&self) -> BackoffPolicy {
        self.backoff
    }

    /// Compiled allow-list
    #[must_use]
    pub fn classifier(&self) -> &ErrorClassifier {
        &self.classifier
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_fixed_backoff() {
        let policy = BackoffPolicy::fixed(Duration::from_millis(250));
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_millis(250));
        assert_eq!(policy.delay_for(7), Duration::from_millis(250));
    }

    #[test]
    fn test_exponential_backoff() {
        let policy = BackoffPolicy::exponential(Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(policy.delay_for(0), Duration::ZERO);
        assert_eq!(policy.delay_for(1), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(2));
        assert_eq!(policy.delay_for(3), Duration::from_secs(4));
        assert_eq!(policy.delay_for(4), Duration::from_secs(8));
        assert_eq!(policy.delay_for(5), Duration::from_secs(10));
        assert_eq!(policy.delay_for(200), Duration::from_secs(10));
    }

    #[test]
    fn test_backoff_respects_retry_after() {
        let throttle = ThrottlePolicy::new(
            BackoffPolicy::fixed(Duration::from_secs(1)),
            ErrorClassifier::default(),
        );
        let external = RateLimitState::retry_after(Duration::from_secs(30));
        assert_eq!(throttle.backoff_for(1, &external), Duration::from_secs(30));
        assert_eq!(throttle.backoff_for(1, &RateLimitState::none()), Duration::from_secs(1));
    }

    #[test]
    fn test_classifier_matches() {
        let classifier = ErrorClassifier::new(&[
            IgnorableSignature::contains("Timestamp for this request"),
            IgnorableSignature::matches(r"(?i)too many requests"),
            IgnorableSignature::status(503),
        ])
        .unwrap();
        assert_eq!(classifier.len(), 3);

        assert!(classifier.is_ignorable("Timestamp for this request is outside recvWindow", None));
        assert!(classifier.is_ignorable("HTTP 429: Too Many Requests", Some(429)));
        assert!(classifier.is_ignorable("upstream unavailable", Some(503)));
        assert!(!classifier.is_ignorable("Insufficient margin", Some(400)));
    }

    #[test]
    fn test_classifier_bad_pattern() {
        let result = ErrorClassifier::new(&[IgnorableSignature::matches("(unclosed")]);
        assert!(matches!(result, Err(CoreError::Validation { .. })));
    }

    #[test]
    fn test_classify() {
        let throttle = ThrottlePolicy::from_config(
            BackoffPolicy::None,
            &[IgnorableSignature::status(429)],
        )
        .unwrap();

        let rate_limited = UnitError::external(Some(429), "rate limited");
        let rejected = UnitError::external(Some(400), "order rejected");
        let timeout = UnitError::LockTimeout {
            name: "orders:BTCUSDT".to_string(),
            timeout: Duration::from_secs(1),
        };

        assert_eq!(throttle.classify(&rate_limited, false), ErrorClass::Ignorable);
        assert_eq!(throttle.classify(&rejected, false), ErrorClass::Fatal);
        assert_eq!(throttle.classify(&rejected, true), ErrorClass::Ignorable);
        assert_eq!(throttle.classify(&timeout, false), ErrorClass::Transient);
    }

    #[test]
    fn test_signature_config_roundtrip() {
        let json = r#"[{"match":"status","code":429},{"match":"message_contains","text":"-1021"}]"#;
        let signatures: Vec<IgnorableSignature> = serde_json::from_str(json).unwrap();
        assert_eq!(signatures[0], IgnorableSignature::status(429));
        assert_eq!(signatures[1], IgnorableSignature::contains("-1021"));
    }

    proptest! {
        #[test]
        fn prop_exponential_is_monotone_and_capped(
            base in 1u64..10_000,
            cap in 1u64..1_000_000,
            attempt in 0u32..64,
        ) {
            let policy = BackoffPolicy::Exponential { base_ms: base, cap_ms: cap };
            let now = policy.delay_for(attempt);
            let next = policy.delay_for(attempt + 1);
            prop_assert!(now <= next);
            prop_assert!(next <= Duration::from_millis(cap));
        }
    }
}
