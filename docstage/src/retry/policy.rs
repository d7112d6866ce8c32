//! Per-stage retry policy.

use crate::core::ErrorType;
use crate::errors::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Configuration for retry behavior of a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum attempts, including the first one.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry in milliseconds.
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    /// Growth factor applied per additional attempt.
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    /// Relative jitter, e.g. 0.1 for ±10%.
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,
    /// Upper bound for any computed delay in milliseconds.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Extra factor applied to `ResourceExhausted` delays.
    #[serde(default = "default_resource_exhausted_factor")]
    pub resource_exhausted_factor: f64,
    /// Error types that may be retried.
    #[serde(default = "ErrorType::default_retryable")]
    pub retryable_error_types: BTreeSet<ErrorType>,
}

fn default_max_attempts() -> u32 {
    3
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter_fraction() -> f64 {
    0.1
}

fn default_max_backoff_ms() -> u64 {
    5 * 60 * 1000
}

fn default_resource_exhausted_factor() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter_fraction: default_jitter_fraction(),
            max_backoff_ms: default_max_backoff_ms(),
            resource_exhausted_factor: default_resource_exhausted_factor(),
            retryable_error_types: ErrorType::default_retryable(),
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A policy that never retries.
    #[must_use]
    pub fn no_retry() -> Self {
        Self::default().with_max_attempts(1)
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_backoff_base_ms(mut self, delay: u64) -> Self {
        self.backoff_base_ms = delay;
        self
    }

    /// Sets the backoff multiplier.
    #[must_use]
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Sets the jitter fraction.
    #[must_use]
    pub fn with_jitter_fraction(mut self, fraction: f64) -> Self {
        self.jitter_fraction = fraction;
        self
    }

    /// Sets the delay cap.
    #[must_use]
    pub fn with_max_backoff_ms(mut self, delay: u64) -> Self {
        self.max_backoff_ms = delay;
        self
    }

    /// Sets the `ResourceExhausted` backoff factor.
    #[must_use]
    pub fn with_resource_exhausted_factor(mut self, factor: f64) -> Self {
        self.resource_exhausted_factor = factor;
        self
    }

    /// Replaces the set of retryable error types.
    #[must_use]
    pub fn with_retryable(mut self, types: impl IntoIterator<Item = ErrorType>) -> Self {
        self.retryable_error_types = types.into_iter().collect();
        self
    }

    /// Returns true if failures of this type may be retried.
    #[must_use]
    pub fn is_retryable(&self, error_type: ErrorType) -> bool {
        self.retryable_error_types.contains(&error_type)
    }

    /// Validates the policy.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first out-of-range field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_attempts == 0 {
            return Err(ConfigError::invalid("max_attempts", "must be at least 1"));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(ConfigError::invalid(
                "backoff_multiplier",
                "must be a finite number >= 1.0",
            ));
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            return Err(ConfigError::invalid(
                "jitter_fraction",
                "must be between 0.0 and 1.0",
            ));
        }
        if !self.resource_exhausted_factor.is_finite() || self.resource_exhausted_factor < 1.0 {
            return Err(ConfigError::invalid(
                "resource_exhausted_factor",
                "must be a finite number >= 1.0",
            ));
        }
        if self.max_backoff_ms < self.backoff_base_ms {
            return Err(ConfigError::invalid(
                "max_backoff_ms",
                "must not be smaller than backoff_base_ms",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_policy_default() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.backoff_base_ms, 1000);
        assert!((policy.backoff_multiplier - 2.0).abs() < f64::EPSILON);
        assert!(policy.is_retryable(ErrorType::Transient));
        assert!(!policy.is_retryable(ErrorType::ValidationFailure));
        assert!(policy.validate().is_ok());
    }

    #[test]
    fn test_retry_policy_builder() {
        let policy = RetryPolicy::new()
            .with_max_attempts(5)
            .with_backoff_base_ms(500)
            .with_backoff_multiplier(3.0)
            .with_jitter_fraction(0.0)
            .with_retryable([ErrorType::Transient]);

        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.backoff_base_ms, 500);
        assert!(!policy.is_retryable(ErrorType::ResourceExhausted));
    }

    #[test]
    fn test_retry_policy_validation() {
        assert!(RetryPolicy::new().with_max_attempts(0).validate().is_err());
        assert!(RetryPolicy::new().with_jitter_fraction(1.5).validate().is_err());
        assert!(RetryPolicy::new().with_backoff_multiplier(0.5).validate().is_err());
        assert!(RetryPolicy::new()
            .with_backoff_base_ms(10_000)
            .with_max_backoff_ms(1_000)
            .validate()
            .is_err());
    }

    #[test]
    fn test_retry_policy_deserialize_with_defaults() {
        let policy: RetryPolicy = serde_json::from_str(r#"{"max_attempts": 5}"#).unwrap();
        assert_eq!(policy.max_attempts, 5);
        assert_eq!(policy.backoff_base_ms, 1000);
        assert_eq!(policy.retryable_error_types, ErrorType::default_retryable());
    }
}
