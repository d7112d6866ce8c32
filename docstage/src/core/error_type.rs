//! Failure taxonomy shared by the retry evaluator, error log and tracker.

use super::status::UnknownVariant;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

/// Classification of a stage failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    /// Temporary environmental failure (timeouts, dropped connections).
    Transient,
    /// Quota, rate limit or memory pressure. Retried with a longer backoff.
    ResourceExhausted,
    /// Malformed or unsupported input the handler cannot process.
    ValidationFailure,
    /// An illegal transition was attempted.
    DependencyViolation,
    /// Anything unanticipated. Not retried.
    Unknown,
}

impl ErrorType {
    /// All variants, in declaration order.
    pub const ALL: [Self; 5] = [
        Self::Transient,
        Self::ResourceExhausted,
        Self::ValidationFailure,
        Self::DependencyViolation,
        Self::Unknown,
    ];

    /// Returns the storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::ResourceExhausted => "resource_exhausted",
            Self::ValidationFailure => "validation_failure",
            Self::DependencyViolation => "dependency_violation",
            Self::Unknown => "unknown",
        }
    }

    /// Returns true if retry policies retry this type unless configured otherwise.
    #[must_use]
    pub const fn is_retryable_by_default(&self) -> bool {
        matches!(self, Self::Transient | Self::ResourceExhausted)
    }

    /// The default set of retryable types.
    #[must_use]
    pub fn default_retryable() -> BTreeSet<Self> {
        Self::ALL
            .into_iter()
            .filter(Self::is_retryable_by_default)
            .collect()
    }

    /// Operator guidance attached to errors of this type.
    #[must_use]
    pub const fn guidance(&self) -> &'static str {
        match self {
            Self::Transient => "Retried automatically; investigate only if retries are exhausted.",
            Self::ResourceExhausted => {
                "Retried with longer backoff; check quotas, rate limits and memory headroom."
            }
            Self::ValidationFailure => {
                "The input cannot be processed as-is; fix the document or its configuration, then retry or skip the stage."
            }
            Self::DependencyViolation => {
                "A stage was reported out of order; inspect upstream stages before retrying."
            }
            Self::Unknown => "Unclassified failure; inspect the error context before retrying.",
        }
    }
}

impl fmt::Display for ErrorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownVariant::new("error type", s))
    }
}

/// How urgently a recorded error needs attention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// A retry has been scheduled.
    Warning,
    /// Terminal failure of an optional stage.
    Error,
    /// Terminal failure of a required stage; the document is blocked.
    Critical,
}

impl Severity {
    /// Returns the storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
            Self::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            other => Err(UnknownVariant::new("severity", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_retryable() {
        let retryable = ErrorType::default_retryable();
        assert_eq!(retryable.len(), 2);
        assert!(retryable.contains(&ErrorType::Transient));
        assert!(retryable.contains(&ErrorType::ResourceExhausted));
        assert!(!retryable.contains(&ErrorType::Unknown));
    }

    #[test]
    fn test_error_type_parse() {
        assert_eq!(
            "validation_failure".parse::<ErrorType>(),
            Ok(ErrorType::ValidationFailure)
        );
        assert!("timeout".parse::<ErrorType>().is_err());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::Error);
        assert!(Severity::Error > Severity::Warning);
    }
}
