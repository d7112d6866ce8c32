//! Failure classification.

use crate::core::ErrorType;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use thiserror::Error;

static TRANSIENT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)\btime[d ]?\s?out\b",
        r"(?i)\bconnection (reset|refused|aborted|closed)\b",
        r"(?i)\btemporar(y|ily) unavailable\b",
        r"(?i)\bservice unavailable\b",
        r"(?i)\b(502|503|504)\b",
        r"(?i)\bbroken pipe\b",
        r"(?i)\btry again\b",
    ])
});

static RESOURCE_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)\bout of memory\b",
        r"(?i)\brate.?limit",
        r"(?i)\bquota\b",
        r"(?i)\btoo many requests\b",
        r"(?i)\b429\b",
        r"(?i)\bno space left\b",
        r"(?i)\bresource exhausted\b",
    ])
});

static VALIDATION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    compile(&[
        r"(?i)\bunsupported (format|file|input|category|type)\b",
        r"(?i)\bno extraction rule\b",
        r"(?i)\bmalformed\b",
        r"(?i)\binvalid (input|document|format)\b",
        r"(?i)\bcorrupt(ed)?\b",
    ])
});

fn compile(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
}

/// A failure reported by a stage handler.
///
/// Handlers that know what went wrong set `kind`; otherwise the message is
/// classified heuristically.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct StageError {
    /// Explicit classification, if the handler knows it.
    pub kind: Option<ErrorType>,
    /// Human-readable message.
    pub message: String,
    /// Structured context for operators.
    #[serde(default)]
    pub context: serde_json::Map<String, serde_json::Value>,
}

impl StageError {
    /// Creates an unclassified stage error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            kind: None,
            message: message.into(),
            context: serde_json::Map::new(),
        }
    }

    /// Creates a transient error.
    #[must_use]
    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(message).with_kind(ErrorType::Transient)
    }

    /// Creates a resource exhaustion error.
    #[must_use]
    pub fn resource_exhausted(message: impl Into<String>) -> Self {
        Self::new(message).with_kind(ErrorType::ResourceExhausted)
    }

    /// Creates a validation failure.
    #[must_use]
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(message).with_kind(ErrorType::ValidationFailure)
    }

    /// Creates a dependency violation.
    #[must_use]
    pub fn dependency_violation(message: impl Into<String>) -> Self {
        Self::new(message).with_kind(ErrorType::DependencyViolation)
    }

    /// Sets the classification.
    #[must_use]
    pub fn with_kind(mut self, kind: ErrorType) -> Self {
        self.kind = Some(kind);
        self
    }

    /// Adds a context entry.
    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Converts an arbitrary handler error, classifying it on the way.
    #[must_use]
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        if let Some(stage_err) = err.downcast_ref::<Self>() {
            let mut converted = stage_err.clone();
            converted.kind = Some(classify(stage_err));
            return converted;
        }
        Self::new(format!("{err:#}")).with_kind(classify_anyhow(err))
    }
}

/// Classifies a stage error.
///
/// An explicit `kind` always wins.
#[must_use]
pub fn classify(error: &StageError) -> ErrorType {
    error
        .kind
        .unwrap_or_else(|| classify_message(&error.message))
}

/// Classifies a free-form error message.
#[must_use]
pub fn classify_message(message: &str) -> ErrorType {
    let matches = |patterns: &[Regex]| patterns.iter().any(|re| re.is_match(message));

    if matches(&RESOURCE_PATTERNS) {
        ErrorType::ResourceExhausted
    } else if matches(&TRANSIENT_PATTERNS) {
        ErrorType::Transient
    } else if matches(&VALIDATION_PATTERNS) {
        ErrorType::ValidationFailure
    } else {
        ErrorType::Unknown
    }
}

/// Classifies an error returned by a handler, walking its source chain.
#[must_use]
pub fn classify_anyhow(err: &anyhow::Error) -> ErrorType {
    for cause in err.chain() {
        if let Some(stage_err) = cause.downcast_ref::<StageError>() {
            return classify(stage_err);
        }
        if cause.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            return ErrorType::Transient;
        }
        if let Some(io_err) = cause.downcast_ref::<std::io::Error>() {
            if let Some(kind) = classify_io(io_err.kind()) {
                return kind;
            }
        }
        if cause.downcast_ref::<serde_json::Error>().is_some() {
            return ErrorType::ValidationFailure;
        }
    }
    classify_message(&format!("{err:#}"))
}

fn classify_io(kind: std::io::ErrorKind) -> Option<ErrorType> {
    use std::io::ErrorKind;

    match kind {
        ErrorKind::TimedOut
        | ErrorKind::Interrupted
        | ErrorKind::WouldBlock
        | ErrorKind::ConnectionReset
        | ErrorKind::ConnectionRefused
        | ErrorKind::ConnectionAborted
        | ErrorKind::NotConnected
        | ErrorKind::BrokenPipe => Some(ErrorType::Transient),
        ErrorKind::OutOfMemory => Some(ErrorType::ResourceExhausted),
        ErrorKind::InvalidData | ErrorKind::InvalidInput | ErrorKind::Unsupported => {
            Some(ErrorType::ValidationFailure)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn test_explicit_kind_wins() {
        let err = StageError::validation("connection reset while reading");
        assert_eq!(classify(&err), ErrorType::ValidationFailure);
    }

    #[test]
    fn test_classify_message_patterns() {
        assert_eq!(classify_message("upstream request timed out"), ErrorType::Transient);
        assert_eq!(classify_message("Connection reset by peer"), ErrorType::Transient);
        assert_eq!(
            classify_message("embedding API rate limit exceeded"),
            ErrorType::ResourceExhausted
        );
        assert_eq!(classify_message("CUDA out of memory"), ErrorType::ResourceExhausted);
        assert_eq!(
            classify_message("no extraction rule configured for category 'schematic'"),
            ErrorType::ValidationFailure
        );
        assert_eq!(classify_message("something odd happened"), ErrorType::Unknown);
    }

    #[test]
    fn test_classify_anyhow_io_error() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err = anyhow::Error::new(io).context("fetching page images");
        assert_eq!(classify_anyhow(&err), ErrorType::Transient);

        let io = std::io::Error::new(std::io::ErrorKind::InvalidData, "bad pdf xref");
        let err = anyhow::Error::new(io);
        assert_eq!(classify_anyhow(&err), ErrorType::ValidationFailure);
    }

    #[test]
    fn test_classify_anyhow_stage_error_in_chain() {
        let result: Result<(), StageError> = Err(StageError::resource_exhausted("quota"));
        let err = result.context("embedding batch 3").unwrap_err();
        assert_eq!(classify_anyhow(&err), ErrorType::ResourceExhausted);
    }

    #[test]
    fn test_from_anyhow_keeps_context() {
        let err = anyhow::Error::new(
            StageError::new("unsupported format: cad").with_context("mime", serde_json::json!("application/dwg")),
        );
        let converted = StageError::from_anyhow(&err);
        assert_eq!(converted.kind, Some(ErrorType::ValidationFailure));
        assert_eq!(converted.context.get("mime"), Some(&serde_json::json!("application/dwg")));
    }

    #[test]
    fn test_from_anyhow_plain_message() {
        let err = anyhow::anyhow!("worker crashed unexpectedly");
        let converted = StageError::from_anyhow(&err);
        assert_eq!(converted.kind, Some(ErrorType::Unknown));
        assert!(converted.message.contains("worker crashed"));
    }
}
