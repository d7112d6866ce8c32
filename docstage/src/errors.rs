//! Error types for docstage.
//!
//! Operation failures are returned as values rather than used for control
//! flow: every [`OrchestratorError`] maps onto the [`ErrorType`] taxonomy so
//! callers can decide whether a retry could ever help.

use crate::core::{DocumentId, ErrorType, ExecutionStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use uuid::Uuid;

/// Diagnostic metadata attached to registry and configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ErrorInfo {
    /// Error code (e.g., "REGISTRY-CYCLE").
    pub code: String,
    /// Short summary of the error.
    pub summary: String,
    /// Hint for fixing the error.
    pub fix_hint: Option<String>,
    /// Additional context key-value pairs.
    #[serde(default)]
    pub context: HashMap<String, String>,
}

impl ErrorInfo {
    /// Creates a new error info.
    #[must_use]
    pub fn new(code: impl Into<String>, summary: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            summary: summary.into(),
            fix_hint: None,
            context: HashMap::new(),
        }
    }

    /// Sets the fix hint.
    #[must_use]
    pub fn with_fix_hint(mut self, hint: impl Into<String>) -> Self {
        self.fix_hint = Some(hint.into());
        self
    }

    /// Adds a single context entry.
    #[must_use]
    pub fn with_context_entry(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }
}

/// Stage graph validation failures, raised once at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    /// The registry has no stages.
    #[error("Stage registry has no stages")]
    Empty,

    /// Two definitions share a name.
    #[error("Stage '{stage}' is defined more than once")]
    DuplicateStage {
        /// The duplicated name.
        stage: String,
    },

    /// A stage lists itself as a dependency.
    #[error("Stage '{stage}' cannot depend on itself")]
    SelfDependency {
        /// The offending stage.
        stage: String,
    },

    /// A dependency names a stage that does not exist.
    #[error("Stage '{stage}' depends on unknown stage '{dependency}'")]
    UnknownDependency {
        /// The stage declaring the dependency.
        stage: String,
        /// The missing dependency.
        dependency: String,
    },

    /// The dependency graph contains a cycle.
    #[error("Cycle detected in stage graph: {}", cycle_path.join(" -> "))]
    CycleDetected {
        /// The path of stages forming the cycle, first stage repeated at the end.
        cycle_path: Vec<String>,
    },
}

impl RegistryError {
    /// Returns diagnostic info with a stable code and a fix hint.
    #[must_use]
    pub fn info(&self) -> ErrorInfo {
        match self {
            Self::Empty => ErrorInfo::new("REGISTRY-EMPTY", self.to_string())
                .with_fix_hint("Define at least one stage before starting the orchestrator."),
            Self::DuplicateStage { stage } => ErrorInfo::new("REGISTRY-DUPLICATE", self.to_string())
                .with_fix_hint("Stage names must be unique; rename or remove one definition.")
                .with_context_entry("stage", stage),
            Self::SelfDependency { stage } => ErrorInfo::new("REGISTRY-SELF_DEP", self.to_string())
                .with_fix_hint("Remove the stage from its own dependency set.")
                .with_context_entry("stage", stage),
            Self::UnknownDependency { stage, dependency } => {
                ErrorInfo::new("REGISTRY-MISSING_DEP", self.to_string())
                    .with_fix_hint("Check for typos in stage names or add the missing stage.")
                    .with_context_entry("stage", stage)
                    .with_context_entry("dependency", dependency)
            }
            Self::CycleDetected { cycle_path } => ErrorInfo::new("REGISTRY-CYCLE", self.to_string())
                .with_fix_hint("Remove one of the dependencies in the cycle to break it.")
                .with_context_entry("cycle", cycle_path.join(" -> ")),
        }
    }

    /// Returns the stages involved in the error.
    #[must_use]
    pub fn stages(&self) -> Vec<String> {
        match self {
            Self::Empty => Vec::new(),
            Self::DuplicateStage { stage } | Self::SelfDependency { stage } => vec![stage.clone()],
            Self::UnknownDependency { stage, dependency } => vec![stage.clone(), dependency.clone()],
            Self::CycleDetected { cycle_path } => cycle_path.clone(),
        }
    }
}

/// Failures of a stage state store or pipeline error log backend.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Generic backend failure.
    #[error("Store backend error: {0}")]
    Backend(String),

    /// A persisted row could not be decoded.
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    /// JSON encoding of metadata or context failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A blocking backend task panicked or was cancelled.
    #[error("Store task failed: {0}")]
    TaskJoin(String),

    /// SQLite error.
    #[cfg(feature = "sqlite")]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// Errors returned by orchestrator operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// The document id is empty or whitespace-only.
    #[error("Invalid document id: {0:?}")]
    InvalidDocumentId(String),

    /// No stage executions exist for the document.
    #[error("Document '{0}' is not registered")]
    DocumentNotRegistered(DocumentId),

    /// The stage is not part of the registry.
    #[error("Unknown stage: {0}")]
    UnknownStage(String),

    /// The stage has no execution row yet; its dependencies have not resolved.
    #[error("Stage '{stage}' of document '{document_id}' is not eligible yet")]
    StageNotEligible {
        /// The document.
        document_id: DocumentId,
        /// The stage.
        stage: String,
    },

    /// Another worker owns the stage.
    #[error("Stage '{stage}' of document '{document_id}' is already running (attempt {attempt})")]
    AlreadyRunning {
        /// The document.
        document_id: DocumentId,
        /// The stage.
        stage: String,
        /// The attempt currently running.
        attempt: u32,
    },

    /// The stage already committed its side effects.
    #[error("Stage '{stage}' of document '{document_id}' is already completed")]
    AlreadyCompleted {
        /// The document.
        document_id: DocumentId,
        /// The stage.
        stage: String,
    },

    /// Some dependencies are not completed or skipped.
    #[error("Stage '{stage}' of document '{document_id}' has unmet dependencies: {}", missing.join(", "))]
    DependencyNotMet {
        /// The document.
        document_id: DocumentId,
        /// The stage.
        stage: String,
        /// Dependencies that are not yet satisfied.
        missing: Vec<String>,
    },

    /// The stage is pending but its retry backoff has not elapsed.
    #[error("Stage '{stage}' of document '{document_id}' is backing off until {retry_at}")]
    BackoffNotElapsed {
        /// The document.
        document_id: DocumentId,
        /// The stage.
        stage: String,
        /// When the stage becomes eligible.
        retry_at: DateTime<Utc>,
    },

    /// A required stage failed terminally; nothing else is scheduled.
    #[error("Document '{0}' is blocked pending manual review")]
    DocumentBlocked(DocumentId),

    /// The token does not own the current attempt.
    #[error("Stale attempt token for stage '{stage}' of document '{document_id}' (attempt {attempt})")]
    StaleToken {
        /// The document.
        document_id: DocumentId,
        /// The stage.
        stage: String,
        /// The attempt the token was issued for.
        attempt: u32,
    },

    /// The requested transition is not legal from the current status.
    #[error("Invalid transition for stage '{stage}' of document '{document_id}': {from} -> {to}")]
    InvalidTransition {
        /// The document.
        document_id: DocumentId,
        /// The stage.
        stage: String,
        /// Current status.
        from: ExecutionStatus,
        /// Requested status.
        to: ExecutionStatus,
    },

    /// `retry_document` was asked to restart from a non-terminal stage.
    #[error("Stage '{stage}' of document '{document_id}' is not terminal ({status})")]
    NotTerminal {
        /// The document.
        document_id: DocumentId,
        /// The stage.
        stage: String,
        /// Current status.
        status: ExecutionStatus,
    },

    /// Progress outside 0..=100.
    #[error("Progress must be between 0 and 100, got {0}")]
    InvalidProgress(f64),

    /// No pipeline error with this id.
    #[error("Pipeline error not found: {0}")]
    ErrorNotFound(Uuid),

    /// The storage-level compare-and-swap lost against another writer.
    #[error("Concurrent update of stage '{stage}' of document '{document_id}'")]
    Conflict {
        /// The document.
        document_id: DocumentId,
        /// The stage.
        stage: String,
    },

    /// `retry_document` kept losing the reset of one stage to another writer.
    ///
    /// Stages in `reset` are already pending with their markers removed;
    /// stages in `remaining`, starting with `stage`, were not touched.
    #[error("Retry of document '{document_id}' stopped at stage '{stage}' after resetting {reset:?}")]
    PartialReset {
        /// The document.
        document_id: DocumentId,
        /// The stage whose reset kept losing.
        stage: String,
        /// Stages already reset, in graph order.
        reset: Vec<String>,
        /// Stages not reset, in graph order.
        remaining: Vec<String>,
    },

    /// Backend failure.
    #[error("{0}")]
    Store(#[from] StoreError),

    /// Stage graph failure.
    #[error("{0}")]
    Registry(#[from] RegistryError),

    /// A retry policy or other setting is out of range.
    #[error("{0}")]
    Config(#[from] ConfigError),
}

impl OrchestratorError {
    /// Maps the error onto the failure taxonomy.
    #[must_use]
    pub const fn error_type(&self) -> ErrorType {
        match self {
            Self::StageNotEligible { .. }
            | Self::AlreadyRunning { .. }
            | Self::AlreadyCompleted { .. }
            | Self::DependencyNotMet { .. }
            | Self::BackoffNotElapsed { .. }
            | Self::DocumentBlocked(_)
            | Self::StaleToken { .. }
            | Self::InvalidTransition { .. }
            | Self::NotTerminal { .. } => ErrorType::DependencyViolation,
            Self::InvalidDocumentId(_)
            | Self::DocumentNotRegistered(_)
            | Self::UnknownStage(_)
            | Self::InvalidProgress(_)
            | Self::ErrorNotFound(_)
            | Self::Registry(_)
            | Self::Config(_) => ErrorType::ValidationFailure,
            Self::Conflict { .. } | Self::PartialReset { .. } | Self::Store(_) => ErrorType::Transient,
        }
    }

    /// Returns true if the call may succeed when repeated later.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BackoffNotElapsed { .. } | Self::Conflict { .. } | Self::Store(_)
        )
    }
}

/// Result alias for orchestrator operations.
pub type OrchestratorResult<T> = Result<T, OrchestratorError>;

/// Configuration loading and validation failures.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("Failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    /// The configuration is not valid JSON for the schema.
    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    /// An environment override could not be parsed.
    #[error("Invalid value for {var}: '{value}'")]
    Env {
        /// The environment variable.
        var: String,
        /// The rejected value.
        value: String,
    },

    /// A field failed validation.
    #[error("Invalid configuration field '{field}': {message}")]
    Invalid {
        /// The field path.
        field: String,
        /// What is wrong with it.
        message: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_info_creation() {
        let info = ErrorInfo::new("TEST-001", "Test error")
            .with_fix_hint("Fix this by doing that")
            .with_context_entry("stage", "chunking");

        assert_eq!(info.code, "TEST-001");
        assert_eq!(info.fix_hint, Some("Fix this by doing that".to_string()));
        assert_eq!(info.context.get("stage"), Some(&"chunking".to_string()));
    }

    #[test]
    fn test_cycle_detected_error() {
        let err = RegistryError::CycleDetected {
            cycle_path: vec!["a".into(), "b".into(), "c".into(), "a".into()],
        };

        assert!(err.to_string().contains("a -> b -> c -> a"));
        assert_eq!(err.info().code, "REGISTRY-CYCLE");
        assert_eq!(err.stages().len(), 4);
    }

    #[test]
    fn test_unknown_dependency_info() {
        let err = RegistryError::UnknownDependency {
            stage: "chunking".into(),
            dependency: "ocr".into(),
        };
        let info = err.info();
        assert_eq!(info.code, "REGISTRY-MISSING_DEP");
        assert_eq!(info.context.get("dependency"), Some(&"ocr".to_string()));
    }

    #[test]
    fn test_transition_errors_are_dependency_violations() {
        let err = OrchestratorError::AlreadyRunning {
            document_id: "d1".into(),
            stage: "chunking".into(),
            attempt: 1,
        };
        assert_eq!(err.error_type(), ErrorType::DependencyViolation);
        assert!(!err.is_retryable());

        let err = OrchestratorError::Store(StoreError::Backend("disk full".into()));
        assert_eq!(err.error_type(), ErrorType::Transient);
        assert!(err.is_retryable());
    }
}
