//! Persisted record types.

use crate::core::{DocumentId, ErrorStatus, ErrorType, ExecutionStatus, Severity, StageKey};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Opaque handler-owned JSON object.
pub type Metadata = serde_json::Map<String, serde_json::Value>;

/// One row per (document, stage).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageExecution {
    /// The document.
    pub document_id: DocumentId,
    /// The stage.
    pub stage_name: String,
    /// Lifecycle status.
    pub status: ExecutionStatus,
    /// Attempts started since the last reset.
    pub attempt_count: u32,
    /// Handler-reported progress, 0..=100.
    pub progress_percent: f64,
    /// Start of the current or last attempt.
    pub started_at: Option<DateTime<Utc>>,
    /// Set iff the status is completed.
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest time a pending retry may start.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Handler-owned metadata.
    #[serde(default)]
    pub metadata: Metadata,
    /// Most recent pipeline error for this row.
    pub last_error_id: Option<Uuid>,
    /// Identifier of the attempt that owns a running row.
    pub attempt_token: Option<Uuid>,
    /// Row creation time.
    pub created_at: DateTime<Utc>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
}

impl StageExecution {
    /// Creates a fresh pending row.
    #[must_use]
    pub fn pending(document_id: DocumentId, stage_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            document_id,
            stage_name: stage_name.into(),
            status: ExecutionStatus::Pending,
            attempt_count: 0,
            progress_percent: 0.0,
            started_at: None,
            completed_at: None,
            next_retry_at: None,
            metadata: Metadata::new(),
            last_error_id: None,
            attempt_token: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Returns the row key.
    #[must_use]
    pub fn key(&self) -> StageKey {
        StageKey::new(self.document_id.clone(), self.stage_name.clone())
    }

    /// Returns true if the row is pending and any backoff has elapsed.
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == ExecutionStatus::Pending && self.next_retry_at.map_or(true, |at| at <= now)
    }

    /// Returns this row reset to a fresh pending state.
    ///
    /// Identity and creation time are kept; everything else starts over.
    #[must_use]
    pub fn reset(&self, now: DateTime<Utc>) -> Self {
        let mut fresh = Self::pending(self.document_id.clone(), self.stage_name.clone(), now);
        fresh.created_at = self.created_at;
        fresh
    }

    /// Duration of the last finished attempt, if known.
    #[must_use]
    pub fn duration(&self) -> Option<chrono::Duration> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) if end >= start => Some(end - start),
            _ => None,
        }
    }
}

/// Proof that a stage committed its side effects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionMarker {
    /// The document.
    pub document_id: DocumentId,
    /// The stage.
    pub stage_name: String,
    /// The attempt that committed.
    pub attempt: u32,
    /// Commit time.
    pub committed_at: DateTime<Utc>,
}

impl CompletionMarker {
    /// Returns the marker key.
    #[must_use]
    pub fn key(&self) -> StageKey {
        StageKey::new(self.document_id.clone(), self.stage_name.clone())
    }
}

/// What happens to the completion marker alongside a row update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MarkerChange {
    /// Leave the marker as it is.
    Keep,
    /// Write the marker unless one already exists.
    Write(CompletionMarker),
    /// Delete the marker if present.
    Remove,
}

/// A recorded stage failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineError {
    /// Identifier.
    pub error_id: Uuid,
    /// The document.
    pub document_id: DocumentId,
    /// The stage.
    pub stage_name: String,
    /// Classification.
    pub error_type: ErrorType,
    /// Severity.
    pub severity: Severity,
    /// Message.
    pub message: String,
    /// Structured context.
    #[serde(default)]
    pub context: Metadata,
    /// Open or resolved.
    pub status: ErrorStatus,
    /// Attempt count of the stage when the failure was recorded.
    pub retry_count_at_failure: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Resolution time.
    pub resolved_at: Option<DateTime<Utc>>,
    /// Operator or system notes on resolution.
    pub resolution_notes: Option<String>,
}

impl PipelineError {
    /// Returns the key of the failing stage.
    #[must_use]
    pub fn key(&self) -> StageKey {
        StageKey::new(self.document_id.clone(), self.stage_name.clone())
    }

    /// Returns true if the error is open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.status == ErrorStatus::Open
    }

    /// Marks the error resolved. Already resolved errors are left as they are.
    pub fn resolve(&mut self, notes: impl Into<String>, now: DateTime<Utc>) -> bool {
        if !self.is_open() {
            return false;
        }
        self.status = ErrorStatus::Resolved;
        self.resolved_at = Some(now);
        self.resolution_notes = Some(notes.into());
        true
    }
}
