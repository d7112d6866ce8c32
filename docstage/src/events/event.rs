//! Lifecycle events.

use crate::core::{DocumentId, ErrorType};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

/// A lifecycle event emitted by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event")]
pub enum PipelineEvent {
    /// A document got its root stage rows.
    #[serde(rename = "document.registered")]
    DocumentRegistered {
        /// The document.
        document_id: DocumentId,
        /// Stages created as pending.
        stages: Vec<String>,
    },

    /// An attempt started.
    #[serde(rename = "stage.started")]
    StageStarted {
        /// The document.
        document_id: DocumentId,
        /// The stage.
        stage: String,
        /// Attempt number.
        attempt: u32,
    },

    /// An attempt committed.
    #[serde(rename = "stage.completed")]
    StageCompleted {
        /// The document.
        document_id: DocumentId,
        /// The stage.
        stage: String,
        /// Attempt number.
        attempt: u32,
        /// Wall time of the attempt.
        duration_ms: Option<i64>,
        /// Stages that became pending as a result.
        unlocked: Vec<String>,
    },

    /// An attempt failed.
    #[serde(rename = "stage.failed")]
    StageFailed {
        /// The document.
        document_id: DocumentId,
        /// The stage.
        stage: String,
        /// Attempt number.
        attempt: u32,
        /// The recorded pipeline error.
        error_id: Uuid,
        /// Classification.
        error_type: ErrorType,
        /// True if the stage will not be retried.
        terminal: bool,
    },

    /// A failed attempt was scheduled for retry.
    #[serde(rename = "stage.retry_scheduled")]
    StageRetryScheduled {
        /// The document.
        document_id: DocumentId,
        /// The stage.
        stage: String,
        /// The attempt that failed.
        attempt: u32,
        /// Backoff delay.
        delay_ms: u64,
        /// Earliest start of the next attempt.
        retry_at: DateTime<Utc>,
    },

    /// A stage was skipped.
    #[serde(rename = "stage.skipped")]
    StageSkipped {
        /// The document.
        document_id: DocumentId,
        /// The stage.
        stage: String,
        /// Why.
        reason: String,
    },

    /// A stale running attempt was reclaimed.
    #[serde(rename = "stage.reaped")]
    StageReaped {
        /// The document.
        document_id: DocumentId,
        /// The stage.
        stage: String,
        /// The abandoned attempt.
        attempt: u32,
        /// How long it had been running.
        running_for_ms: i64,
    },

    /// A required stage failed terminally.
    #[serde(rename = "document.blocked")]
    DocumentBlocked {
        /// The document.
        document_id: DocumentId,
        /// The failed required stage.
        stage: String,
    },

    /// An operator restarted part of a document.
    #[serde(rename = "document.retried")]
    DocumentRetried {
        /// The document.
        document_id: DocumentId,
        /// The stage the reset started from.
        from_stage: String,
        /// Every stage that was reset.
        reset: Vec<String>,
    },
}

impl PipelineEvent {
    /// Dotted event type, e.g. `stage.started`.
    #[must_use]
    pub const fn event_type(&self) -> &'static str {
        match self {
            Self::DocumentRegistered { .. } => "document.registered",
            Self::StageStarted { .. } => "stage.started",
            Self::StageCompleted { .. } => "stage.completed",
            Self::StageFailed { .. } => "stage.failed",
            Self::StageRetryScheduled { .. } => "stage.retry_scheduled",
            Self::StageSkipped { .. } => "stage.skipped",
            Self::StageReaped { .. } => "stage.reaped",
            Self::DocumentBlocked { .. } => "document.blocked",
            Self::DocumentRetried { .. } => "document.retried",
        }
    }

    /// The document the event is about.
    #[must_use]
    pub const fn document_id(&self) -> &DocumentId {
        match self {
            Self::DocumentRegistered { document_id, .. }
            | Self::StageStarted { document_id, .. }
            | Self::StageCompleted { document_id, .. }
            | Self::StageFailed { document_id, .. }
            | Self::StageRetryScheduled { document_id, .. }
            | Self::StageSkipped { document_id, .. }
            | Self::StageReaped { document_id, .. }
            | Self::DocumentBlocked { document_id, .. }
            | Self::DocumentRetried { document_id, .. } => document_id,
        }
    }

    /// The event as a JSON object, including its `event` tag.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}
