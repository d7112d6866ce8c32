//! Read-side document progress view.

use crate::core::{DocumentId, DocumentStatus, ExecutionStatus};
use crate::registry::StageRegistry;
use crate::store::{PipelineError, StageExecution};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

/// Progress of one stage of a document.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StageProgress {
    /// The stage.
    pub stage_name: String,
    /// Whether the stage is required.
    pub required: bool,
    /// Current status; `None` until the stage's dependencies resolve.
    pub status: Option<ExecutionStatus>,
    /// Attempts since the last reset.
    pub attempt_count: u32,
    /// Handler-reported progress.
    pub progress_percent: f64,
    /// Start of the current or last attempt.
    pub started_at: Option<DateTime<Utc>>,
    /// Completion time.
    pub completed_at: Option<DateTime<Utc>>,
    /// Earliest retry time while backing off.
    pub next_retry_at: Option<DateTime<Utc>>,
    /// Most recent error.
    pub last_error_id: Option<Uuid>,
}

/// Document progress derived from its stage rows. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressView {
    /// The document.
    pub document_id: DocumentId,
    /// Document-level status.
    pub status: DocumentStatus,
    /// Share of required stages that are completed or skipped, 0..=100.
    pub overall_percent: f64,
    /// Required stages completed or skipped.
    pub completed_required: usize,
    /// Number of required stages.
    pub required_count: usize,
    /// The first running, else pending, stage in graph order.
    pub current_stage: Option<String>,
    /// True if a required stage failed terminally.
    pub blocked: bool,
    /// Same as `blocked`; kept separate for the operator surface.
    pub manual_review_required: bool,
    /// Open pipeline errors of the document.
    pub open_errors: Vec<PipelineError>,
    /// Every stage of the graph, in topological order.
    pub stages: Vec<StageProgress>,
}

impl ProgressView {
    pub(crate) fn build(
        registry: &StageRegistry,
        document_id: DocumentId,
        rows: &[StageExecution],
        errors: Vec<PipelineError>,
    ) -> Self {
        let by_stage: HashMap<&str, &StageExecution> =
            rows.iter().map(|r| (r.stage_name.as_str(), r)).collect();

        let required_count = registry.required_count();
        let mut completed_required = 0;
        let mut blocked = false;
        let mut stages = Vec::with_capacity(registry.len());

        for def in registry.iter() {
            let row = by_stage.get(def.name.as_str()).copied();
            let status = row.map(|r| r.status);
            if def.required {
                match status {
                    Some(s) if s.satisfies_dependency() => completed_required += 1,
                    Some(ExecutionStatus::Failed) => blocked = true,
                    _ => {}
                }
            }
            stages.push(StageProgress {
                stage_name: def.name.clone(),
                required: def.required,
                status,
                attempt_count: row.map_or(0, |r| r.attempt_count),
                progress_percent: row.map_or(0.0, |r| r.progress_percent),
                started_at: row.and_then(|r| r.started_at),
                completed_at: row.and_then(|r| r.completed_at),
                next_retry_at: row.and_then(|r| r.next_retry_at),
                last_error_id: row.and_then(|r| r.last_error_id),
            });
        }

        let status = if rows.is_empty() {
            DocumentStatus::NotRegistered
        } else if blocked {
            DocumentStatus::Blocked
        } else if completed_required == required_count {
            DocumentStatus::Completed
        } else {
            DocumentStatus::Processing
        };

        let current_stage = if status == DocumentStatus::Processing {
            current_stage(&stages)
        } else {
            None
        };

        #[allow(clippy::cast_precision_loss)]
        let overall_percent = if required_count == 0 {
            100.0
        } else {
            completed_required as f64 / required_count as f64 * 100.0
        };

        Self {
            document_id,
            status,
            overall_percent,
            completed_required,
            required_count,
            current_stage,
            blocked,
            manual_review_required: blocked,
            open_errors: errors.into_iter().filter(PipelineError::is_open).collect(),
            stages,
        }
    }

    /// Progress of one stage.
    #[must_use]
    pub fn stage(&self, name: &str) -> Option<&StageProgress> {
        self.stages.iter().find(|s| s.stage_name == name)
    }

    /// Status of one stage, `None` if it has no row yet.
    #[must_use]
    pub fn stage_status(&self, name: &str) -> Option<ExecutionStatus> {
        self.stage(name).and_then(|s| s.status)
    }
}

fn current_stage(stages: &[StageProgress]) -> Option<String> {
    let first_with = |wanted: ExecutionStatus| {
        stages
            .iter()
            .find(|s| s.status == Some(wanted))
            .map(|s| s.stage_name.clone())
    };
    first_with(ExecutionStatus::Running).or_else(|| first_with(ExecutionStatus::Pending))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::presets;

    fn row(stage: &str, status: ExecutionStatus) -> StageExecution {
        let mut r = StageExecution::pending("d1".into(), stage, Utc::now());
        r.status = status;
        r
    }

    #[test]
    fn test_unregistered_document() {
        let registry = presets::linear(&["a", "b"]).unwrap();
        let view = ProgressView::build(&registry, "d1".into(), &[], Vec::new());
        assert_eq!(view.status, DocumentStatus::NotRegistered);
        assert_eq!(view.overall_percent, 0.0);
        assert_eq!(view.stages.len(), 2);
        assert!(view.current_stage.is_none());
    }

    #[test]
    fn test_partial_progress_and_current_stage() {
        let registry = presets::linear(&["a", "b", "c", "d"]).unwrap();
        let rows = [row("a", ExecutionStatus::Completed), row("b", ExecutionStatus::Running)];
        let view = ProgressView::build(&registry, "d1".into(), &rows, Vec::new());

        assert_eq!(view.status, DocumentStatus::Processing);
        assert_eq!(view.overall_percent, 25.0);
        assert_eq!(view.current_stage.as_deref(), Some("b"));
        assert_eq!(view.stage_status("c"), None);
    }

    #[test]
    fn test_required_failure_blocks() {
        let registry = presets::linear(&["a", "b"]).unwrap();
        let rows = [row("a", ExecutionStatus::Failed)];
        let view = ProgressView::build(&registry, "d1".into(), &rows, Vec::new());

        assert!(view.blocked);
        assert!(view.manual_review_required);
        assert_eq!(view.status, DocumentStatus::Blocked);
        assert!(view.current_stage.is_none());
    }

    #[test]
    fn test_skipped_required_counts_as_done() {
        let registry = presets::linear(&["a", "b"]).unwrap();
        let rows = [row("a", ExecutionStatus::Completed), row("b", ExecutionStatus::Skipped)];
        let view = ProgressView::build(&registry, "d1".into(), &rows, Vec::new());
        assert_eq!(view.status, DocumentStatus::Completed);
        assert_eq!(view.overall_percent, 100.0);
    }
}
