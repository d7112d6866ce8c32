//! Assertions over orchestrator state.

use std::time::Duration;

use crate::core::{DocumentId, DocumentStatus, ExecutionStatus};
use crate::orchestrator::Orchestrator;

/// Asserts the status of one stage row. `None` means no row.
pub async fn assert_stage_status(
    orchestrator: &Orchestrator,
    document_id: &DocumentId,
    stage: &str,
    expected: Option<ExecutionStatus>,
) {
    let actual = orchestrator
        .get_execution(document_id, stage)
        .await
        .unwrap_or_else(|e| panic!("failed to read {document_id}/{stage}: {e}"))
        .map(|row| row.status);
    assert_eq!(
        actual, expected,
        "Expected {document_id}/{stage} to be {expected:?}, got {actual:?}"
    );
}

/// Asserts the document-level status.
pub async fn assert_document_status(
    orchestrator: &Orchestrator,
    document_id: &DocumentId,
    expected: DocumentStatus,
) {
    let view = orchestrator
        .get_document_progress(document_id)
        .await
        .unwrap_or_else(|e| panic!("failed to read progress of {document_id}: {e}"));
    assert_eq!(
        view.status, expected,
        "Expected document {document_id} to be {expected:?}, got {:?} (stages: {:?})",
        view.status,
        view.stages
            .iter()
            .map(|s| (s.stage_name.as_str(), s.status))
            .collect::<Vec<_>>()
    );
}

/// Asserts that every stage of the document has a completion marker exactly
/// when it is completed.
pub async fn assert_markers_consistent(orchestrator: &Orchestrator, document_id: &DocumentId) {
    for stage in orchestrator.registry().topological_order() {
        let row = orchestrator
            .get_execution(document_id, stage)
            .await
            .unwrap_or_else(|e| panic!("failed to read {document_id}/{stage}: {e}"));
        let marker = orchestrator
            .get_marker(document_id, stage)
            .await
            .unwrap_or_else(|e| panic!("failed to read marker of {document_id}/{stage}: {e}"));
        let completed = row.as_ref().is_some_and(|r| r.status == ExecutionStatus::Completed);
        assert_eq!(
            completed,
            marker.is_some(),
            "{document_id}/{stage}: completed={completed} but marker present={}",
            marker.is_some()
        );
    }
}

/// Polls until the document reaches `expected`, panicking after `timeout`.
pub async fn wait_for_document_status(
    orchestrator: &Orchestrator,
    document_id: &DocumentId,
    expected: DocumentStatus,
    timeout: Duration,
) {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let status = orchestrator
            .get_document_progress(document_id)
            .await
            .map(|view| view.status)
            .ok();
        if status == Some(expected) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "document {document_id} did not reach {expected:?} within {timeout:?} (last: {status:?})"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
