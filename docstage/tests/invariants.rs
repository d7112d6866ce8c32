//! Properties that must hold under any interleaving of operations.

use std::sync::Arc;

use docstage::prelude::*;
use docstage::testing::{assert_markers_consistent, TestHarness};
use pretty_assertions::assert_eq;

/// Drives one document forward with a fixed sequence of outcomes and checks
/// the invariants after every operation.
#[tokio::test]
async fn invariants_hold_along_a_bumpy_run() {
    let h = TestHarness::diamond().unwrap();
    let orch = &h.orchestrator;
    let doc = DocumentId::new("bumpy");
    orch.register_document(&doc).await.unwrap();

    let mut last_percent = 0.0;
    let mut last_attempts: std::collections::HashMap<String, u32> = Default::default();

    let mut check = |view: ProgressView| {
        assert!(
            view.overall_percent >= last_percent,
            "progress went backwards: {} -> {}",
            last_percent,
            view.overall_percent
        );
        last_percent = view.overall_percent;
        for stage in &view.stages {
            let prev = last_attempts.entry(stage.stage_name.clone()).or_default();
            assert!(stage.attempt_count >= *prev, "attempt count of {} decreased", stage.stage_name);
            *prev = stage.attempt_count;
        }
    };

    // a: one transient failure, then success
    let t = orch.start_stage(&doc, "a").await.unwrap();
    orch.fail_stage(&t, StageError::transient("503 from extractor")).await.unwrap();
    check(orch.get_document_progress(&doc).await.unwrap());
    assert_markers_consistent(orch, &doc).await;

    h.clock.advance_ms(1_000);
    let t = orch.start_stage(&doc, "a").await.unwrap();
    orch.update_stage_progress(&t, 50.0, Metadata::new()).await.unwrap();
    check(orch.get_document_progress(&doc).await.unwrap());
    orch.complete_stage(&t, Metadata::new()).await.unwrap();
    check(orch.get_document_progress(&doc).await.unwrap());
    assert_markers_consistent(orch, &doc).await;

    // b: optional, skipped by its handler
    let t = orch.start_stage(&doc, "b").await.unwrap();
    orch.skip_attempt(&t, "no tables").await.unwrap();
    check(orch.get_document_progress(&doc).await.unwrap());

    // c and d: straight through
    for stage in ["c", "d"] {
        let t = orch.start_stage(&doc, stage).await.unwrap();
        orch.complete_stage(&t, Metadata::new()).await.unwrap();
        check(orch.get_document_progress(&doc).await.unwrap());
        assert_markers_consistent(orch, &doc).await;
    }

    assert_eq!(
        orch.get_document_progress(&doc).await.unwrap().status,
        DocumentStatus::Completed
    );
}

#[tokio::test]
async fn terminal_rows_only_leave_through_retry_document() {
    let h = TestHarness::diamond().unwrap();
    let orch = &h.orchestrator;
    let doc = DocumentId::new("terminal");
    orch.register_document(&doc).await.unwrap();
    let t = orch.start_stage(&doc, "a").await.unwrap();
    orch.complete_stage(&t, Metadata::new()).await.unwrap();
    orch.skip_stage(&doc, "b", "operator").await.unwrap();

    for stage in ["a", "b"] {
        assert!(orch.start_stage(&doc, stage).await.is_err());
        assert!(orch.skip_stage(&doc, stage, "again").await.is_err());
    }
    assert!(orch.complete_stage(&t, Metadata::new()).await.is_err());
    assert!(orch.fail_stage(&t, StageError::transient("late")).await.is_err());
    assert_markers_consistent(orch, &doc).await;

    orch.retry_document(&doc, "b").await.unwrap();
    assert!(orch.start_stage(&doc, "b").await.is_ok());
}

#[tokio::test]
async fn double_completion_commits_once() {
    let h = TestHarness::linear().unwrap();
    let orch = &h.orchestrator;
    let doc = DocumentId::new("twice");
    orch.register_document(&doc).await.unwrap();
    let token = orch.start_stage(&doc, "a").await.unwrap();

    let (first, second) = tokio::join!(
        orch.complete_stage(&token, Metadata::new()),
        orch.complete_stage(&token, Metadata::new())
    );
    let results = [first, second];
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results
        .iter()
        .any(|r| matches!(r, Err(OrchestratorError::AlreadyCompleted { .. }))));

    assert_eq!(h.state.marker_count(), 1);
    assert_eq!(h.events.events_of_type("stage.completed").len(), 1);
    // one row for a, one for b: the frontier expanded exactly once
    assert_eq!(h.state.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_starts_across_documents() {
    let h = TestHarness::linear().unwrap();
    let docs: Vec<DocumentId> = (0..8).map(|i| DocumentId::new(format!("race-{i}"))).collect();
    for doc in &docs {
        h.orchestrator.register_document(doc).await.unwrap();
    }

    let mut tasks = Vec::new();
    for doc in &docs {
        for _ in 0..8 {
            let orch = Arc::clone(&h.orchestrator);
            let doc = doc.clone();
            tasks.push(tokio::spawn(async move { (doc.clone(), orch.start_stage(&doc, "a").await) }));
        }
    }

    let mut winners: std::collections::HashMap<DocumentId, usize> = Default::default();
    for task in tasks {
        let (doc, result) = task.await.unwrap();
        match result {
            Ok(_) => *winners.entry(doc).or_default() += 1,
            Err(OrchestratorError::AlreadyRunning { .. }) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(winners.len(), docs.len());
    assert!(winners.values().all(|&n| n == 1));
    assert_eq!(h.events.events_of_type("stage.started").len(), docs.len());
}
