//! Canned stage handlers for testing.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::Duration;

use crate::core::{DocumentId, ErrorType};
use crate::retry::StageError;
use crate::scheduler::{HandlerContext, HandlerOutcome, StageHandler};
use crate::store::Metadata;

/// One scripted response.
#[derive(Debug, Clone)]
pub enum Step {
    /// Complete with metadata.
    Complete(Metadata),
    /// Skip with a reason.
    Skip(String),
    /// Fail with an explicitly typed error.
    Fail(ErrorType, String),
    /// Fail with an untyped message, classified by pattern.
    FailMessage(String),
}

/// A handler that replays a script, one step per call.
///
/// Once the script is exhausted every further call completes.
#[derive(Debug, Default)]
pub struct ScriptedHandler {
    steps: Mutex<VecDeque<Step>>,
    calls: Mutex<usize>,
}

impl ScriptedHandler {
    /// Creates a handler that always completes.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a handler from steps.
    #[must_use]
    pub fn from_steps(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into_iter().collect()),
            calls: Mutex::new(0),
        }
    }

    /// Fails `times` times with `error_type`, then completes.
    #[must_use]
    pub fn failing(error_type: ErrorType, times: usize) -> Self {
        Self::from_steps(
            (1..=times).map(|n| Step::Fail(error_type, format!("scripted {error_type} failure #{n}"))),
        )
    }

    /// Appends a step.
    pub fn push(&self, step: Step) {
        self.steps.lock().push_back(step);
    }

    /// Number of calls so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        *self.calls.lock()
    }
}

#[async_trait]
impl StageHandler for ScriptedHandler {
    async fn run(&self, _ctx: &HandlerContext) -> anyhow::Result<HandlerOutcome> {
        *self.calls.lock() += 1;
        let step = self.steps.lock().pop_front();
        match step {
            None => Ok(HandlerOutcome::completed()),
            Some(Step::Complete(metadata)) => Ok(HandlerOutcome::completed_with(metadata)),
            Some(Step::Skip(reason)) => Ok(HandlerOutcome::skipped(reason)),
            Some(Step::Fail(kind, message)) => Err(StageError::new(message).with_kind(kind).into()),
            Some(Step::FailMessage(message)) => Err(anyhow::anyhow!(message)),
        }
    }
}

/// One observed handler call.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    /// The document.
    pub document_id: DocumentId,
    /// The stage.
    pub stage_name: String,
    /// The attempt number.
    pub attempt: u32,
    /// Names of upstream stages whose metadata was visible.
    pub upstream: Vec<String>,
}

/// A handler that records every call and completes, echoing its stage name
/// into the output metadata.
#[derive(Debug, Default)]
pub struct RecordingHandler {
    calls: Mutex<Vec<RecordedCall>>,
}

impl RecordingHandler {
    /// Creates a recording handler.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// All calls so far.
    #[must_use]
    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Number of calls so far.
    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl StageHandler for RecordingHandler {
    async fn run(&self, ctx: &HandlerContext) -> anyhow::Result<HandlerOutcome> {
        let mut upstream: Vec<String> = ctx.upstream_all().keys().cloned().collect();
        upstream.sort();
        self.calls.lock().push(RecordedCall {
            document_id: ctx.document_id().clone(),
            stage_name: ctx.stage_name().to_string(),
            attempt: ctx.attempt(),
            upstream,
        });

        let mut metadata = Metadata::new();
        metadata.insert("produced_by".into(), ctx.stage_name().into());
        Ok(HandlerOutcome::completed_with(metadata))
    }
}

/// A handler that reports progress while sleeping, then completes.
#[derive(Debug)]
pub struct SlowHandler {
    delay: Duration,
    steps: u32,
}

impl SlowHandler {
    /// Creates a handler that takes `delay` in `steps` progress updates.
    #[must_use]
    pub fn new(delay: Duration, steps: u32) -> Self {
        Self {
            delay,
            steps: steps.max(1),
        }
    }
}

#[async_trait]
impl StageHandler for SlowHandler {
    async fn run(&self, ctx: &HandlerContext) -> anyhow::Result<HandlerOutcome> {
        let slice = self.delay / self.steps;
        for step in 1..=self.steps {
            tokio::time::sleep(slice).await;
            let percent = f64::from(step) / f64::from(self.steps) * 100.0;
            ctx.report_progress(percent.min(99.0), Metadata::new()).await?;
        }
        Ok(HandlerOutcome::completed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::orchestrator::Orchestrator;
    use crate::registry::presets;
    use crate::store::Stores;
    use std::collections::HashMap;
    use std::sync::Arc;

    async fn context() -> HandlerContext {
        let orchestrator = Arc::new(Orchestrator::new(
            presets::linear(&["a"]).unwrap(),
            Stores::in_memory(),
        ));
        let doc = DocumentId::new("d1");
        orchestrator.register_document(&doc).await.unwrap();
        let token = orchestrator.start_stage(&doc, "a").await.unwrap();
        HandlerContext::new(orchestrator, token, Metadata::new(), HashMap::new())
    }

    #[tokio::test]
    async fn test_scripted_handler_replays_steps() {
        let ctx = context().await;
        let handler = ScriptedHandler::failing(ErrorType::Transient, 1);
        handler.push(Step::Skip("empty".into()));

        let err = handler.run(&ctx).await.unwrap_err();
        assert_eq!(StageError::from_anyhow(&err).kind, Some(ErrorType::Transient));
        assert_eq!(handler.run(&ctx).await.unwrap(), HandlerOutcome::skipped("empty"));
        assert_eq!(handler.run(&ctx).await.unwrap(), HandlerOutcome::completed());
        assert_eq!(handler.call_count(), 3);
    }

    #[tokio::test]
    async fn test_recording_handler_echoes_stage() {
        let ctx = context().await;
        let handler = RecordingHandler::new();
        let outcome = handler.run(&ctx).await.unwrap();

        let HandlerOutcome::Completed { metadata } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(metadata.get("produced_by"), Some(&serde_json::json!("a")));
        assert_eq!(handler.calls()[0].attempt, 1);
    }
}
