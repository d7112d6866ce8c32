//! Worker pool driving stage handlers.

use super::handler::{HandlerContext, HandlerOutcome, HandlerRegistry, StageHandler};
use super::queue::SchedulingQueue;
use super::shutdown::ShutdownSignal;
use crate::config::SchedulerConfig;
use crate::core::{DocumentId, StageKey};
use crate::errors::{OrchestratorError, OrchestratorResult};
use crate::orchestrator::{AttemptToken, Orchestrator};
use crate::retry::{RetryDecision, StageError};
use chrono::{DateTime, Utc};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

struct Shared {
    orchestrator: Arc<Orchestrator>,
    handlers: HandlerRegistry,
    queue: Arc<SchedulingQueue>,
    config: SchedulerConfig,
    shutdown: ShutdownSignal,
}

/// A fixed set of workers plus the eligibility scan and stale-run reaper.
///
/// Each worker takes a key from the queue, starts the stage, runs its
/// handler and reports the outcome. Stages unlocked by a completion and
/// retries with their backoff are queued again by the worker itself; the
/// periodic scan catches pending rows created elsewhere.
pub struct WorkerPool {
    shared: Arc<Shared>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("tasks", &self.tasks.len())
            .field("queued", &self.shared.queue.len())
            .field("handlers", &self.shared.handlers)
            .finish_non_exhaustive()
    }
}

impl WorkerPool {
    /// Spawns `workers` workers and the background loops.
    ///
    /// Must be called inside a Tokio runtime.
    #[must_use]
    pub fn start(
        orchestrator: Arc<Orchestrator>,
        handlers: HandlerRegistry,
        workers: usize,
        config: SchedulerConfig,
    ) -> Self {
        for def in orchestrator.registry().iter() {
            if !handlers.contains(&def.name) {
                warn!(stage = %def.name, "No handler registered; attempts will fail");
            }
        }

        let shared = Arc::new(Shared {
            orchestrator,
            handlers,
            queue: Arc::new(SchedulingQueue::new()),
            config,
            shutdown: ShutdownSignal::new(),
        });

        let workers = workers.max(1);
        let mut tasks = Vec::with_capacity(workers + 2);
        for id in 0..workers {
            let shared = Arc::clone(&shared);
            tasks.push(tokio::spawn(async move { worker_loop(id, shared).await }));
        }
        {
            let shared = Arc::clone(&shared);
            tasks.push(tokio::spawn(async move { scan_loop(shared).await }));
        }
        {
            let shared = Arc::clone(&shared);
            tasks.push(tokio::spawn(async move { reap_loop(shared).await }));
        }

        info!(workers, "Worker pool started");
        Self { shared, tasks }
    }

    /// Registers a document and queues its root stages.
    ///
    /// # Errors
    ///
    /// Whatever `register_document` returns.
    pub async fn submit(&self, document_id: &DocumentId) -> OrchestratorResult<Vec<String>> {
        let created = self.shared.orchestrator.register_document(document_id).await?;
        for stage in &created {
            self.shared
                .queue
                .push(StageKey::new(document_id.clone(), stage.clone()));
        }
        Ok(created)
    }

    /// Queues a key for immediate dispatch.
    pub fn enqueue(&self, key: StageKey) -> bool {
        self.shared.queue.push(key)
    }

    /// Runs one eligibility scan now. Returns how many keys were queued.
    ///
    /// # Errors
    ///
    /// Backend failures.
    pub async fn scan_now(&self) -> OrchestratorResult<usize> {
        scan_once(&self.shared).await
    }

    /// The queue.
    #[must_use]
    pub fn queue(&self) -> &SchedulingQueue {
        &self.shared.queue
    }

    /// The orchestrator the pool drives.
    #[must_use]
    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.shared.orchestrator
    }

    /// A handle to the pool's shutdown signal.
    #[must_use]
    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shared.shutdown.clone()
    }

    /// Stops taking work, waits for running attempts to finish and joins
    /// every task.
    pub async fn shutdown(self) {
        self.shared.shutdown.trigger();
        self.shared.queue.close();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Worker task ended abnormally");
            }
        }
        info!("Worker pool stopped");
    }
}

async fn worker_loop(id: usize, shared: Arc<Shared>) {
    debug!(worker = id, "Worker started");
    while let Some(key) = shared.queue.pop().await {
        if shared.shutdown.is_triggered() {
            break;
        }
        process(&shared, key).await;
    }
    debug!(worker = id, "Worker stopped");
}

async fn scan_loop(shared: Arc<Shared>) {
    let mut interval = tokio::time::interval(shared.config.scan_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = shared.shutdown.wait() => break,
            _ = interval.tick() => {
                if let Err(e) = scan_once(&shared).await {
                    warn!(error = %e, "Eligibility scan failed");
                }
            }
        }
    }
}

async fn scan_once(shared: &Shared) -> OrchestratorResult<usize> {
    let keys = shared
        .orchestrator
        .startable_stages(shared.config.scan_batch)
        .await?;
    let queued = keys.into_iter().filter(|k| shared.queue.push(k.clone())).count();
    if queued > 0 {
        debug!(queued, "Eligibility scan queued stages");
    }
    Ok(queued)
}

async fn reap_loop(shared: Arc<Shared>) {
    let mut interval = tokio::time::interval(shared.config.reap_interval());
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = shared.shutdown.wait() => break,
            _ = interval.tick() => {
                match shared.orchestrator.reap_stale_running(shared.config.stale_timeout()).await {
                    Ok(reaped) if !reaped.is_empty() => {
                        info!(count = reaped.len(), "Reaped stale running stages");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Stale-run reaper failed"),
                }
            }
        }
    }
}

/// Runs one queued key to the end of its attempt.
async fn process(shared: &Shared, key: StageKey) {
    let orchestrator = &shared.orchestrator;
    let token = match orchestrator.start_stage(&key.document_id, &key.stage_name).await {
        Ok(token) => token,
        Err(OrchestratorError::BackoffNotElapsed { retry_at, .. }) => {
            requeue_at(shared, key, retry_at);
            return;
        }
        Err(e) if e.error_type() == crate::core::ErrorType::DependencyViolation => {
            debug!(key = %key, reason = %e, "Queued stage not startable");
            return;
        }
        Err(e) => {
            warn!(key = %key, error = %e, "Failed to start stage");
            return;
        }
    };

    let result = run_handler(shared, &token).await;
    let reported = match result {
        Ok(HandlerOutcome::Completed { metadata }) => orchestrator
            .complete_stage(&token, metadata)
            .await
            .map(|advance| advance.unlocked),
        Ok(HandlerOutcome::Skipped { reason }) => orchestrator
            .skip_attempt(&token, &reason)
            .await
            .map(|advance| advance.unlocked),
        Err(err) => match orchestrator.fail_stage(&token, err).await {
            Ok(outcome) => {
                if let (RetryDecision::Retry(_), Some(retry_at)) = (outcome.decision, outcome.retry_at) {
                    requeue_at(shared, key.clone(), retry_at);
                }
                Ok(outcome.unlocked)
            }
            Err(e) => Err(e),
        },
    };

    match reported {
        Ok(unlocked) => {
            for stage in unlocked {
                shared
                    .queue
                    .push(StageKey::new(key.document_id.clone(), stage));
            }
        }
        Err(e @ OrchestratorError::StaleToken { .. }) => {
            info!(key = %key, attempt = token.attempt(), reason = %e, "Attempt superseded; outcome discarded");
        }
        Err(e) => warn!(key = %key, attempt = token.attempt(), error = %e, "Failed to report stage outcome"),
    }
}

/// Calls the handler with the configured timeout. Panics and timeouts are
/// turned into stage errors.
async fn run_handler(shared: &Shared, token: &AttemptToken) -> Result<HandlerOutcome, StageError> {
    let Some(handler) = shared.handlers.get(token.stage_name()) else {
        return Err(StageError::validation(format!(
            "No handler registered for stage '{}'",
            token.stage_name()
        )));
    };

    let ctx = match build_context(shared, token).await {
        Ok(ctx) => ctx,
        Err(e) => return Err(StageError::transient(format!("Failed to load stage inputs: {e}"))),
    };

    debug!(document_id = %token.document_id(), stage = token.stage_name(), attempt = token.attempt(), "Running handler");
    let run = invoke(handler.as_ref(), &ctx);
    let result = match shared.config.handler_timeout() {
        Some(limit) => match tokio::time::timeout(limit, run).await {
            Ok(result) => result,
            Err(_) => {
                return Err(StageError::transient(format!(
                    "Handler timed out after {}ms",
                    limit.as_millis()
                ))
                .with_context("timeout_ms", serde_json::json!(millis(limit))));
            }
        },
        None => run.await,
    };

    result.map_err(|err| StageError::from_anyhow(&err))
}

async fn invoke(handler: &dyn StageHandler, ctx: &HandlerContext) -> anyhow::Result<HandlerOutcome> {
    match AssertUnwindSafe(handler.run(ctx)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            error!(stage = ctx.stage_name(), panic = %message, "Stage handler panicked");
            Err(anyhow::Error::new(StageError::new(format!("Handler panicked: {message}"))))
        }
    }
}

async fn build_context(shared: &Shared, token: &AttemptToken) -> OrchestratorResult<HandlerContext> {
    let orchestrator = &shared.orchestrator;
    let metadata = orchestrator
        .get_execution(token.document_id(), token.stage_name())
        .await?
        .map(|row| row.metadata)
        .unwrap_or_default();
    let upstream = orchestrator
        .upstream_metadata(token.document_id(), token.stage_name())
        .await?;
    Ok(HandlerContext::new(
        Arc::clone(orchestrator),
        token.clone(),
        metadata,
        upstream,
    ))
}

fn requeue_at(shared: &Shared, key: StageKey, retry_at: DateTime<Utc>) {
    let delay = (retry_at - shared.orchestrator.clock().now())
        .to_std()
        .unwrap_or(Duration::ZERO);
    debug!(key = %key, delay_ms = millis(delay), "Stage queued for retry");
    shared.queue.push_after(key, delay);
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{DocumentStatus, ErrorType, ExecutionStatus};
    use crate::registry::presets;
    use crate::retry::RetryPolicy;
    use crate::scheduler::handler::MockStageHandler;
    use crate::store::Stores;

    fn fast_config() -> SchedulerConfig {
        SchedulerConfig::default()
            .with_scan_interval_ms(20)
            .with_reap_interval_ms(50)
    }

    async fn wait_for(orchestrator: &Orchestrator, doc: &DocumentId, status: DocumentStatus) {
        for _ in 0..200 {
            if orchestrator.get_document_progress(doc).await.unwrap().status == status {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("document {doc} never reached {status:?}");
    }

    #[tokio::test]
    async fn test_pool_runs_linear_pipeline() {
        let registry = presets::linear(&["a", "b"]).unwrap();
        let orchestrator = Arc::new(Orchestrator::new(registry, Stores::in_memory()));

        let mut a = MockStageHandler::new();
        a.expect_run().times(1).returning(|_| {
            let mut meta = crate::store::Metadata::new();
            meta.insert("pages".into(), 3.into());
            Ok(HandlerOutcome::completed_with(meta))
        });
        let mut b = MockStageHandler::new();
        b.expect_run().times(1).returning(|ctx| {
            assert_eq!(ctx.upstream("a").and_then(|m| m.get("pages")), Some(&serde_json::json!(3)));
            Ok(HandlerOutcome::completed())
        });

        let handlers = HandlerRegistry::new()
            .with_handler("a", Arc::new(a))
            .with_handler("b", Arc::new(b));
        let pool = WorkerPool::start(Arc::clone(&orchestrator), handlers, 2, fast_config());

        let doc = DocumentId::new("doc-1");
        pool.submit(&doc).await.unwrap();
        wait_for(&orchestrator, &doc, DocumentStatus::Completed).await;
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_missing_handler_blocks_document() {
        let registry = presets::linear(&["a"]).unwrap();
        let orchestrator = Arc::new(Orchestrator::new(registry, Stores::in_memory()));
        let pool = WorkerPool::start(Arc::clone(&orchestrator), HandlerRegistry::new(), 1, fast_config());

        let doc = DocumentId::new("doc-1");
        pool.submit(&doc).await.unwrap();
        wait_for(&orchestrator, &doc, DocumentStatus::Blocked).await;

        let errors = orchestrator.document_errors(&doc).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error_type, ErrorType::ValidationFailure);
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_transient_failure_is_retried() {
        let registry = presets::linear(&["a"]).unwrap();
        let orchestrator = Arc::new(Orchestrator::new(registry, Stores::in_memory()));
        orchestrator
            .set_retry_policy(
                "a",
                RetryPolicy::new()
                    .with_backoff_base_ms(10)
                    .with_max_backoff_ms(20)
                    .with_jitter_fraction(0.0),
            )
            .await
            .unwrap();

        let mut a = MockStageHandler::new();
        let mut seq = mockall::Sequence::new();
        a.expect_run()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Err(anyhow::anyhow!("connection reset by peer")));
        a.expect_run()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|ctx| {
                assert_eq!(ctx.attempt(), 2);
                Ok(HandlerOutcome::completed())
            });

        let handlers = HandlerRegistry::new().with_handler("a", Arc::new(a));
        let pool = WorkerPool::start(Arc::clone(&orchestrator), handlers, 1, fast_config());

        let doc = DocumentId::new("doc-1");
        pool.submit(&doc).await.unwrap();
        wait_for(&orchestrator, &doc, DocumentStatus::Completed).await;

        let row = orchestrator.get_execution(&doc, "a").await.unwrap().unwrap();
        assert_eq!(row.status, ExecutionStatus::Completed);
        assert_eq!(row.attempt_count, 2);
        assert!(orchestrator.open_errors().await.unwrap().is_empty());
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_handler_timeout_reports_transient() {
        let registry = presets::linear(&["a"]).unwrap();
        let orchestrator = Arc::new(Orchestrator::new(registry, Stores::in_memory()));
        orchestrator
            .set_retry_policy("a", RetryPolicy::no_retry())
            .await
            .unwrap();

        struct Hang;
        #[async_trait::async_trait]
        impl StageHandler for Hang {
            async fn run(&self, _ctx: &HandlerContext) -> anyhow::Result<HandlerOutcome> {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(HandlerOutcome::completed())
            }
        }

        let handlers = HandlerRegistry::new().with_handler("a", Arc::new(Hang));
        let config = fast_config().with_handler_timeout_ms(30);
        let pool = WorkerPool::start(Arc::clone(&orchestrator), handlers, 1, config);

        let doc = DocumentId::new("doc-1");
        pool.submit(&doc).await.unwrap();
        wait_for(&orchestrator, &doc, DocumentStatus::Blocked).await;

        let errors = orchestrator.document_errors(&doc).await.unwrap();
        assert_eq!(errors[0].error_type, ErrorType::Transient);
        assert!(errors[0].message.contains("timed out"));
        pool.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_joins_idle_pool() {
        let registry = presets::linear(&["a"]).unwrap();
        let orchestrator = Arc::new(Orchestrator::new(registry, Stores::in_memory()));
        let pool = WorkerPool::start(orchestrator, HandlerRegistry::new(), 3, fast_config());
        let signal = pool.shutdown_signal();

        tokio::time::timeout(Duration::from_secs(1), pool.shutdown())
            .await
            .unwrap();
        assert!(signal.is_triggered());
    }
}
