//! The stage tracker state machine.

use super::locks::KeyLocks;
use super::progress::ProgressView;
use super::stats::{self, StageStatistics};
use super::token::AttemptToken;
use crate::core::{DocumentId, ErrorStatus, ErrorType, ExecutionStatus, Severity, StageKey};
use crate::errors::{OrchestratorError, OrchestratorResult};
use crate::events::{EventSink, NoOpEventSink, PipelineEvent};
use crate::registry::{StageDefinition, StageRegistry};
use crate::retry::{classify, RetryDecision, RetryEvaluator, RetryPolicy, StageError, TerminationReason};
use crate::store::{
    CompletionMarker, MarkerChange, Metadata, PipelineError, PipelineErrorLog, StageExecution,
    StageStateStore, Stores,
};
use crate::utils::{Clock, SystemClock};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Metadata key under which skip reasons are stored.
pub const SKIP_REASON_KEY: &str = "skip_reason";

/// Swaps tried per stage by `retry_document` before giving up.
const RESET_ATTEMPTS: usize = 3;

enum ResetOutcome {
    Reset,
    Missing,
    Contended,
}

/// Result of a reported failure.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureOutcome {
    /// The recorded pipeline error.
    pub error_id: Uuid,
    /// Classification of the failure.
    pub error_type: ErrorType,
    /// What the evaluator decided.
    pub decision: RetryDecision,
    /// When the retry becomes eligible.
    pub retry_at: Option<DateTime<Utc>>,
    /// True if the document is now blocked.
    pub blocked: bool,
    /// Stages that became startable (optional terminal failures only).
    pub unlocked: Vec<String>,
}

/// Result of a completion or skip.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Advance {
    /// Stages that are pending with every dependency satisfied.
    pub unlocked: Vec<String>,
}

/// Answer of [`Orchestrator::can_start_stage`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartCheck {
    /// Whether `start_stage` would succeed now.
    pub allowed: bool,
    /// Human-readable reason.
    pub reason: String,
    /// Taxonomy of the refusal, if any.
    pub error_type: Option<ErrorType>,
}

/// Tracks stage executions of documents and enforces legal transitions.
///
/// Every operation that mutates a (document, stage) row holds that key's
/// async lock and commits through the store's compare-and-swap before
/// returning.
pub struct Orchestrator {
    registry: Arc<StageRegistry>,
    state: Arc<dyn StageStateStore>,
    errors: Arc<dyn PipelineErrorLog>,
    evaluator: RetryEvaluator,
    events: Arc<dyn EventSink>,
    clock: Arc<dyn Clock>,
    locks: KeyLocks,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("stages", &self.registry.topological_order())
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl Orchestrator {
    /// Creates an orchestrator over a registry and stores.
    #[must_use]
    pub fn new(registry: StageRegistry, stores: Stores) -> Self {
        Self {
            registry: Arc::new(registry),
            state: stores.state,
            errors: stores.errors,
            evaluator: RetryEvaluator::new(),
            events: Arc::new(NoOpEventSink),
            clock: Arc::new(SystemClock),
            locks: KeyLocks::new(),
        }
    }

    /// Sets the event sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.events = sink;
        self
    }

    /// Sets the clock.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Sets the retry evaluator.
    #[must_use]
    pub fn with_evaluator(mut self, evaluator: RetryEvaluator) -> Self {
        self.evaluator = evaluator;
        self
    }

    /// The stage graph.
    #[must_use]
    pub fn registry(&self) -> &StageRegistry {
        &self.registry
    }

    /// The clock used for all timestamps.
    #[must_use]
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    // -- registration -------------------------------------------------------

    /// Creates pending rows for every dependency-free stage.
    ///
    /// Idempotent: returns only the stages created by this call.
    ///
    /// # Errors
    ///
    /// Rejects blank document ids.
    pub async fn register_document(&self, document_id: &DocumentId) -> OrchestratorResult<Vec<String>> {
        validate_document_id(document_id)?;
        let now = self.clock.now();

        let mut created = Vec::new();
        for def in self.registry.root_stages() {
            let row = StageExecution::pending(document_id.clone(), def.name.clone(), now);
            if self.state.insert_if_absent(row).await? {
                created.push(def.name.clone());
            }
        }

        if created.is_empty() {
            debug!(%document_id, "Document already registered");
        } else {
            info!(%document_id, stages = ?created, "Document registered");
            self.emit(PipelineEvent::DocumentRegistered {
                document_id: document_id.clone(),
                stages: created.clone(),
            })
            .await;
        }
        Ok(created)
    }

    // -- start --------------------------------------------------------------

    /// Reports whether `start_stage` would succeed now, without side effects.
    ///
    /// # Errors
    ///
    /// Only for invalid input or backend failures; refusals are reported in
    /// the returned [`StartCheck`].
    pub async fn can_start_stage(&self, document_id: &DocumentId, stage: &str) -> OrchestratorResult<StartCheck> {
        validate_document_id(document_id)?;
        self.definition(stage)?;
        let rows = self.rows_by_stage(document_id).await?;

        match self.check_start(document_id, stage, &rows, self.clock.now()) {
            Ok(_) => Ok(StartCheck {
                allowed: true,
                reason: "eligible".to_string(),
                error_type: None,
            }),
            Err(err) => Ok(StartCheck {
                allowed: false,
                reason: err.to_string(),
                error_type: Some(err.error_type()),
            }),
        }
    }

    /// Moves a pending stage to running and hands out the attempt token.
    ///
    /// # Errors
    ///
    /// `AlreadyRunning`, `AlreadyCompleted`, `DependencyNotMet`,
    /// `BackoffNotElapsed`, `DocumentBlocked`, `StageNotEligible` or
    /// `InvalidTransition` when the stage may not start.
    pub async fn start_stage(&self, document_id: &DocumentId, stage: &str) -> OrchestratorResult<AttemptToken> {
        validate_document_id(document_id)?;
        self.definition(stage)?;
        let key = StageKey::new(document_id.clone(), stage);
        let _guard = self.locks.lock(&key).await;

        let rows = self.rows_by_stage(document_id).await?;
        let now = self.clock.now();
        let current = self.check_start(document_id, stage, &rows, now)?;

        let attempt = current.attempt_count + 1;
        let token_id = Uuid::new_v4();
        let mut next = current.clone();
        next.status = ExecutionStatus::Running;
        next.attempt_count = attempt;
        next.progress_percent = 0.0;
        next.started_at = Some(now);
        next.completed_at = None;
        next.next_retry_at = None;
        next.attempt_token = Some(token_id);
        next.updated_at = now;

        if !self
            .state
            .compare_and_swap(&current, next, MarkerChange::Keep)
            .await?
        {
            return Err(self.lost_race(&key, &current).await);
        }

        info!(%document_id, stage, attempt, "Stage started");
        self.emit(PipelineEvent::StageStarted {
            document_id: document_id.clone(),
            stage: stage.to_string(),
            attempt,
        })
        .await;

        Ok(AttemptToken::new(document_id.clone(), stage.to_string(), attempt, token_id))
    }

    // -- running attempt ----------------------------------------------------

    /// Records handler progress. Caller metadata keys overwrite stored ones.
    ///
    /// # Errors
    ///
    /// `InvalidProgress` outside 0..=100, `StaleToken` if the attempt no
    /// longer owns the row.
    pub async fn update_stage_progress(
        &self,
        token: &AttemptToken,
        percent: f64,
        metadata: Metadata,
    ) -> OrchestratorResult<()> {
        if !percent.is_finite() || !(0.0..=100.0).contains(&percent) {
            return Err(OrchestratorError::InvalidProgress(percent));
        }
        let key = token.key();
        let _guard = self.locks.lock(&key).await;
        let current = self.owned_running(token, ExecutionStatus::Running).await?;

        let mut next = current.clone();
        next.progress_percent = percent;
        next.metadata.extend(metadata);
        next.updated_at = self.clock.now();

        if !self
            .state
            .compare_and_swap(&current, next, MarkerChange::Keep)
            .await?
        {
            return Err(self.lost_race(&key, &current).await);
        }
        debug!(document_id = %token.document_id(), stage = token.stage_name(), percent, "Stage progress");
        Ok(())
    }

    /// Commits a running attempt.
    ///
    /// Writes the completion marker, resolves the key's open errors and
    /// creates pending rows for successors whose dependencies are now met.
    ///
    /// # Errors
    ///
    /// `AlreadyCompleted` if this token already completed the stage,
    /// `StaleToken` if another attempt owns the row.
    pub async fn complete_stage(&self, token: &AttemptToken, metadata: Metadata) -> OrchestratorResult<Advance> {
        let key = token.key();
        let _guard = self.locks.lock(&key).await;
        let current = self.owned_running(token, ExecutionStatus::Completed).await?;
        let now = self.clock.now();

        let mut next = current.clone();
        next.status = ExecutionStatus::Completed;
        next.progress_percent = 100.0;
        next.completed_at = Some(now);
        next.next_retry_at = None;
        next.metadata.extend(metadata);
        next.updated_at = now;
        let duration_ms = next.duration().map(|d| d.num_milliseconds());

        let marker = CompletionMarker {
            document_id: key.document_id.clone(),
            stage_name: key.stage_name.clone(),
            attempt: current.attempt_count,
            committed_at: now,
        };
        if !self
            .state
            .compare_and_swap(&current, next, MarkerChange::Write(marker))
            .await?
        {
            return Err(self.lost_race(&key, &current).await);
        }

        let resolved = self
            .errors
            .resolve_open(&key, &format!("Resolved by successful attempt {}", current.attempt_count), now)
            .await?;
        let unlocked = self.expand_frontier(&key.document_id, &key.stage_name).await?;

        info!(
            document_id = %key.document_id,
            stage = %key.stage_name,
            attempt = current.attempt_count,
            resolved_errors = resolved,
            unlocked = ?unlocked,
            "Stage completed"
        );
        self.emit(PipelineEvent::StageCompleted {
            document_id: key.document_id.clone(),
            stage: key.stage_name.clone(),
            attempt: current.attempt_count,
            duration_ms,
            unlocked: unlocked.clone(),
        })
        .await;

        Ok(Advance { unlocked })
    }

    /// Records a failed attempt and either schedules a retry or fails the stage.
    ///
    /// # Errors
    ///
    /// `StaleToken` if the attempt no longer owns the row.
    pub async fn fail_stage(&self, token: &AttemptToken, error: StageError) -> OrchestratorResult<FailureOutcome> {
        let key = token.key();
        let _guard = self.locks.lock(&key).await;
        let current = self.owned_running(token, ExecutionStatus::Failed).await?;
        self.fail_locked(current, error).await
    }

    /// Ends a running attempt as skipped, on the handler's request.
    ///
    /// # Errors
    ///
    /// `StaleToken` if the attempt no longer owns the row.
    pub async fn skip_attempt(&self, token: &AttemptToken, reason: &str) -> OrchestratorResult<Advance> {
        let key = token.key();
        let _guard = self.locks.lock(&key).await;
        let current = self.owned_running(token, ExecutionStatus::Skipped).await?;
        self.skip_locked(current, reason).await
    }

    // -- operator actions ---------------------------------------------------

    /// Skips a pending stage. Downstream stages treat it as satisfied.
    ///
    /// # Errors
    ///
    /// `StageNotEligible` if the stage has no row, `InvalidTransition`
    /// unless it is pending.
    pub async fn skip_stage(&self, document_id: &DocumentId, stage: &str, reason: &str) -> OrchestratorResult<Advance> {
        validate_document_id(document_id)?;
        self.definition(stage)?;
        let key = StageKey::new(document_id.clone(), stage);
        let _guard = self.locks.lock(&key).await;

        let current = self
            .state
            .get_execution(&key)
            .await?
            .ok_or_else(|| OrchestratorError::StageNotEligible {
                document_id: document_id.clone(),
                stage: stage.to_string(),
            })?;
        if current.status != ExecutionStatus::Pending {
            return Err(OrchestratorError::InvalidTransition {
                document_id: document_id.clone(),
                stage: stage.to_string(),
                from: current.status,
                to: ExecutionStatus::Skipped,
            });
        }
        self.skip_locked(current, reason).await
    }

    /// Resets `from_stage` and its transitive dependents for another run.
    ///
    /// Rows go back to pending with zero attempts, completion markers are
    /// deleted and open errors of the reset stages are resolved. Stages
    /// outside the dependent set are untouched. Returns the reset stages in
    /// graph order.
    ///
    /// A stage whose reset loses against another writer is re-read and reset
    /// again. If it keeps losing, `PartialReset` reports which stages were
    /// reset and which were left as they were.
    ///
    /// # Errors
    ///
    /// `NotTerminal` unless `from_stage` is completed, failed or skipped,
    /// `PartialReset` as above.
    pub async fn retry_document(&self, document_id: &DocumentId, from_stage: &str) -> OrchestratorResult<Vec<String>> {
        validate_document_id(document_id)?;
        self.definition(from_stage)?;
        let rows = self.rows_by_stage(document_id).await?;
        if rows.is_empty() {
            return Err(OrchestratorError::DocumentNotRegistered(document_id.clone()));
        }
        let origin = rows
            .get(from_stage)
            .ok_or_else(|| OrchestratorError::StageNotEligible {
                document_id: document_id.clone(),
                stage: from_stage.to_string(),
            })?;
        if !origin.status.is_terminal() {
            return Err(OrchestratorError::NotTerminal {
                document_id: document_id.clone(),
                stage: from_stage.to_string(),
                status: origin.status,
            });
        }

        let targets: Vec<String> = std::iter::once(from_stage.to_string())
            .chain(self.registry.transitive_dependents(from_stage))
            .filter(|s| rows.contains_key(s.as_str()))
            .collect();

        let note = format!("Reset by retry from stage '{from_stage}'");
        let mut reset = Vec::with_capacity(targets.len());
        for (position, stage) in targets.iter().enumerate() {
            let key = StageKey::new(document_id.clone(), stage.clone());
            let _guard = self.locks.lock(&key).await;
            match self.reset_locked(&key, &note).await? {
                ResetOutcome::Reset => reset.push(stage.clone()),
                ResetOutcome::Missing => {}
                ResetOutcome::Contended => {
                    warn!(%document_id, stage = %stage, reset = ?reset, "Retry stopped by concurrent writers");
                    return Err(OrchestratorError::PartialReset {
                        document_id: document_id.clone(),
                        stage: stage.clone(),
                        reset,
                        remaining: targets[position..].to_vec(),
                    });
                }
            }
        }

        info!(%document_id, from_stage, reset = ?reset, "Document retried");
        self.emit(PipelineEvent::DocumentRetried {
            document_id: document_id.clone(),
            from_stage: from_stage.to_string(),
            reset: reset.clone(),
        })
        .await;
        Ok(reset)
    }

    /// Fails running attempts that started more than `timeout` ago.
    ///
    /// Each is routed through the failure path as `Transient`, so it is
    /// retried or failed according to its policy. Returns the reaped keys.
    ///
    /// # Errors
    ///
    /// Backend failures only; attempts that finish concurrently are skipped.
    pub async fn reap_stale_running(&self, timeout: Duration) -> OrchestratorResult<Vec<StageKey>> {
        let now = self.clock.now();
        let Some(cutoff) = chrono::Duration::from_std(timeout)
            .ok()
            .and_then(|t| now.checked_sub_signed(t))
        else {
            return Ok(Vec::new());
        };
        let stale = self.state.list_running_started_before(cutoff).await?;

        let mut reaped = Vec::new();
        for row in stale {
            let key = row.key();
            let _guard = self.locks.lock(&key).await;
            let Some(current) = self.state.get_execution(&key).await? else {
                continue;
            };
            let still_stale = current.status == ExecutionStatus::Running
                && current.started_at.is_some_and(|s| s < cutoff)
                && current.attempt_count == row.attempt_count;
            if !still_stale {
                debug!(key = %key, "Stale candidate moved on before reaping");
                continue;
            }

            let running_for_ms = current
                .started_at
                .map_or(0, |s| (now - s).num_milliseconds());
            let attempt = current.attempt_count;
            let error = StageError::transient(format!(
                "Attempt {attempt} ran for {}s, exceeding the {}s timeout; worker presumed lost",
                running_for_ms / 1000,
                timeout.as_secs()
            ))
            .with_context("reaped", serde_json::Value::Bool(true));

            warn!(document_id = %key.document_id, stage = %key.stage_name, attempt, running_for_ms, "Reaping stale running stage");
            self.emit(PipelineEvent::StageReaped {
                document_id: key.document_id.clone(),
                stage: key.stage_name.clone(),
                attempt,
                running_for_ms,
            })
            .await;
            self.fail_locked(current, error).await?;
            reaped.push(key);
        }

        self.locks.prune();
        Ok(reaped)
    }

    /// Deletes every row, marker and error of a document. Returns the number
    /// of stage rows removed.
    ///
    /// # Errors
    ///
    /// Backend failures.
    pub async fn delete_document(&self, document_id: &DocumentId) -> OrchestratorResult<usize> {
        validate_document_id(document_id)?;
        let removed = self.state.delete_document(document_id).await?;
        let errors = self.errors.delete_document(document_id).await?;
        self.locks.forget_document(document_id);
        info!(%document_id, rows = removed, errors, "Document deleted");
        Ok(removed)
    }

    /// Resolves one pipeline error.
    ///
    /// # Errors
    ///
    /// `ErrorNotFound` for unknown ids.
    pub async fn resolve_error(&self, error_id: Uuid, notes: &str) -> OrchestratorResult<PipelineError> {
        let resolved = self
            .errors
            .resolve(error_id, notes, self.clock.now())
            .await?
            .ok_or(OrchestratorError::ErrorNotFound(error_id))?;
        info!(%error_id, document_id = %resolved.document_id, stage = %resolved.stage_name, "Pipeline error resolved");
        Ok(resolved)
    }

    /// Stores a retry policy override for a stage.
    ///
    /// # Errors
    ///
    /// `UnknownStage`, or `Config` if the policy is out of range.
    pub async fn set_retry_policy(&self, stage: &str, policy: RetryPolicy) -> OrchestratorResult<()> {
        self.definition(stage)?;
        policy.validate()?;
        self.state.put_retry_policy(stage, &policy).await?;
        info!(stage, max_attempts = policy.max_attempts, "Retry policy override stored");
        Ok(())
    }

    /// The policy in effect for a stage: the stored override, else the
    /// registry default.
    ///
    /// # Errors
    ///
    /// `UnknownStage` or backend failures.
    pub async fn retry_policy(&self, stage: &str) -> OrchestratorResult<RetryPolicy> {
        let def = self.definition(stage)?;
        Ok(self
            .state
            .get_retry_policy(stage)
            .await?
            .unwrap_or_else(|| def.default_retry_policy.clone()))
    }

    // -- reads --------------------------------------------------------------

    /// Progress of a document, derived from its rows.
    ///
    /// Unknown documents yield a view with status `NotRegistered`.
    ///
    /// # Errors
    ///
    /// Blank ids and backend failures.
    pub async fn get_document_progress(&self, document_id: &DocumentId) -> OrchestratorResult<ProgressView> {
        validate_document_id(document_id)?;
        let rows = self.state.list_executions(document_id).await?;
        let errors = self.errors.list_for_document(document_id).await?;
        Ok(ProgressView::build(&self.registry, document_id.clone(), &rows, errors))
    }

    /// The stage the document is working on, if any.
    ///
    /// # Errors
    ///
    /// Blank ids and backend failures.
    pub async fn get_current_stage(&self, document_id: &DocumentId) -> OrchestratorResult<Option<String>> {
        Ok(self.get_document_progress(document_id).await?.current_stage)
    }

    /// One stage row.
    ///
    /// # Errors
    ///
    /// Backend failures.
    pub async fn get_execution(&self, document_id: &DocumentId, stage: &str) -> OrchestratorResult<Option<StageExecution>> {
        Ok(self
            .state
            .get_execution(&StageKey::new(document_id.clone(), stage))
            .await?)
    }

    /// Completion marker of one stage.
    ///
    /// # Errors
    ///
    /// Backend failures.
    pub async fn get_marker(&self, document_id: &DocumentId, stage: &str) -> OrchestratorResult<Option<CompletionMarker>> {
        Ok(self
            .state
            .get_marker(&StageKey::new(document_id.clone(), stage))
            .await?)
    }

    /// All pipeline errors of a document, oldest first.
    ///
    /// # Errors
    ///
    /// Backend failures.
    pub async fn document_errors(&self, document_id: &DocumentId) -> OrchestratorResult<Vec<PipelineError>> {
        Ok(self.errors.list_for_document(document_id).await?)
    }

    /// Every open pipeline error, oldest first.
    ///
    /// # Errors
    ///
    /// Backend failures.
    pub async fn open_errors(&self) -> OrchestratorResult<Vec<PipelineError>> {
        Ok(self.errors.list_open().await?)
    }

    /// Counts and durations per stage across all documents.
    ///
    /// # Errors
    ///
    /// Backend failures.
    pub async fn stage_statistics(&self) -> OrchestratorResult<Vec<StageStatistics>> {
        let mut rows = Vec::new();
        for status in [
            ExecutionStatus::Pending,
            ExecutionStatus::Running,
            ExecutionStatus::Completed,
            ExecutionStatus::Failed,
            ExecutionStatus::Skipped,
        ] {
            rows.extend(self.state.list_by_status(status).await?);
        }
        Ok(stats::compute(&self.registry, &rows))
    }

    /// Pending rows whose backoff has elapsed and that could start now.
    ///
    /// Due rows are paged oldest first until `limit` startable keys are found
    /// or the due set runs out, so rows that cannot start (a branch of a
    /// blocked document, a dependent whose upstream is still pending) never
    /// hide newer work behind them.
    ///
    /// # Errors
    ///
    /// Backend failures.
    pub async fn startable_stages(&self, limit: usize) -> OrchestratorResult<Vec<StageKey>> {
        let now = self.clock.now();
        let page_size = limit.max(1);
        let mut by_document: HashMap<DocumentId, HashMap<String, StageExecution>> = HashMap::new();
        let mut startable = Vec::new();
        let mut offset = 0;

        while startable.len() < limit {
            let due = self.state.list_due_pending(now, offset, page_size).await?;
            let fetched = due.len();
            for row in due {
                if !by_document.contains_key(&row.document_id) {
                    let rows = self.rows_by_stage(&row.document_id).await?;
                    by_document.insert(row.document_id.clone(), rows);
                }
                let Some(rows) = by_document.get(&row.document_id) else {
                    continue;
                };
                if self.check_start(&row.document_id, &row.stage_name, rows, now).is_ok() {
                    startable.push(row.key());
                    if startable.len() == limit {
                        break;
                    }
                }
            }
            if fetched < page_size {
                break;
            }
            offset += fetched;
        }
        if offset > 0 {
            debug!(scanned = offset, found = startable.len(), "Paged past unstartable rows");
        }
        Ok(startable)
    }

    /// Metadata of the completed direct dependencies of a stage.
    ///
    /// # Errors
    ///
    /// `UnknownStage` or backend failures.
    pub async fn upstream_metadata(&self, document_id: &DocumentId, stage: &str) -> OrchestratorResult<HashMap<String, Metadata>> {
        let def = self.definition(stage)?;
        let rows = self.rows_by_stage(document_id).await?;
        Ok(def
            .depends_on
            .iter()
            .filter_map(|dep| rows.get(dep))
            .filter(|r| r.status == ExecutionStatus::Completed)
            .map(|r| (r.stage_name.clone(), r.metadata.clone()))
            .collect())
    }

    // -- internals ----------------------------------------------------------

    fn definition(&self, stage: &str) -> OrchestratorResult<&StageDefinition> {
        self.registry
            .get(stage)
            .ok_or_else(|| OrchestratorError::UnknownStage(stage.to_string()))
    }

    async fn rows_by_stage(&self, document_id: &DocumentId) -> OrchestratorResult<HashMap<String, StageExecution>> {
        Ok(self
            .state
            .list_executions(document_id)
            .await?
            .into_iter()
            .map(|r| (r.stage_name.clone(), r))
            .collect())
    }

    /// True if some required stage failed terminally.
    fn is_blocked(&self, rows: &HashMap<String, StageExecution>) -> bool {
        rows.values().any(|r| {
            r.status == ExecutionStatus::Failed && self.registry.get(&r.stage_name).is_some_and(|d| d.required)
        })
    }

    /// Completed and skipped satisfy dependents; so does a terminally
    /// failed optional stage.
    fn satisfies(&self, row: &StageExecution) -> bool {
        row.status.satisfies_dependency()
            || (row.status == ExecutionStatus::Failed
                && self.registry.get(&row.stage_name).is_some_and(|d| !d.required))
    }

    fn unmet_dependencies(&self, def: &StageDefinition, rows: &HashMap<String, StageExecution>) -> Vec<String> {
        def.depends_on
            .iter()
            .filter(|dep| !rows.get(dep.as_str()).is_some_and(|r| self.satisfies(r)))
            .cloned()
            .collect()
    }

    fn check_start(
        &self,
        document_id: &DocumentId,
        stage: &str,
        rows: &HashMap<String, StageExecution>,
        now: DateTime<Utc>,
    ) -> OrchestratorResult<StageExecution> {
        let def = self.definition(stage)?;
        if rows.is_empty() {
            return Err(OrchestratorError::DocumentNotRegistered(document_id.clone()));
        }
        let Some(row) = rows.get(stage) else {
            let missing = self.unmet_dependencies(def, rows);
            if missing.is_empty() {
                return Err(OrchestratorError::StageNotEligible {
                    document_id: document_id.clone(),
                    stage: stage.to_string(),
                });
            }
            return Err(OrchestratorError::DependencyNotMet {
                document_id: document_id.clone(),
                stage: stage.to_string(),
                missing,
            });
        };

        match row.status {
            ExecutionStatus::Pending => {}
            ExecutionStatus::Running => {
                return Err(OrchestratorError::AlreadyRunning {
                    document_id: document_id.clone(),
                    stage: stage.to_string(),
                    attempt: row.attempt_count,
                })
            }
            ExecutionStatus::Completed => {
                return Err(OrchestratorError::AlreadyCompleted {
                    document_id: document_id.clone(),
                    stage: stage.to_string(),
                })
            }
            status @ (ExecutionStatus::Failed | ExecutionStatus::Skipped) => {
                return Err(OrchestratorError::InvalidTransition {
                    document_id: document_id.clone(),
                    stage: stage.to_string(),
                    from: status,
                    to: ExecutionStatus::Running,
                })
            }
        }

        if self.is_blocked(rows) {
            return Err(OrchestratorError::DocumentBlocked(document_id.clone()));
        }

        let missing = self.unmet_dependencies(def, rows);
        if !missing.is_empty() {
            return Err(OrchestratorError::DependencyNotMet {
                document_id: document_id.clone(),
                stage: stage.to_string(),
                missing,
            });
        }

        if let Some(retry_at) = row.next_retry_at.filter(|at| *at > now) {
            return Err(OrchestratorError::BackoffNotElapsed {
                document_id: document_id.clone(),
                stage: stage.to_string(),
                retry_at,
            });
        }

        Ok(row.clone())
    }

    /// Loads the row a token owns. `intended` names the transition the
    /// caller wants, for error reporting.
    async fn owned_running(&self, token: &AttemptToken, intended: ExecutionStatus) -> OrchestratorResult<StageExecution> {
        let key = token.key();
        let row = self
            .state
            .get_execution(&key)
            .await?
            .ok_or_else(|| OrchestratorError::StageNotEligible {
                document_id: key.document_id.clone(),
                stage: key.stage_name.clone(),
            })?;

        let owns = row.attempt_token == Some(token.token_id()) && row.attempt_count == token.attempt();
        if !owns {
            return Err(OrchestratorError::StaleToken {
                document_id: key.document_id,
                stage: key.stage_name,
                attempt: token.attempt(),
            });
        }

        match row.status {
            ExecutionStatus::Running => Ok(row),
            ExecutionStatus::Completed => Err(OrchestratorError::AlreadyCompleted {
                document_id: key.document_id,
                stage: key.stage_name,
            }),
            from => Err(OrchestratorError::InvalidTransition {
                document_id: key.document_id,
                stage: key.stage_name,
                from,
                to: intended,
            }),
        }
    }

    /// Maps a failed compare-and-swap onto the most precise error.
    /// `expected` is the row the caller tried to replace.
    async fn lost_race(&self, key: &StageKey, expected: &StageExecution) -> OrchestratorError {
        match self.state.get_execution(key).await {
            Ok(Some(row)) if expected.attempt_token.is_some() && row.attempt_token != expected.attempt_token => {
                OrchestratorError::StaleToken {
                    document_id: key.document_id.clone(),
                    stage: key.stage_name.clone(),
                    attempt: expected.attempt_count,
                }
            }
            Ok(Some(row)) if row.status == ExecutionStatus::Running => OrchestratorError::AlreadyRunning {
                document_id: key.document_id.clone(),
                stage: key.stage_name.clone(),
                attempt: row.attempt_count,
            },
            Ok(Some(row)) if row.status == ExecutionStatus::Completed => OrchestratorError::AlreadyCompleted {
                document_id: key.document_id.clone(),
                stage: key.stage_name.clone(),
            },
            Ok(_) => OrchestratorError::Conflict {
                document_id: key.document_id.clone(),
                stage: key.stage_name.clone(),
            },
            Err(e) => OrchestratorError::Store(e),
        }
    }

    /// Resets one row to pending, re-reading it when another writer wins the
    /// swap. The caller holds the key lock.
    async fn reset_locked(&self, key: &StageKey, note: &str) -> OrchestratorResult<ResetOutcome> {
        for _ in 0..RESET_ATTEMPTS {
            let Some(current) = self.state.get_execution(key).await? else {
                return Ok(ResetOutcome::Missing);
            };
            if current.status == ExecutionStatus::Running {
                warn!(
                    document_id = %key.document_id,
                    stage = %key.stage_name,
                    attempt = current.attempt_count,
                    "Resetting a running stage; its attempt token is now stale"
                );
            }
            let now = self.clock.now();
            let fresh = current.reset(now);
            if self.state.compare_and_swap(&current, fresh, MarkerChange::Remove).await? {
                self.errors.resolve_open(key, note, now).await?;
                return Ok(ResetOutcome::Reset);
            }
            debug!(document_id = %key.document_id, stage = %key.stage_name, "Reset lost a swap, re-reading");
        }
        Ok(ResetOutcome::Contended)
    }

    async fn policy_for(&self, def: &StageDefinition) -> OrchestratorResult<RetryPolicy> {
        Ok(self
            .state
            .get_retry_policy(&def.name)
            .await?
            .unwrap_or_else(|| def.default_retry_policy.clone()))
    }

    /// Failure path shared by `fail_stage` and the reaper. The caller holds
    /// the key lock and has verified `current` is running.
    async fn fail_locked(&self, current: StageExecution, error: StageError) -> OrchestratorResult<FailureOutcome> {
        let key = current.key();
        let def = self.definition(&key.stage_name)?;
        let required = def.required;
        let error_type = classify(&error);
        let policy = self.policy_for(def).await?;

        let decision = if error_type == ErrorType::DependencyViolation {
            RetryDecision::Terminate(TerminationReason::NonRetryable)
        } else {
            self.evaluator.decide(&policy, error_type, current.attempt_count)
        };

        let now = self.clock.now();
        let error_id = Uuid::now_v7();
        let mut next = current.clone();
        next.last_error_id = Some(error_id);
        next.updated_at = now;

        let (severity, retry_at) = match decision {
            RetryDecision::Retry(delay) => {
                let retry_at = chrono::Duration::from_std(delay)
                    .ok()
                    .and_then(|d| now.checked_add_signed(d))
                    .unwrap_or(DateTime::<Utc>::MAX_UTC);
                next.status = ExecutionStatus::Pending;
                next.next_retry_at = Some(retry_at);
                next.attempt_token = None;
                next.progress_percent = 0.0;
                (Severity::Warning, Some(retry_at))
            }
            RetryDecision::Terminate(_) => {
                next.status = ExecutionStatus::Failed;
                next.next_retry_at = None;
                (if required { Severity::Critical } else { Severity::Error }, None)
            }
        };

        if !self
            .state
            .compare_and_swap(&current, next, MarkerChange::Keep)
            .await?
        {
            return Err(self.lost_race(&key, &current).await);
        }

        let mut context = error.context.clone();
        context.insert("attempt".into(), current.attempt_count.into());
        context.insert("max_attempts".into(), policy.max_attempts.into());
        context.insert("required".into(), required.into());
        context.insert("guidance".into(), error_type.guidance().into());
        match decision {
            RetryDecision::Retry(delay) => {
                context.insert(
                    "retry_in_ms".into(),
                    u64::try_from(delay.as_millis()).unwrap_or(u64::MAX).into(),
                );
            }
            RetryDecision::Terminate(reason) => {
                context.insert("termination".into(), reason.as_str().into());
            }
        }

        self.errors
            .record(PipelineError {
                error_id,
                document_id: key.document_id.clone(),
                stage_name: key.stage_name.clone(),
                error_type,
                severity,
                message: error.message.clone(),
                context,
                status: ErrorStatus::Open,
                retry_count_at_failure: current.attempt_count,
                created_at: now,
                resolved_at: None,
                resolution_notes: None,
            })
            .await?;

        let terminal = !decision.is_retry();
        self.emit(PipelineEvent::StageFailed {
            document_id: key.document_id.clone(),
            stage: key.stage_name.clone(),
            attempt: current.attempt_count,
            error_id,
            error_type,
            terminal,
        })
        .await;

        let mut blocked = false;
        let mut unlocked = Vec::new();
        match (decision, retry_at) {
            (RetryDecision::Retry(delay), Some(retry_at)) => {
                let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                warn!(
                    document_id = %key.document_id,
                    stage = %key.stage_name,
                    attempt = current.attempt_count,
                    error_type = %error_type,
                    delay_ms,
                    error = %error.message,
                    "Stage failed, retry scheduled"
                );
                self.emit(PipelineEvent::StageRetryScheduled {
                    document_id: key.document_id.clone(),
                    stage: key.stage_name.clone(),
                    attempt: current.attempt_count,
                    delay_ms,
                    retry_at,
                })
                .await;
            }
            (RetryDecision::Terminate(reason), _) if required => {
                blocked = true;
                warn!(
                    document_id = %key.document_id,
                    stage = %key.stage_name,
                    attempt = current.attempt_count,
                    error_type = %error_type,
                    %reason,
                    error = %error.message,
                    "Required stage failed, document blocked for manual review"
                );
                self.emit(PipelineEvent::DocumentBlocked {
                    document_id: key.document_id.clone(),
                    stage: key.stage_name.clone(),
                })
                .await;
            }
            (RetryDecision::Terminate(reason), _) => {
                warn!(
                    document_id = %key.document_id,
                    stage = %key.stage_name,
                    attempt = current.attempt_count,
                    error_type = %error_type,
                    %reason,
                    error = %error.message,
                    "Optional stage failed, continuing"
                );
                unlocked = self.expand_frontier(&key.document_id, &key.stage_name).await?;
            }
            (RetryDecision::Retry(_), None) => {}
        }

        Ok(FailureOutcome {
            error_id,
            error_type,
            decision,
            retry_at,
            blocked,
            unlocked,
        })
    }

    /// Skip path shared by `skip_stage` and `skip_attempt`.
    async fn skip_locked(&self, current: StageExecution, reason: &str) -> OrchestratorResult<Advance> {
        let key = current.key();
        let now = self.clock.now();
        let mut next = current.clone();
        next.status = ExecutionStatus::Skipped;
        next.next_retry_at = None;
        next.completed_at = None;
        next.metadata
            .insert(SKIP_REASON_KEY.to_string(), serde_json::Value::String(reason.to_string()));
        next.updated_at = now;

        if !self
            .state
            .compare_and_swap(&current, next, MarkerChange::Keep)
            .await?
        {
            return Err(self.lost_race(&key, &current).await);
        }

        self.errors
            .resolve_open(&key, &format!("Stage skipped: {reason}"), now)
            .await?;
        let unlocked = self.expand_frontier(&key.document_id, &key.stage_name).await?;

        info!(document_id = %key.document_id, stage = %key.stage_name, reason, unlocked = ?unlocked, "Stage skipped");
        self.emit(PipelineEvent::StageSkipped {
            document_id: key.document_id.clone(),
            stage: key.stage_name.clone(),
            reason: reason.to_string(),
        })
        .await;
        Ok(Advance { unlocked })
    }

    /// Creates pending rows for successors of `stage` whose dependencies are
    /// all satisfied, and returns every such successor that is pending.
    async fn expand_frontier(&self, document_id: &DocumentId, stage: &str) -> OrchestratorResult<Vec<String>> {
        let successors = self.registry.eligible_successors(stage);
        if successors.is_empty() {
            return Ok(Vec::new());
        }

        let rows = self.rows_by_stage(document_id).await?;
        let now = self.clock.now();
        let mut unlocked = Vec::new();

        for def in successors {
            if !self.unmet_dependencies(def, &rows).is_empty() {
                continue;
            }
            match rows.get(&def.name) {
                Some(existing) if existing.status != ExecutionStatus::Pending => continue,
                Some(_) => {}
                None => {
                    let row = StageExecution::pending(document_id.clone(), def.name.clone(), now);
                    if self.state.insert_if_absent(row).await? {
                        debug!(%document_id, stage = %def.name, "Stage became eligible");
                    }
                }
            }
            unlocked.push(def.name.clone());
        }
        Ok(unlocked)
    }

    async fn emit(&self, event: PipelineEvent) {
        self.events.emit(&event).await;
    }
}

fn validate_document_id(document_id: &DocumentId) -> OrchestratorResult<()> {
    if document_id.is_blank() {
        return Err(OrchestratorError::InvalidDocumentId(document_id.to_string()));
    }
    Ok(())
}
