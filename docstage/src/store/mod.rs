//! Durable stage state and failure records.
//!
//! The orchestrator is the only writer. Backends must make
//! [`StageStateStore::compare_and_swap`] atomic together with its marker
//! change: that is what keeps `completed` and the completion marker in step
//! and lets several orchestrator instances share one store.

mod memory;
mod records;
#[cfg(feature = "sqlite")]
mod sqlite;

pub use memory::{InMemoryErrorLog, InMemoryStageStore};
pub use records::{CompletionMarker, MarkerChange, Metadata, PipelineError, StageExecution};
#[cfg(feature = "sqlite")]
pub use sqlite::SqliteStore;

use crate::core::{DocumentId, ExecutionStatus, StageKey};
use crate::errors::StoreResult;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Storage for stage executions, completion markers and retry policy overrides.
#[async_trait]
pub trait StageStateStore: Send + Sync {
    /// Inserts a row unless one exists for its key. Returns true if inserted.
    async fn insert_if_absent(&self, execution: StageExecution) -> StoreResult<bool>;

    /// Gets a row by key.
    async fn get_execution(&self, key: &StageKey) -> StoreResult<Option<StageExecution>>;

    /// Lists all rows of a document.
    async fn list_executions(&self, document_id: &DocumentId) -> StoreResult<Vec<StageExecution>>;

    /// Replaces a row if its stored status, attempt count and attempt token
    /// still match `expected`.
    ///
    /// The token is part of the match because attempt numbers restart after a
    /// reset. The marker change is applied in the same atomic step. Returns
    /// false, changing nothing, if the row is missing or no longer matches.
    async fn compare_and_swap(
        &self,
        expected: &StageExecution,
        next: StageExecution,
        marker: MarkerChange,
    ) -> StoreResult<bool>;

    /// Pending rows whose backoff has elapsed, oldest first.
    ///
    /// Ties are broken by key so `offset` pages through a stable order.
    async fn list_due_pending(
        &self,
        now: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> StoreResult<Vec<StageExecution>>;

    /// Running rows whose current attempt started before `cutoff`.
    async fn list_running_started_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<StageExecution>>;

    /// All rows with the given status.
    async fn list_by_status(&self, status: ExecutionStatus) -> StoreResult<Vec<StageExecution>>;

    /// Gets the completion marker of a key.
    async fn get_marker(&self, key: &StageKey) -> StoreResult<Option<CompletionMarker>>;

    /// Deletes all rows and markers of a document. Returns the number of rows removed.
    async fn delete_document(&self, document_id: &DocumentId) -> StoreResult<usize>;

    /// Gets the stored retry policy override of a stage.
    async fn get_retry_policy(&self, stage_name: &str) -> StoreResult<Option<RetryPolicy>>;

    /// Stores a retry policy override.
    async fn put_retry_policy(&self, stage_name: &str, policy: &RetryPolicy) -> StoreResult<()>;
}

/// Storage for pipeline errors.
#[async_trait]
pub trait PipelineErrorLog: Send + Sync {
    /// Appends an error.
    async fn record(&self, error: PipelineError) -> StoreResult<()>;

    /// Gets an error by id.
    async fn get(&self, error_id: Uuid) -> StoreResult<Option<PipelineError>>;

    /// All errors of a document, oldest first.
    async fn list_for_document(&self, document_id: &DocumentId) -> StoreResult<Vec<PipelineError>>;

    /// All open errors, oldest first.
    async fn list_open(&self) -> StoreResult<Vec<PipelineError>>;

    /// Resolves all open errors of a key. Returns how many were resolved.
    async fn resolve_open(&self, key: &StageKey, notes: &str, now: DateTime<Utc>) -> StoreResult<usize>;

    /// Resolves one error. Returns the error after the call, or `None` if unknown.
    async fn resolve(&self, error_id: Uuid, notes: &str, now: DateTime<Utc>) -> StoreResult<Option<PipelineError>>;

    /// Deletes all errors of a document. Returns how many were removed.
    async fn delete_document(&self, document_id: &DocumentId) -> StoreResult<usize>;
}

/// A matched pair of backends.
#[derive(Clone)]
pub struct Stores {
    /// Stage state store.
    pub state: Arc<dyn StageStateStore>,
    /// Error log.
    pub errors: Arc<dyn PipelineErrorLog>,
}

impl Stores {
    /// Fresh in-memory backends.
    #[must_use]
    pub fn in_memory() -> Self {
        Self {
            state: Arc::new(InMemoryStageStore::new()),
            errors: Arc::new(InMemoryErrorLog::new()),
        }
    }

    /// Both traits served by one SQLite database.
    #[cfg(feature = "sqlite")]
    #[must_use]
    pub fn sqlite(store: SqliteStore) -> Self {
        let store = Arc::new(store);
        Self {
            state: store.clone(),
            errors: store,
        }
    }
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").finish_non_exhaustive()
    }
}
