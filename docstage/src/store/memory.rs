//! In-memory backends.

use super::{
    CompletionMarker, MarkerChange, PipelineError, PipelineErrorLog, StageExecution, StageStateStore,
};
use crate::core::{DocumentId, ExecutionStatus, StageKey};
use crate::errors::StoreResult;
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use uuid::Uuid;

#[derive(Debug, Default)]
struct Tables {
    executions: BTreeMap<StageKey, StageExecution>,
    markers: HashMap<StageKey, CompletionMarker>,
}

/// In-memory stage state store.
///
/// Executions and markers share one lock so a swap and its marker change
/// are observed together.
#[derive(Debug, Default)]
pub struct InMemoryStageStore {
    tables: RwLock<Tables>,
    policies: DashMap<String, RetryPolicy>,
}

impl InMemoryStageStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of execution rows.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tables.read().executions.len()
    }

    /// Returns true if the store holds no rows.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tables.read().executions.is_empty()
    }

    /// Number of completion markers.
    #[must_use]
    pub fn marker_count(&self) -> usize {
        self.tables.read().markers.len()
    }
}

#[async_trait]
impl StageStateStore for InMemoryStageStore {
    async fn insert_if_absent(&self, execution: StageExecution) -> StoreResult<bool> {
        let mut tables = self.tables.write();
        let key = execution.key();
        if tables.executions.contains_key(&key) {
            return Ok(false);
        }
        tables.executions.insert(key, execution);
        Ok(true)
    }

    async fn get_execution(&self, key: &StageKey) -> StoreResult<Option<StageExecution>> {
        Ok(self.tables.read().executions.get(key).cloned())
    }

    async fn list_executions(&self, document_id: &DocumentId) -> StoreResult<Vec<StageExecution>> {
        let tables = self.tables.read();
        Ok(tables
            .executions
            .values()
            .filter(|e| &e.document_id == document_id)
            .cloned()
            .collect())
    }

    async fn compare_and_swap(
        &self,
        expected: &StageExecution,
        next: StageExecution,
        marker: MarkerChange,
    ) -> StoreResult<bool> {
        let mut tables = self.tables.write();
        let key = next.key();

        match tables.executions.get(&key) {
            Some(current)
                if current.status == expected.status
                    && current.attempt_count == expected.attempt_count
                    && current.attempt_token == expected.attempt_token => {}
            _ => return Ok(false),
        }

        match marker {
            MarkerChange::Keep => {}
            MarkerChange::Write(m) => {
                tables.markers.entry(key.clone()).or_insert(m);
            }
            MarkerChange::Remove => {
                tables.markers.remove(&key);
            }
        }
        tables.executions.insert(key, next);
        Ok(true)
    }

    async fn list_due_pending(
        &self,
        now: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> StoreResult<Vec<StageExecution>> {
        let tables = self.tables.read();
        let mut due: Vec<StageExecution> = tables
            .executions
            .values()
            .filter(|e| e.is_due(now))
            .cloned()
            .collect();
        due.sort_by_key(|e| (e.next_retry_at.unwrap_or(e.updated_at), e.key()));
        Ok(due.into_iter().skip(offset).take(limit).collect())
    }

    async fn list_running_started_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<StageExecution>> {
        let tables = self.tables.read();
        Ok(tables
            .executions
            .values()
            .filter(|e| e.status == ExecutionStatus::Running && e.started_at.is_some_and(|s| s < cutoff))
            .cloned()
            .collect())
    }

    async fn list_by_status(&self, status: ExecutionStatus) -> StoreResult<Vec<StageExecution>> {
        let tables = self.tables.read();
        Ok(tables
            .executions
            .values()
            .filter(|e| e.status == status)
            .cloned()
            .collect())
    }

    async fn get_marker(&self, key: &StageKey) -> StoreResult<Option<CompletionMarker>> {
        Ok(self.tables.read().markers.get(key).cloned())
    }

    async fn delete_document(&self, document_id: &DocumentId) -> StoreResult<usize> {
        let mut tables = self.tables.write();
        let before = tables.executions.len();
        tables.executions.retain(|k, _| &k.document_id != document_id);
        tables.markers.retain(|k, _| &k.document_id != document_id);
        Ok(before - tables.executions.len())
    }

    async fn get_retry_policy(&self, stage_name: &str) -> StoreResult<Option<RetryPolicy>> {
        Ok(self.policies.get(stage_name).map(|p| p.value().clone()))
    }

    async fn put_retry_policy(&self, stage_name: &str, policy: &RetryPolicy) -> StoreResult<()> {
        self.policies.insert(stage_name.to_string(), policy.clone());
        Ok(())
    }
}

/// In-memory pipeline error log.
#[derive(Debug, Default)]
pub struct InMemoryErrorLog {
    errors: RwLock<BTreeMap<Uuid, PipelineError>>,
}

impl InMemoryErrorLog {
    /// Creates an empty log.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded errors.
    #[must_use]
    pub fn len(&self) -> usize {
        self.errors.read().len()
    }

    /// Returns true if nothing was recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.errors.read().is_empty()
    }

    fn collect(&self, pred: impl Fn(&PipelineError) -> bool) -> Vec<PipelineError> {
        let mut found: Vec<PipelineError> = self.errors.read().values().filter(|e| pred(e)).cloned().collect();
        found.sort_by_key(|e| (e.created_at, e.error_id));
        found
    }
}

#[async_trait]
impl PipelineErrorLog for InMemoryErrorLog {
    async fn record(&self, error: PipelineError) -> StoreResult<()> {
        self.errors.write().insert(error.error_id, error);
        Ok(())
    }

    async fn get(&self, error_id: Uuid) -> StoreResult<Option<PipelineError>> {
        Ok(self.errors.read().get(&error_id).cloned())
    }

    async fn list_for_document(&self, document_id: &DocumentId) -> StoreResult<Vec<PipelineError>> {
        Ok(self.collect(|e| &e.document_id == document_id))
    }

    async fn list_open(&self) -> StoreResult<Vec<PipelineError>> {
        Ok(self.collect(PipelineError::is_open))
    }

    async fn resolve_open(&self, key: &StageKey, notes: &str, now: DateTime<Utc>) -> StoreResult<usize> {
        let mut errors = self.errors.write();
        let resolved = errors
            .values_mut()
            .filter(|e| e.document_id == key.document_id && e.stage_name == key.stage_name)
            .map(|e| e.resolve(notes, now))
            .filter(|changed| *changed)
            .count();
        Ok(resolved)
    }

    async fn resolve(&self, error_id: Uuid, notes: &str, now: DateTime<Utc>) -> StoreResult<Option<PipelineError>> {
        let mut errors = self.errors.write();
        Ok(errors.get_mut(&error_id).map(|e| {
            e.resolve(notes, now);
            e.clone()
        }))
    }

    async fn delete_document(&self, document_id: &DocumentId) -> StoreResult<usize> {
        let mut errors = self.errors.write();
        let before = errors.len();
        errors.retain(|_, e| &e.document_id != document_id);
        Ok(before - errors.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{ErrorStatus, ErrorType, Severity};
    use crate::store::Metadata;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn error(doc: &str, stage: &str, secs: i64) -> PipelineError {
        PipelineError {
            error_id: Uuid::now_v7(),
            document_id: doc.into(),
            stage_name: stage.into(),
            error_type: ErrorType::Transient,
            severity: Severity::Warning,
            message: "timeout".into(),
            context: Metadata::new(),
            status: ErrorStatus::Open,
            retry_count_at_failure: 1,
            created_at: at(secs),
            resolved_at: None,
            resolution_notes: None,
        }
    }

    #[tokio::test]
    async fn test_insert_if_absent_is_idempotent() {
        let store = InMemoryStageStore::new();
        let row = StageExecution::pending("d1".into(), "a", at(0));

        assert!(store.insert_if_absent(row.clone()).await.unwrap());
        assert!(!store.insert_if_absent(row).await.unwrap());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_compare_and_swap_checks_status_and_attempt() {
        let store = InMemoryStageStore::new();
        let row = StageExecution::pending("d1".into(), "a", at(0));
        store.insert_if_absent(row.clone()).await.unwrap();

        let mut running = row.clone();
        running.status = ExecutionStatus::Running;
        running.attempt_count = 1;

        assert!(store
            .compare_and_swap(&row, running.clone(), MarkerChange::Keep)
            .await
            .unwrap());
        // The second writer with the same expectation loses.
        assert!(!store
            .compare_and_swap(&row, running, MarkerChange::Keep)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_compare_and_swap_checks_attempt_token() {
        let store = InMemoryStageStore::new();
        let mut first = StageExecution::pending("d1".into(), "a", at(0));
        first.status = ExecutionStatus::Running;
        first.attempt_count = 1;
        first.attempt_token = Some(Uuid::new_v4());
        store.insert_if_absent(first.clone()).await.unwrap();

        // A reset and restart reuse attempt 1 under a new token.
        let mut second = first.reset(at(10));
        second.status = ExecutionStatus::Running;
        second.attempt_count = 1;
        second.attempt_token = Some(Uuid::new_v4());
        assert!(store
            .compare_and_swap(&first, second.clone(), MarkerChange::Keep)
            .await
            .unwrap());

        let mut late = first.clone();
        late.status = ExecutionStatus::Completed;
        assert!(!store
            .compare_and_swap(&first, late, MarkerChange::Keep)
            .await
            .unwrap());
        assert_eq!(store.get_execution(&first.key()).await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn test_marker_written_once_and_removed() {
        let store = InMemoryStageStore::new();
        let row = StageExecution::pending("d1".into(), "a", at(0));
        store.insert_if_absent(row.clone()).await.unwrap();

        let marker = CompletionMarker {
            document_id: "d1".into(),
            stage_name: "a".into(),
            attempt: 1,
            committed_at: at(1),
        };
        let mut done = row.clone();
        done.status = ExecutionStatus::Completed;
        store
            .compare_and_swap(&row, done.clone(), MarkerChange::Write(marker.clone()))
            .await
            .unwrap();

        let mut later = marker.clone();
        later.committed_at = at(50);
        store
            .compare_and_swap(&done, done.clone(), MarkerChange::Write(later))
            .await
            .unwrap();
        assert_eq!(store.get_marker(&row.key()).await.unwrap(), Some(marker));

        store
            .compare_and_swap(&done, row.reset(at(60)), MarkerChange::Remove)
            .await
            .unwrap();
        assert_eq!(store.marker_count(), 0);
    }

    #[tokio::test]
    async fn test_due_and_stale_queries() {
        let store = InMemoryStageStore::new();
        let mut waiting = StageExecution::pending("d1".into(), "a", at(0));
        waiting.next_retry_at = Some(at(100));
        let ready = StageExecution::pending("d1".into(), "b", at(0));
        let mut running = StageExecution::pending("d2".into(), "a", at(0));
        running.status = ExecutionStatus::Running;
        running.started_at = Some(at(10));

        for row in [waiting, ready, running] {
            store.insert_if_absent(row).await.unwrap();
        }

        let due = store.list_due_pending(at(50), 0, 10).await.unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].stage_name, "b");
        assert_eq!(store.list_due_pending(at(100), 0, 10).await.unwrap().len(), 2);

        let first = store.list_due_pending(at(100), 0, 1).await.unwrap();
        let second = store.list_due_pending(at(100), 1, 1).await.unwrap();
        assert_eq!(first[0].stage_name, "b");
        assert_eq!(second[0].stage_name, "a");
        assert!(store.list_due_pending(at(100), 2, 1).await.unwrap().is_empty());

        assert!(store.list_running_started_before(at(10)).await.unwrap().is_empty());
        assert_eq!(store.list_running_started_before(at(11)).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_document_cascades() {
        let store = InMemoryStageStore::new();
        store.insert_if_absent(StageExecution::pending("d1".into(), "a", at(0))).await.unwrap();
        store.insert_if_absent(StageExecution::pending("d1".into(), "b", at(0))).await.unwrap();
        store.insert_if_absent(StageExecution::pending("d2".into(), "a", at(0))).await.unwrap();

        assert_eq!(store.delete_document(&"d1".into()).await.unwrap(), 2);
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn test_retry_policy_override() {
        let store = InMemoryStageStore::new();
        assert!(store.get_retry_policy("a").await.unwrap().is_none());
        store
            .put_retry_policy("a", &RetryPolicy::new().with_max_attempts(9))
            .await
            .unwrap();
        assert_eq!(store.get_retry_policy("a").await.unwrap().unwrap().max_attempts, 9);
    }

    #[tokio::test]
    async fn test_error_log_resolution() {
        let log = InMemoryErrorLog::new();
        let first = error("d1", "a", 0);
        let second = error("d1", "a", 1);
        let other = error("d1", "b", 2);
        let other_id = other.error_id;
        for e in [first, second, other] {
            log.record(e).await.unwrap();
        }

        assert_eq!(log.list_open().await.unwrap().len(), 3);
        let resolved = log
            .resolve_open(&StageKey::new("d1", "a"), "completed", at(10))
            .await
            .unwrap();
        assert_eq!(resolved, 2);
        assert_eq!(log.list_open().await.unwrap().len(), 1);

        let err = log.resolve(other_id, "operator", at(11)).await.unwrap().unwrap();
        assert!(!err.is_open());
        assert!(log.resolve(Uuid::now_v7(), "x", at(12)).await.unwrap().is_none());
        assert_eq!(log.list_for_document(&"d1".into()).await.unwrap().len(), 3);
    }
}
