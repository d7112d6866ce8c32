//! SQLite backend for both the stage state store and the error log.
//!
//! Timestamps are stored as fixed-width RFC 3339 UTC text so that string
//! comparison in SQL orders them correctly. Calls run on the blocking pool.

use super::{
    CompletionMarker, MarkerChange, Metadata, PipelineError, PipelineErrorLog, StageExecution,
    StageStateStore,
};
use crate::core::{DocumentId, ExecutionStatus, StageKey};
use crate::errors::{StoreError, StoreResult};
use crate::retry::RetryPolicy;
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

const SCHEMA: &str = r"
    CREATE TABLE IF NOT EXISTS stage_executions (
        document_id TEXT NOT NULL,
        stage_name TEXT NOT NULL,
        status TEXT NOT NULL,
        attempt_count INTEGER NOT NULL DEFAULT 0,
        progress_percent REAL NOT NULL DEFAULT 0,
        started_at TEXT,
        completed_at TEXT,
        next_retry_at TEXT,
        metadata TEXT NOT NULL DEFAULT '{}',
        last_error_id TEXT,
        attempt_token TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        PRIMARY KEY (document_id, stage_name)
    );

    CREATE INDEX IF NOT EXISTS idx_stage_executions_document ON stage_executions(document_id);
    CREATE INDEX IF NOT EXISTS idx_stage_executions_status_retry ON stage_executions(status, next_retry_at);

    CREATE TABLE IF NOT EXISTS completion_markers (
        document_id TEXT NOT NULL,
        stage_name TEXT NOT NULL,
        attempt INTEGER NOT NULL,
        committed_at TEXT NOT NULL,
        PRIMARY KEY (document_id, stage_name)
    );

    CREATE TABLE IF NOT EXISTS pipeline_errors (
        error_id TEXT PRIMARY KEY,
        document_id TEXT NOT NULL,
        stage_name TEXT NOT NULL,
        error_type TEXT NOT NULL,
        severity TEXT NOT NULL,
        message TEXT NOT NULL,
        context TEXT NOT NULL DEFAULT '{}',
        status TEXT NOT NULL,
        retry_count_at_failure INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        resolved_at TEXT,
        resolution_notes TEXT
    );

    CREATE INDEX IF NOT EXISTS idx_pipeline_errors_document ON pipeline_errors(document_id);
    CREATE INDEX IF NOT EXISTS idx_pipeline_errors_status ON pipeline_errors(status);

    CREATE TABLE IF NOT EXISTS retry_policies (
        stage_name TEXT PRIMARY KEY,
        policy TEXT NOT NULL,
        updated_at TEXT NOT NULL
    );
";

const EXECUTION_COLUMNS: &str = "document_id, stage_name, status, attempt_count, progress_percent, \
     started_at, completed_at, next_retry_at, metadata, last_error_id, attempt_token, created_at, updated_at";

const ERROR_COLUMNS: &str = "error_id, document_id, stage_name, error_type, severity, message, context, \
     status, retry_count_at_failure, created_at, resolved_at, resolution_notes";

/// SQLite-backed store.
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Opens or creates the database at `path` and runs migrations.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened or the schema cannot be created.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .map_err(|e| StoreError::Backend(format!("creating {}: {e}", parent.display())))?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA busy_timeout=5000;")?;
        Self::init(conn)
    }

    /// Opens a private in-memory database.
    ///
    /// # Errors
    ///
    /// Returns an error if the schema cannot be created.
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> StoreResult<Self> {
        conn.execute_batch(SCHEMA)?;
        tracing::debug!("SQLite schema ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let mut guard = conn.lock();
            f(&mut guard)
        })
        .await
        .map_err(|e| StoreError::TaskJoin(e.to_string()))?
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn opt_ts(at: Option<DateTime<Utc>>) -> Option<String> {
    at.map(ts)
}

fn parse<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn parse_opt<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| {
        r.parse()
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
    })
    .transpose()
}

fn json_map(row: &Row<'_>, idx: usize) -> rusqlite::Result<Metadata> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn execution_from_row(row: &Row<'_>) -> rusqlite::Result<StageExecution> {
    Ok(StageExecution {
        document_id: DocumentId::new(row.get::<_, String>(0)?),
        stage_name: row.get(1)?,
        status: parse(row, 2)?,
        attempt_count: row.get(3)?,
        progress_percent: row.get(4)?,
        started_at: parse_opt(row, 5)?,
        completed_at: parse_opt(row, 6)?,
        next_retry_at: parse_opt(row, 7)?,
        metadata: json_map(row, 8)?,
        last_error_id: parse_opt(row, 9)?,
        attempt_token: parse_opt(row, 10)?,
        created_at: parse(row, 11)?,
        updated_at: parse(row, 12)?,
    })
}

fn error_from_row(row: &Row<'_>) -> rusqlite::Result<PipelineError> {
    Ok(PipelineError {
        error_id: parse(row, 0)?,
        document_id: DocumentId::new(row.get::<_, String>(1)?),
        stage_name: row.get(2)?,
        error_type: parse(row, 3)?,
        severity: parse(row, 4)?,
        message: row.get(5)?,
        context: json_map(row, 6)?,
        status: parse(row, 7)?,
        retry_count_at_failure: row.get(8)?,
        created_at: parse(row, 9)?,
        resolved_at: parse_opt(row, 10)?,
        resolution_notes: row.get(11)?,
    })
}

fn query_executions(
    conn: &Connection,
    where_clause: &str,
    args: impl rusqlite::Params,
) -> StoreResult<Vec<StageExecution>> {
    let sql = format!("SELECT {EXECUTION_COLUMNS} FROM stage_executions {where_clause}");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(args, execution_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

fn query_errors(conn: &Connection, where_clause: &str, args: impl rusqlite::Params) -> StoreResult<Vec<PipelineError>> {
    let sql = format!("SELECT {ERROR_COLUMNS} FROM pipeline_errors {where_clause}");
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt
        .query_map(args, error_from_row)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(rows)
}

#[async_trait]
impl StageStateStore for SqliteStore {
    async fn insert_if_absent(&self, execution: StageExecution) -> StoreResult<bool> {
        let metadata = serde_json::to_string(&execution.metadata)?;
        self.with_conn(move |conn| {
            let inserted = conn.execute(
                &format!(
                    "INSERT OR IGNORE INTO stage_executions ({EXECUTION_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)"
                ),
                params![
                    execution.document_id.as_str(),
                    execution.stage_name,
                    execution.status.as_str(),
                    execution.attempt_count,
                    execution.progress_percent,
                    opt_ts(execution.started_at),
                    opt_ts(execution.completed_at),
                    opt_ts(execution.next_retry_at),
                    metadata,
                    execution.last_error_id.map(|id| id.to_string()),
                    execution.attempt_token.map(|id| id.to_string()),
                    ts(execution.created_at),
                    ts(execution.updated_at),
                ],
            )?;
            Ok(inserted == 1)
        })
        .await
    }

    async fn get_execution(&self, key: &StageKey) -> StoreResult<Option<StageExecution>> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {EXECUTION_COLUMNS} FROM stage_executions \
                         WHERE document_id = ?1 AND stage_name = ?2"
                    ),
                    params![key.document_id.as_str(), key.stage_name],
                    execution_from_row,
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    async fn list_executions(&self, document_id: &DocumentId) -> StoreResult<Vec<StageExecution>> {
        let document_id = document_id.clone();
        self.with_conn(move |conn| {
            query_executions(
                conn,
                "WHERE document_id = ?1 ORDER BY stage_name",
                params![document_id.as_str()],
            )
        })
        .await
    }

    async fn compare_and_swap(
        &self,
        expected: &StageExecution,
        next: StageExecution,
        marker: MarkerChange,
    ) -> StoreResult<bool> {
        let metadata = serde_json::to_string(&next.metadata)?;
        let expected_status = expected.status;
        let expected_attempt = expected.attempt_count;
        let expected_token = expected.attempt_token.map(|id| id.to_string());
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE stage_executions SET \
                 status = ?3, attempt_count = ?4, progress_percent = ?5, started_at = ?6, \
                 completed_at = ?7, next_retry_at = ?8, metadata = ?9, last_error_id = ?10, \
                 attempt_token = ?11, updated_at = ?12 \
                 WHERE document_id = ?1 AND stage_name = ?2 AND status = ?13 AND attempt_count = ?14 \
                 AND attempt_token IS ?15",
                params![
                    next.document_id.as_str(),
                    next.stage_name,
                    next.status.as_str(),
                    next.attempt_count,
                    next.progress_percent,
                    opt_ts(next.started_at),
                    opt_ts(next.completed_at),
                    opt_ts(next.next_retry_at),
                    metadata,
                    next.last_error_id.map(|id| id.to_string()),
                    next.attempt_token.map(|id| id.to_string()),
                    ts(next.updated_at),
                    expected_status.as_str(),
                    expected_attempt,
                    expected_token,
                ],
            )?;
            if changed != 1 {
                return Ok(false);
            }

            match marker {
                MarkerChange::Keep => {}
                MarkerChange::Write(m) => {
                    tx.execute(
                        "INSERT OR IGNORE INTO completion_markers (document_id, stage_name, attempt, committed_at) \
                         VALUES (?1, ?2, ?3, ?4)",
                        params![m.document_id.as_str(), m.stage_name, m.attempt, ts(m.committed_at)],
                    )?;
                }
                MarkerChange::Remove => {
                    tx.execute(
                        "DELETE FROM completion_markers WHERE document_id = ?1 AND stage_name = ?2",
                        params![next.document_id.as_str(), next.stage_name],
                    )?;
                }
            }
            tx.commit()?;
            Ok(true)
        })
        .await
    }

    async fn list_due_pending(
        &self,
        now: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> StoreResult<Vec<StageExecution>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let offset = i64::try_from(offset).unwrap_or(i64::MAX);
        self.with_conn(move |conn| {
            query_executions(
                conn,
                "WHERE status = 'pending' AND (next_retry_at IS NULL OR next_retry_at <= ?1) \
                 ORDER BY COALESCE(next_retry_at, updated_at), document_id, stage_name \
                 LIMIT ?2 OFFSET ?3",
                params![ts(now), limit, offset],
            )
        })
        .await
    }

    async fn list_running_started_before(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<StageExecution>> {
        self.with_conn(move |conn| {
            query_executions(
                conn,
                "WHERE status = 'running' AND started_at < ?1 ORDER BY started_at",
                params![ts(cutoff)],
            )
        })
        .await
    }

    async fn list_by_status(&self, status: ExecutionStatus) -> StoreResult<Vec<StageExecution>> {
        self.with_conn(move |conn| {
            query_executions(
                conn,
                "WHERE status = ?1 ORDER BY document_id, stage_name",
                params![status.as_str()],
            )
        })
        .await
    }

    async fn get_marker(&self, key: &StageKey) -> StoreResult<Option<CompletionMarker>> {
        let key = key.clone();
        self.with_conn(move |conn| {
            let marker = conn
                .query_row(
                    "SELECT attempt, committed_at FROM completion_markers \
                     WHERE document_id = ?1 AND stage_name = ?2",
                    params![key.document_id.as_str(), key.stage_name],
                    |row| Ok((row.get::<_, u32>(0)?, parse::<DateTime<Utc>>(row, 1)?)),
                )
                .optional()?;
            Ok(marker.map(|(attempt, committed_at)| CompletionMarker {
                document_id: key.document_id,
                stage_name: key.stage_name,
                attempt,
                committed_at,
            }))
        })
        .await
    }

    async fn delete_document(&self, document_id: &DocumentId) -> StoreResult<usize> {
        let document_id = document_id.clone();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            tx.execute(
                "DELETE FROM completion_markers WHERE document_id = ?1",
                params![document_id.as_str()],
            )?;
            let removed = tx.execute(
                "DELETE FROM stage_executions WHERE document_id = ?1",
                params![document_id.as_str()],
            )?;
            tx.commit()?;
            Ok(removed)
        })
        .await
    }

    async fn get_retry_policy(&self, stage_name: &str) -> StoreResult<Option<RetryPolicy>> {
        let stage_name = stage_name.to_string();
        self.with_conn(move |conn| {
            let raw: Option<String> = conn
                .query_row(
                    "SELECT policy FROM retry_policies WHERE stage_name = ?1",
                    params![stage_name],
                    |row| row.get(0),
                )
                .optional()?;
            raw.map(|r| serde_json::from_str(&r).map_err(StoreError::from))
                .transpose()
        })
        .await
    }

    async fn put_retry_policy(&self, stage_name: &str, policy: &RetryPolicy) -> StoreResult<()> {
        let stage_name = stage_name.to_string();
        let policy = serde_json::to_string(policy)?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO retry_policies (stage_name, policy, updated_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(stage_name) DO UPDATE SET policy = excluded.policy, updated_at = excluded.updated_at",
                params![stage_name, policy, ts(Utc::now())],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl PipelineErrorLog for SqliteStore {
    async fn record(&self, error: PipelineError) -> StoreResult<()> {
        let context = serde_json::to_string(&error.context)?;
        self.with_conn(move |conn| {
            conn.execute(
                &format!(
                    "INSERT INTO pipeline_errors ({ERROR_COLUMNS}) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
                ),
                params![
                    error.error_id.to_string(),
                    error.document_id.as_str(),
                    error.stage_name,
                    error.error_type.as_str(),
                    error.severity.as_str(),
                    error.message,
                    context,
                    error.status.as_str(),
                    error.retry_count_at_failure,
                    ts(error.created_at),
                    opt_ts(error.resolved_at),
                    error.resolution_notes,
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn get(&self, error_id: Uuid) -> StoreResult<Option<PipelineError>> {
        self.with_conn(move |conn| {
            let row = conn
                .query_row(
                    &format!("SELECT {ERROR_COLUMNS} FROM pipeline_errors WHERE error_id = ?1"),
                    params![error_id.to_string()],
                    error_from_row,
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    async fn list_for_document(&self, document_id: &DocumentId) -> StoreResult<Vec<PipelineError>> {
        let document_id = document_id.clone();
        self.with_conn(move |conn| {
            query_errors(
                conn,
                "WHERE document_id = ?1 ORDER BY created_at, error_id",
                params![document_id.as_str()],
            )
        })
        .await
    }

    async fn list_open(&self) -> StoreResult<Vec<PipelineError>> {
        self.with_conn(|conn| query_errors(conn, "WHERE status = 'open' ORDER BY created_at, error_id", []))
            .await
    }

    async fn resolve_open(&self, key: &StageKey, notes: &str, now: DateTime<Utc>) -> StoreResult<usize> {
        let key = key.clone();
        let notes = notes.to_string();
        self.with_conn(move |conn| {
            let resolved = conn.execute(
                "UPDATE pipeline_errors SET status = 'resolved', resolved_at = ?3, resolution_notes = ?4 \
                 WHERE document_id = ?1 AND stage_name = ?2 AND status = 'open'",
                params![key.document_id.as_str(), key.stage_name, ts(now), notes],
            )?;
            Ok(resolved)
        })
        .await
    }

    async fn resolve(&self, error_id: Uuid, notes: &str, now: DateTime<Utc>) -> StoreResult<Option<PipelineError>> {
        let notes = notes.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE pipeline_errors SET status = 'resolved', resolved_at = ?2, resolution_notes = ?3 \
                 WHERE error_id = ?1 AND status = 'open'",
                params![error_id.to_string(), ts(now), notes],
            )?;
            let row = conn
                .query_row(
                    &format!("SELECT {ERROR_COLUMNS} FROM pipeline_errors WHERE error_id = ?1"),
                    params![error_id.to_string()],
                    error_from_row,
                )
                .optional()?;
            Ok(row)
        })
        .await
    }

    async fn delete_document(&self, document_id: &DocumentId) -> StoreResult<usize> {
        let document_id = document_id.clone();
        self.with_conn(move |conn| {
            let removed = conn.execute(
                "DELETE FROM pipeline_errors WHERE document_id = ?1",
                params![document_id.as_str()],
            )?;
            Ok(removed)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn test_row_round_trip_preserves_fields() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut row = StageExecution::pending("d1".into(), "chunking", at(0));
        row.metadata.insert("chunks".into(), serde_json::json!(42));
        row.next_retry_at = Some(at(30));

        assert!(store.insert_if_absent(row.clone()).await.unwrap());
        assert!(!store.insert_if_absent(row.clone()).await.unwrap());

        let loaded = store.get_execution(&row.key()).await.unwrap().unwrap();
        assert_eq!(loaded, row);
    }

    #[tokio::test]
    async fn test_cas_and_marker_in_one_transaction() {
        let store = SqliteStore::open_in_memory().unwrap();
        let row = StageExecution::pending("d1".into(), "a", at(0));
        store.insert_if_absent(row.clone()).await.unwrap();

        let mut done = row.clone();
        done.status = ExecutionStatus::Completed;
        done.completed_at = Some(at(5));
        let marker = CompletionMarker {
            document_id: "d1".into(),
            stage_name: "a".into(),
            attempt: 0,
            committed_at: at(5),
        };

        // Wrong expectation: nothing changes, no marker.
        let mut stale = row.clone();
        stale.status = ExecutionStatus::Running;
        assert!(!store
            .compare_and_swap(&stale, done.clone(), MarkerChange::Write(marker.clone()))
            .await
            .unwrap());
        assert!(store.get_marker(&row.key()).await.unwrap().is_none());

        assert!(store
            .compare_and_swap(&row, done, MarkerChange::Write(marker.clone()))
            .await
            .unwrap());
        assert_eq!(store.get_marker(&row.key()).await.unwrap(), Some(marker));
    }

    #[tokio::test]
    async fn test_cas_rejects_a_superseded_token() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut first = StageExecution::pending("d1".into(), "a", at(0));
        first.status = ExecutionStatus::Running;
        first.attempt_count = 1;
        first.attempt_token = Some(Uuid::new_v4());
        store.insert_if_absent(first.clone()).await.unwrap();

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

        // A pending row has no token; NULL must still match NULL.
        let pending = StageExecution::pending("d1".into(), "b", at(0));
        store.insert_if_absent(pending.clone()).await.unwrap();
        let mut started = pending.clone();
        started.status = ExecutionStatus::Running;
        assert!(store
            .compare_and_swap(&pending, started, MarkerChange::Keep)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_due_pending_uses_retry_index() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut later = StageExecution::pending("d1".into(), "a", at(0));
        later.next_retry_at = Some(at(100));
        store.insert_if_absent(later).await.unwrap();
        store
            .insert_if_absent(StageExecution::pending("d1".into(), "b", at(0)))
            .await
            .unwrap();

        assert_eq!(store.list_due_pending(at(50), 0, 10).await.unwrap().len(), 1);
        assert_eq!(store.list_due_pending(at(100), 0, 10).await.unwrap().len(), 2);
        let page = store.list_due_pending(at(100), 1, 10).await.unwrap();
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].stage_name, "a");
    }
}
