//! SQLite checkpoint store implementation.
//!
//! Implements `CheckpointStore` from `termops-core` using sqlx with split
//! read/write pools. A run is one row in `workflow_runs` plus one row per
//! step in `workflow_step_results`; `save_run` writes both in a single
//! transaction. `workflow_run_leases` holds the per-run exclusive lease.

use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::Row;
use termops_core::repository::checkpoint::CheckpointStore;
use termops_types::error::RepositoryError;
use termops_types::workflow::{RunState, RunStatus, RunSummary, StepResult, StepStatus};
use uuid::Uuid;

use super::pool::DatabasePool;
use super::schema;

/// SQLite-backed implementation of `CheckpointStore`.
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    pool: DatabasePool,
}

impl SqliteCheckpointStore {
    /// Create a new store backed by the given database pool.
    pub fn new(pool: DatabasePool) -> Self {
        Self { pool }
    }

    /// Resolve a full run ID from a unique prefix (e.g. the 8-character form
    /// shown in tables).
    ///
    /// Returns `NotFound` when nothing matches and `Conflict` when the prefix
    /// is ambiguous.
    pub async fn resolve_run_id(&self, prefix: &str) -> Result<Uuid, RepositoryError> {
        let prefix = prefix.trim().to_lowercase();
        if prefix.is_empty() || !prefix.chars().all(|c| c.is_ascii_hexdigit() || c == '-') {
            return Err(RepositoryError::NotFound);
        }

        let rows = sqlx::query(
            "SELECT run_id FROM workflow_runs WHERE run_id LIKE ? || '%' ORDER BY run_id LIMIT 2",
        )
        .bind(&prefix)
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        match rows.as_slice() {
            [] => Err(RepositoryError::NotFound),
            [row] => {
                let id: String = row
                    .try_get("run_id")
                    .map_err(|e| RepositoryError::Query(e.to_string()))?;
                parse_uuid(&id)
            }
            _ => Err(RepositoryError::Conflict(format!(
                "ambiguous run id prefix '{prefix}'"
            ))),
        }
    }
}

// ---------------------------------------------------------------------------
// Internal row types
// ---------------------------------------------------------------------------

struct RunRow {
    run_id: String,
    workflow_id: String,
    workflow_name: String,
    status: String,
    current_step_idx: i64,
    started_at: String,
    updated_at: String,
    completed_at: Option<String>,
    error: Option<String>,
}

impl RunRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            run_id: row.try_get("run_id")?,
            workflow_id: row.try_get("workflow_id")?,
            workflow_name: row.try_get("workflow_name")?,
            status: row.try_get("status")?,
            current_step_idx: row.try_get("current_step_idx")?,
            started_at: row.try_get("started_at")?,
            updated_at: row.try_get("updated_at")?,
            completed_at: row.try_get("completed_at")?,
            error: row.try_get("error")?,
        })
    }

    fn into_summary(self) -> Result<RunSummary, RepositoryError> {
        let status: RunStatus = self.status.parse().map_err(RepositoryError::Query)?;
        let current_step_idx = usize::try_from(self.current_step_idx).map_err(|_| {
            RepositoryError::Query(format!("invalid current_step_idx: {}", self.current_step_idx))
        })?;

        Ok(RunSummary {
            run_id: parse_uuid(&self.run_id)?,
            workflow_id: self.workflow_id,
            workflow_name: self.workflow_name,
            status,
            current_step_idx,
            started_at: parse_datetime(&self.started_at)?,
            updated_at: parse_datetime(&self.updated_at)?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            error: self.error,
        })
    }
}

struct StepRow {
    step_id: String,
    status: String,
    exit_code: Option<i32>,
    output: String,
    error: Option<String>,
    retries: i64,
    started_at: Option<String>,
    completed_at: Option<String>,
    duration_ms: i64,
}

impl StepRow {
    fn from_row(row: &sqlx::sqlite::SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            step_id: row.try_get("step_id")?,
            status: row.try_get("status")?,
            exit_code: row.try_get("exit_code")?,
            output: row.try_get("output")?,
            error: row.try_get("error")?,
            retries: row.try_get("retries")?,
            started_at: row.try_get("started_at")?,
            completed_at: row.try_get("completed_at")?,
            duration_ms: row.try_get("duration_ms")?,
        })
    }

    fn into_result(self) -> Result<(String, StepResult), RepositoryError> {
        let status: StepStatus = self.status.parse().map_err(RepositoryError::Query)?;
        let result = StepResult {
            status,
            exit_code: self.exit_code,
            output: self.output,
            error: self.error,
            retries: u32::try_from(self.retries).unwrap_or(0),
            started_at: self.started_at.as_deref().map(parse_datetime).transpose()?,
            completed_at: self.completed_at.as_deref().map(parse_datetime).transpose()?,
            duration_ms: u64::try_from(self.duration_ms).unwrap_or(0),
        };
        Ok((self.step_id, result))
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn parse_uuid(s: &str) -> Result<Uuid, RepositoryError> {
    s.parse::<Uuid>()
        .map_err(|e| RepositoryError::Query(format!("invalid UUID: {e}")))
}

fn parse_datetime(s: &str) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RepositoryError::Query(format!("invalid datetime: {e}")))
}

fn format_datetime(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn query_error(e: sqlx::Error) -> RepositoryError {
    if let sqlx::Error::Database(ref db_err) = e {
        if db_err.message().contains("FOREIGN KEY") {
            return RepositoryError::NotFound;
        }
    }
    RepositoryError::Query(e.to_string())
}

const UPSERT_STEP: &str = r#"INSERT INTO workflow_step_results
    (run_id, step_id, status, exit_code, output, error, retries, started_at, completed_at, duration_ms)
    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
    ON CONFLICT(run_id, step_id) DO UPDATE SET
        status = excluded.status,
        exit_code = excluded.exit_code,
        output = excluded.output,
        error = excluded.error,
        retries = excluded.retries,
        started_at = excluded.started_at,
        completed_at = excluded.completed_at,
        duration_ms = excluded.duration_ms"#;

fn bind_step<'q>(
    run_id: &Uuid,
    step_id: &'q str,
    result: &'q StepResult,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    sqlx::query(UPSERT_STEP)
        .bind(run_id.to_string())
        .bind(step_id)
        .bind(result.status.as_str())
        .bind(result.exit_code)
        .bind(&result.output)
        .bind(&result.error)
        .bind(i64::from(result.retries))
        .bind(result.started_at.as_ref().map(format_datetime))
        .bind(result.completed_at.as_ref().map(format_datetime))
        .bind(i64::try_from(result.duration_ms).unwrap_or(i64::MAX))
}

fn unix_millis(at: DateTime<Utc>) -> i64 {
    at.timestamp_millis()
}

// ---------------------------------------------------------------------------
// CheckpointStore implementation
// ---------------------------------------------------------------------------

impl CheckpointStore for SqliteCheckpointStore {
    async fn init_schema(&self) -> Result<(), RepositoryError> {
        schema::apply(&self.pool.writer)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))
    }

    async fn save_run(&self, state: &RunState) -> Result<(), RepositoryError> {
        let mut tx = self
            .pool
            .writer
            .begin()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        sqlx::query(
            r#"INSERT INTO workflow_runs
               (run_id, workflow_id, workflow_name, status, current_step_idx,
                started_at, updated_at, completed_at, error)
               VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
               ON CONFLICT(run_id) DO UPDATE SET
                   workflow_id = excluded.workflow_id,
                   workflow_name = excluded.workflow_name,
                   status = excluded.status,
                   current_step_idx = excluded.current_step_idx,
                   updated_at = excluded.updated_at,
                   completed_at = excluded.completed_at,
                   error = excluded.error"#,
        )
        .bind(state.run_id.to_string())
        .bind(&state.workflow_id)
        .bind(&state.workflow_name)
        .bind(state.status.as_str())
        .bind(i64::try_from(state.current_step_idx).unwrap_or(i64::MAX))
        .bind(format_datetime(&state.started_at))
        .bind(format_datetime(&state.updated_at))
        .bind(state.completed_at.as_ref().map(format_datetime))
        .bind(&state.error)
        .execute(&mut *tx)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        for (step_id, result) in &state.step_results {
            bind_step(&state.run_id, step_id, result)
                .execute(&mut *tx)
                .await
                .map_err(|e| RepositoryError::Query(e.to_string()))?;
        }

        tx.commit()
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        tracing::debug!(
            run_id = %state.run_id,
            steps = state.step_results.len(),
            "saved run checkpoint"
        );
        Ok(())
    }

    async fn load_run(&self, run_id: &Uuid) -> Result<RunState, RepositoryError> {
        let row = sqlx::query("SELECT * FROM workflow_runs WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_optional(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?
            .ok_or(RepositoryError::NotFound)?;

        let summary = RunRow::from_row(&row)
            .map_err(|e| RepositoryError::Query(e.to_string()))?
            .into_summary()?;

        let step_rows = sqlx::query("SELECT * FROM workflow_step_results WHERE run_id = ?")
            .bind(run_id.to_string())
            .fetch_all(&self.pool.reader)
            .await
            .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut step_results = std::collections::HashMap::with_capacity(step_rows.len());
        for row in &step_rows {
            let (step_id, result) = StepRow::from_row(row)
                .map_err(|e| RepositoryError::Query(e.to_string()))?
                .into_result()?;
            step_results.insert(step_id, result);
        }

        Ok(RunState {
            run_id: summary.run_id,
            workflow_id: summary.workflow_id,
            workflow_name: summary.workflow_name,
            status: summary.status,
            current_step_idx: summary.current_step_idx,
            started_at: summary.started_at,
            updated_at: summary.updated_at,
            completed_at: summary.completed_at,
            error: summary.error,
            step_results,
        })
    }

    async fn list_runs(&self, limit: u32) -> Result<Vec<RunSummary>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT * FROM workflow_runs ORDER BY started_at DESC, run_id DESC LIMIT ?",
        )
        .bind(i64::from(limit))
        .fetch_all(&self.pool.reader)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            let r = RunRow::from_row(row).map_err(|e| RepositoryError::Query(e.to_string()))?;
            runs.push(r.into_summary()?);
        }
        Ok(runs)
    }

    async fn update_step_result(
        &self,
        run_id: &Uuid,
        step_id: &str,
        result: &StepResult,
    ) -> Result<(), RepositoryError> {
        bind_step(run_id, step_id, result)
            .execute(&self.pool.writer)
            .await
            .map_err(query_error)?;
        Ok(())
    }

    async fn acquire_lease(
        &self,
        run_id: &Uuid,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, RepositoryError> {
        let now = Utc::now();
        let ttl_ms = i64::try_from(ttl.as_millis()).unwrap_or(i64::MAX);
        let expires_at = unix_millis(now).saturating_add(ttl_ms);

        let result = sqlx::query(
            r#"INSERT INTO workflow_run_leases (run_id, holder, expires_at)
               VALUES (?, ?, ?)
               ON CONFLICT(run_id) DO UPDATE SET
                   holder = excluded.holder,
                   expires_at = excluded.expires_at
               WHERE workflow_run_leases.expires_at <= ?
                  OR workflow_run_leases.holder = excluded.holder"#,
        )
        .bind(run_id.to_string())
        .bind(holder)
        .bind(expires_at)
        .bind(unix_millis(now))
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;

        Ok(result.rows_affected() > 0)
    }

    async fn release_lease(
        &self,
        run_id: &Uuid,
        holder: Option<&str>,
    ) -> Result<(), RepositoryError> {
        sqlx::query(
            "DELETE FROM workflow_run_leases WHERE run_id = ? AND (? IS NULL OR holder = ?)",
        )
        .bind(run_id.to_string())
        .bind(holder)
        .bind(holder)
        .execute(&self.pool.writer)
        .await
        .map_err(|e| RepositoryError::Query(e.to_string()))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
