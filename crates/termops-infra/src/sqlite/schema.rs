//! Workflow tables and indexes.
//!
//! The database file is shared with the command-history subsystem, so the
//! schema is applied with `IF NOT EXISTS` statements instead of a migration
//! table. Applying it is idempotent and safe from concurrent processes.

use sqlx::SqlitePool;

const STATEMENTS: &[&str] = &[
    r#"CREATE TABLE IF NOT EXISTS workflow_runs (
        run_id           TEXT PRIMARY KEY NOT NULL,
        workflow_id      TEXT NOT NULL,
        workflow_name    TEXT NOT NULL,
        status           TEXT NOT NULL,
        current_step_idx INTEGER NOT NULL DEFAULT 0,
        started_at       TEXT NOT NULL,
        updated_at       TEXT NOT NULL,
        completed_at     TEXT,
        error            TEXT
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_workflow_runs_status ON workflow_runs(status)",
    "CREATE INDEX IF NOT EXISTS idx_workflow_runs_started_at ON workflow_runs(started_at)",
    r#"CREATE TABLE IF NOT EXISTS workflow_step_results (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        run_id       TEXT NOT NULL REFERENCES workflow_runs(run_id) ON DELETE CASCADE,
        step_id      TEXT NOT NULL,
        status       TEXT NOT NULL,
        exit_code    INTEGER,
        output       TEXT NOT NULL DEFAULT '',
        error        TEXT,
        retries      INTEGER NOT NULL DEFAULT 0,
        started_at   TEXT,
        completed_at TEXT,
        duration_ms  INTEGER NOT NULL DEFAULT 0,
        UNIQUE(run_id, step_id)
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_workflow_step_results_run_id ON workflow_step_results(run_id)",
    r#"CREATE TABLE IF NOT EXISTS workflow_run_leases (
        run_id     TEXT PRIMARY KEY NOT NULL,
        holder     TEXT NOT NULL,
        expires_at INTEGER NOT NULL
    )"#,
];

/// Create workflow tables and indexes if they are absent.
pub async fn apply(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    for statement in STATEMENTS {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
