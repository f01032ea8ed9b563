//! Checkpoint store trait definition.
//!
//! The sole owner of durable workflow state. The engine writes a full
//! `RunState` after every step transition and reads it back on resume or
//! rollback. The infrastructure layer implements this with SQLite.

use std::time::Duration;

use termops_types::error::RepositoryError;
use termops_types::workflow::{RunState, RunSummary, StepResult};
use uuid::Uuid;

/// Repository trait for run checkpoints.
///
/// Every write is transactional: a failed write leaves previously committed
/// rows untouched.
///
/// Uses native async fn in traits (Rust 2024 edition, no async_trait macro).
pub trait CheckpointStore: Send + Sync {
    /// Create tables and indexes if absent. Idempotent and non-destructive.
    fn init_schema(&self) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Upsert the run row and every step result in a single transaction.
    fn save_run(
        &self,
        state: &RunState,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Reconstruct a run including its step-result map.
    ///
    /// Returns `RepositoryError::NotFound` if the run does not exist.
    fn load_run(
        &self,
        run_id: &Uuid,
    ) -> impl std::future::Future<Output = Result<RunState, RepositoryError>> + Send;

    /// Most recent runs first.
    fn list_runs(
        &self,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<RunSummary>, RepositoryError>> + Send;

    /// Upsert a single step result, used between retry attempts.
    fn update_step_result(
        &self,
        run_id: &Uuid,
        step_id: &str,
        result: &StepResult,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;

    /// Take or renew the exclusive lease on a run.
    ///
    /// Returns `true` when no lease exists, the existing lease expired, or it
    /// is already held by `holder`; `false` when another holder owns it.
    fn acquire_lease(
        &self,
        run_id: &Uuid,
        holder: &str,
        ttl: Duration,
    ) -> impl std::future::Future<Output = Result<bool, RepositoryError>> + Send;

    /// Release the lease held by `holder`, or any lease when `holder` is `None`.
    fn release_lease(
        &self,
        run_id: &Uuid,
        holder: Option<&str>,
    ) -> impl std::future::Future<Output = Result<(), RepositoryError>> + Send;
}
