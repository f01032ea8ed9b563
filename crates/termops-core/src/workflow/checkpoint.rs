//! Durable checkpoint manager for workflow execution state.
//!
//! Wraps `CheckpointStore` to provide the higher-level API the engine uses:
//! a full-state checkpoint after every step transition, incremental attempt
//! records between retries, run lookups, and run leases.

use std::time::Duration;

use termops_types::error::RepositoryError;
use termops_types::workflow::{RunState, StepResult};
use uuid::Uuid;

use crate::repository::checkpoint::CheckpointStore;

// ---------------------------------------------------------------------------
// CheckpointManager
// ---------------------------------------------------------------------------

/// Manages durable execution checkpoints for workflow runs.
///
/// Generic over `S: CheckpointStore` so it works with any storage backend
/// (SQLite, in-memory mock, etc.). Every state transition is persisted before
/// the engine moves forward.
pub struct CheckpointManager<S: CheckpointStore> {
    store: S,
}

impl<S: CheckpointStore> CheckpointManager<S> {
    /// Create a new checkpoint manager backed by the given store.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Persist the full run state (run row plus every step result).
    pub async fn checkpoint(&self, state: &RunState) -> Result<(), CheckpointError> {
        self.store.save_run(state).await?;

        tracing::debug!(
            run_id = %state.run_id,
            status = %state.status,
            current_step_idx = state.current_step_idx,
            "checkpointed run"
        );
        Ok(())
    }

    /// Persist one step's in-progress result between retry attempts.
    pub async fn record_attempt(
        &self,
        run_id: Uuid,
        step_id: &str,
        result: &StepResult,
    ) -> Result<(), CheckpointError> {
        self.store.update_step_result(&run_id, step_id, result).await?;

        tracing::debug!(
            run_id = %run_id,
            step_id,
            retries = result.retries,
            "checkpointed step attempt"
        );
        Ok(())
    }

    /// Load a run, mapping a missing row to `CheckpointError::RunNotFound`.
    pub async fn load(&self, run_id: Uuid) -> Result<RunState, CheckpointError> {
        match self.store.load_run(&run_id).await {
            Ok(state) => Ok(state),
            Err(RepositoryError::NotFound) => Err(CheckpointError::RunNotFound(run_id)),
            Err(e) => Err(CheckpointError::Store(e)),
        }
    }

    /// Take or renew the run lease for `holder`.
    pub async fn acquire_lease(
        &self,
        run_id: Uuid,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, CheckpointError> {
        let acquired = self.store.acquire_lease(&run_id, holder, ttl).await?;
        tracing::debug!(run_id = %run_id, holder, acquired, ttl_secs = ttl.as_secs(), "run lease");
        Ok(acquired)
    }

    /// Release the run lease held by `holder` (any holder when `None`).
    pub async fn release_lease(
        &self,
        run_id: Uuid,
        holder: Option<&str>,
    ) -> Result<(), CheckpointError> {
        self.store.release_lease(&run_id, holder).await?;
        tracing::debug!(run_id = %run_id, ?holder, "released run lease");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during checkpoint operations.
#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    /// Underlying store operation failed.
    #[error("checkpoint store error: {0}")]
    Store(#[from] RepositoryError),

    /// Workflow run not found.
    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
