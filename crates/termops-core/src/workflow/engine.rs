//! Workflow engine: the run/resume/rollback state machine.
//!
//! Steps run strictly in order on the caller's task. After every step the
//! full `RunState` is checkpointed, so a run survives process death and can
//! be continued with `resume` from its cursor (`current_step_idx`).
//!
//! # Execution flow
//!
//! 1. Take the run lease (or fail with `RunLocked`).
//! 2. Create a fresh `RunState` (run) or load the persisted one (resume).
//! 3. For each step from the cursor: check cancellation, renew the lease,
//!    evaluate the condition, run the command with retries, checkpoint.
//! 4. Stop at the first failed step; otherwise mark the run completed.
//! 5. Release the lease on every exit path.
//!
//! Cancellation is only observed between steps. A command that is already
//! running finishes (or times out) before the run pauses.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::Utc;
use serde_json::{Value, json};
use termops_types::config::EngineConfig;
use termops_types::event::{Event, EventType};
use termops_types::workflow::{
    RunResult, RunState, RunStatus, Step, StepResult, StepStatus, Workflow,
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::event::bus::EventBus;
use crate::repository::checkpoint::CheckpointStore;
use crate::runner::CommandRunner;

use super::checkpoint::{CheckpointError, CheckpointManager};
use super::expression::{condition_context, process_env};
use super::retry::RetryHandler;
use super::step_executor::StepExecutor;

/// `source` field of every event the engine publishes.
pub const EVENT_SOURCE: &str = "engine";

/// Slack added to every lease TTL on top of the step's worst-case duration.
pub const LEASE_MARGIN: Duration = Duration::from_secs(60);

// ---------------------------------------------------------------------------
// Options and errors
// ---------------------------------------------------------------------------

/// Engine tunables, usually derived from `EngineConfig`.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Timeout for steps that do not declare `timeout_secs`.
    pub default_timeout: Duration,
    /// Ceiling on captured output per step.
    pub max_output_bytes: usize,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for EngineOptions {
    fn from(config: &EngineConfig) -> Self {
        Self {
            default_timeout: Duration::from_secs(config.step_timeout_secs),
            max_output_bytes: config.max_output_bytes,
        }
    }
}

/// Errors that abort a run/resume/rollback invocation.
///
/// Step failures are not errors: they produce a `failed` `RunResult`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// The checkpoint store failed; the persisted state is whatever was last
    /// committed.
    #[error(transparent)]
    Checkpoint(CheckpointError),

    #[error("workflow run not found: {0}")]
    RunNotFound(Uuid),

    /// The loaded run does not belong to the supplied workflow definition.
    #[error("workflow mismatch: {0}")]
    WorkflowMismatch(String),

    /// Another process holds the run lease.
    #[error("workflow run {0} is locked by another process")]
    RunLocked(Uuid),

    /// The run has steps that were already undone; only `rollback` may
    /// continue it.
    #[error("workflow run {0} is partially rolled back")]
    PartiallyRolledBack(Uuid),
}

impl From<CheckpointError> for EngineError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::RunNotFound(id) => EngineError::RunNotFound(id),
            other => EngineError::Checkpoint(other),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// Sequential workflow engine with durable checkpointing.
///
/// Generic over the checkpoint store and the command runner. Observers hook
/// in through the `EventBus`; handlers must not call back into the engine.
pub struct Engine<S: CheckpointStore, C: CommandRunner> {
    checkpoints: CheckpointManager<S>,
    executor: StepExecutor<C>,
    bus: EventBus,
    holder: String,
    env: HashMap<String, String>,
}

impl<S: CheckpointStore, C: CommandRunner> Engine<S, C> {
    pub fn new(store: S, runner: C, bus: EventBus, options: EngineOptions) -> Self {
        Self {
            checkpoints: CheckpointManager::new(store),
            executor: StepExecutor::new(runner, options.default_timeout, options.max_output_bytes),
            bus,
            holder: format!("{}:{}", std::process::id(), Uuid::now_v7()),
            env: process_env(),
        }
    }

    /// Replace the environment snapshot exposed to step conditions as `env`.
    pub fn with_env(mut self, env: HashMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    // -----------------------------------------------------------------------
    // Entry points
    // -----------------------------------------------------------------------

    /// Start a fresh run of `workflow`.
    pub async fn run(
        &self,
        workflow: &Workflow,
        cancel: &CancellationToken,
    ) -> Result<RunResult, EngineError> {
        let started = Instant::now();
        let mut state = RunState::new(workflow);
        let run_id = state.run_id;

        self.renew_lease(run_id, LEASE_MARGIN).await?;
        let outcome = self.start_run(workflow, &mut state, cancel, started).await;
        self.release(run_id).await;
        outcome
    }

    /// Continue a persisted run from its cursor.
    ///
    /// Runs that already finished (`completed`, `rolledback`) are returned
    /// unchanged. A `running` run is treated as crashed, since its lease was
    /// free. A run with any rolled-back step is refused with
    /// `PartiallyRolledBack`.
    pub async fn resume(
        &self,
        workflow: &Workflow,
        run_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<RunResult, EngineError> {
        let started = Instant::now();
        self.renew_lease(run_id, LEASE_MARGIN).await?;
        let outcome = self.resume_run(workflow, run_id, cancel, started).await;
        self.release(run_id).await;
        outcome
    }

    /// Undo the successful steps before the cursor, in reverse order.
    pub async fn rollback(
        &self,
        workflow: &Workflow,
        run_id: Uuid,
        cancel: &CancellationToken,
    ) -> Result<RunResult, EngineError> {
        let started = Instant::now();
        self.renew_lease(run_id, LEASE_MARGIN).await?;
        let outcome = self.rollback_run(workflow, run_id, cancel, started).await;
        self.release(run_id).await;
        outcome
    }

    async fn start_run(
        &self,
        workflow: &Workflow,
        state: &mut RunState,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<RunResult, EngineError> {
        self.checkpoints.checkpoint(state).await?;
        tracing::info!(
            run_id = %state.run_id,
            workflow_id = %workflow.id,
            steps = workflow.steps.len(),
            "workflow run started"
        );
        self.publish_start(workflow, state, false);
        self.step_loop(workflow, state, cancel, started).await
    }

    async fn resume_run(
        &self,
        workflow: &Workflow,
        run_id: Uuid,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<RunResult, EngineError> {
        let mut state = self.checkpoints.load(run_id).await?;
        verify_workflow(workflow, &state)?;

        if !state.status.is_resumable() {
            tracing::info!(run_id = %run_id, status = %state.status, "run already finished");
            return Ok(stored_result(&state));
        }
        if state
            .step_results
            .values()
            .any(|r| r.status == StepStatus::RolledBack)
        {
            return Err(EngineError::PartiallyRolledBack(run_id));
        }

        let resumed_from = state.status;
        state.status = RunStatus::Running;
        state.error = None;
        state.completed_at = None;
        state.touch();
        self.checkpoints.checkpoint(&state).await?;

        tracing::info!(
            run_id = %run_id,
            from_status = %resumed_from,
            start_idx = state.current_step_idx,
            "workflow run resumed"
        );
        self.publish_start(workflow, &state, true);
        self.step_loop(workflow, &mut state, cancel, started).await
    }

    async fn rollback_run(
        &self,
        workflow: &Workflow,
        run_id: Uuid,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<RunResult, EngineError> {
        let mut state = self.checkpoints.load(run_id).await?;
        verify_workflow(workflow, &state)?;

        if state.status == RunStatus::RolledBack {
            return Ok(stored_result(&state));
        }
        tracing::info!(run_id = %run_id, cursor = state.current_step_idx, "rollback started");
        self.reverse_loop(workflow, &mut state, cancel, started).await
    }

    // -----------------------------------------------------------------------
    // Forward execution
    // -----------------------------------------------------------------------

    /// The step loop shared by `run` and `resume`.
    async fn step_loop(
        &self,
        workflow: &Workflow,
        state: &mut RunState,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<RunResult, EngineError> {
        for idx in state.current_step_idx..workflow.steps.len() {
            let step = &workflow.steps[idx];

            if cancel.is_cancelled() {
                state.status = RunStatus::Paused;
                state.current_step_idx = idx;
                state.touch();
                self.checkpoints.checkpoint(state).await?;
                tracing::info!(run_id = %state.run_id, next_step = %step.id, "workflow run paused");
                self.publish_complete(state, started);
                return Ok(run_result(state, started));
            }

            self.renew_lease(state.run_id, self.step_lease_ttl(step)).await?;

            self.publish(
                EventType::WorkflowStep,
                state,
                Some(step),
                json!({ "phase": "start", "index": idx, "name": step.name }),
            );

            let result = self.execute_step(workflow, step, state).await?;
            let failed = result.status == StepStatus::Failed;

            if result.status.advances_cursor() {
                state.current_step_idx = idx + 1;
            }
            if failed {
                state.status = RunStatus::Failed;
                state.error = Some(format!(
                    "step '{}' failed: {}",
                    step.id,
                    result.error.as_deref().unwrap_or("unknown error")
                ));
                state.completed_at = Some(Utc::now());
            }
            state.step_results.insert(step.id.clone(), result.clone());
            state.touch();

            self.publish(
                EventType::WorkflowStep,
                state,
                Some(step),
                json!({
                    "phase": "finish",
                    "index": idx,
                    "name": step.name,
                    "status": result.status.as_str(),
                    "exit_code": result.exit_code,
                    "retries": result.retries,
                    "duration_ms": result.duration_ms,
                }),
            );

            self.checkpoints.checkpoint(state).await?;
            self.publish_checkpoint(state);

            if failed {
                tracing::warn!(
                    run_id = %state.run_id,
                    step_id = %step.id,
                    exit_code = ?result.exit_code,
                    error = ?result.error,
                    "workflow run failed"
                );
                self.publish_complete(state, started);
                return Ok(run_result(state, started));
            }
        }

        state.status = RunStatus::Completed;
        state.error = None;
        state.completed_at = Some(Utc::now());
        state.touch();
        self.checkpoints.checkpoint(state).await?;
        tracing::info!(run_id = %state.run_id, "workflow run completed");
        self.publish_complete(state, started);
        Ok(run_result(state, started))
    }

    /// Evaluate the condition and run the command with retries.
    ///
    /// Attempt failures are absorbed here; only store failures escape.
    async fn execute_step(
        &self,
        workflow: &Workflow,
        step: &Step,
        state: &RunState,
    ) -> Result<StepResult, EngineError> {
        let step_start = Instant::now();

        if let Some(condition) = &step.condition {
            let context = condition_context(workflow, state, &self.env);
            match self.executor.evaluate_condition(condition, &context) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!(run_id = %state.run_id, step_id = %step.id, "condition false, skipping step");
                    return Ok(StepResult::skipped());
                }
                Err(e) => {
                    tracing::warn!(run_id = %state.run_id, step_id = %step.id, error = %e, "condition evaluation failed");
                    let mut result = StepResult::started();
                    result.status = StepStatus::Failed;
                    result.error = Some(format!("condition error: {e}"));
                    result.completed_at = Some(Utc::now());
                    return Ok(result);
                }
            }
        }

        let mut result = StepResult::started();

        // Rollback-only steps have nothing to do on the forward pass.
        let Some(command) = step.command.as_deref() else {
            result.status = StepStatus::Success;
            result.exit_code = Some(0);
            result.completed_at = result.started_at;
            return Ok(result);
        };

        let timeout = self.executor.timeout_for(step);
        let policy = step.retry.as_ref();
        let mut attempt = 1;
        loop {
            let outcome = self.executor.run_command(command, timeout).await;
            result.exit_code = outcome.exit_code;
            result.output = outcome.output;
            result.error = outcome.error;
            result.retries = attempt - 1;

            if result.exit_code == Some(0) {
                result.status = StepStatus::Success;
                break;
            }
            if !RetryHandler::should_retry(policy, attempt) {
                result.status = StepStatus::Failed;
                break;
            }

            tracing::warn!(
                run_id = %state.run_id,
                step_id = %step.id,
                attempt,
                exit_code = ?result.exit_code,
                error = ?result.error,
                "step attempt failed, retrying"
            );
            self.checkpoints
                .record_attempt(state.run_id, &step.id, &result)
                .await?;

            if let Some(policy) = policy {
                let delay = RetryHandler::backoff_delay(policy, attempt);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
            attempt += 1;
        }

        result.completed_at = Some(Utc::now());
        result.duration_ms = step_start.elapsed().as_millis() as u64;
        tracing::debug!(
            run_id = %state.run_id,
            step_id = %step.id,
            status = %result.status,
            retries = result.retries,
            duration_ms = result.duration_ms,
            "step finished"
        );
        Ok(result)
    }

    // -----------------------------------------------------------------------
    // Reverse execution
    // -----------------------------------------------------------------------

    async fn reverse_loop(
        &self,
        workflow: &Workflow,
        state: &mut RunState,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<RunResult, EngineError> {
        let end = state.current_step_idx.min(workflow.steps.len());
        let mut rolled_back = Vec::new();
        let mut failed = Vec::new();

        for idx in (0..end).rev() {
            let step = &workflow.steps[idx];
            let Some(undo) = step.rollback.as_deref() else {
                continue;
            };
            let succeeded = state
                .step_results
                .get(&step.id)
                .is_some_and(|r| r.status == StepStatus::Success);
            if !succeeded {
                continue;
            }

            if cancel.is_cancelled() {
                tracing::info!(run_id = %state.run_id, next_step = %step.id, "rollback interrupted");
                return Ok(RunResult {
                    run_id: state.run_id,
                    status: RunStatus::Paused,
                    duration: started.elapsed(),
                    error: None,
                });
            }

            let timeout = self.executor.timeout_for(step);
            self.renew_lease(state.run_id, timeout + LEASE_MARGIN).await?;

            let attempt = self.executor.run_command(undo, timeout).await;
            let status = if attempt.succeeded() {
                StepStatus::RolledBack
            } else {
                StepStatus::Failed
            };

            if let Some(result) = state.step_results.get_mut(&step.id) {
                if attempt.succeeded() {
                    result.status = StepStatus::RolledBack;
                    result.error = None;
                    rolled_back.push(step.id.clone());
                } else {
                    // Status stays `success` so a later rollback retries it.
                    result.error = Some(format!(
                        "rollback failed: {}",
                        attempt.error.as_deref().unwrap_or("unknown error")
                    ));
                    failed.push(step.id.clone());
                    tracing::warn!(
                        run_id = %state.run_id,
                        step_id = %step.id,
                        exit_code = ?attempt.exit_code,
                        error = ?attempt.error,
                        "rollback command failed"
                    );
                }
            }
            state.touch();
            self.checkpoints.checkpoint(state).await?;

            self.publish(
                EventType::WorkflowStep,
                state,
                Some(step),
                json!({
                    "phase": "rollback",
                    "index": idx,
                    "name": step.name,
                    "status": status.as_str(),
                    "exit_code": attempt.exit_code,
                    "duration_ms": attempt.duration.as_millis() as u64,
                }),
            );
            self.publish_checkpoint(state);
        }

        if failed.is_empty() {
            state.status = RunStatus::RolledBack;
            state.error = None;
        } else {
            state.status = RunStatus::Failed;
            state.error = Some(format!("rollback failed for steps: {}", failed.join(", ")));
        }
        state.completed_at = Some(Utc::now());
        state.touch();
        self.checkpoints.checkpoint(state).await?;

        tracing::info!(
            run_id = %state.run_id,
            status = %state.status,
            rolled_back = rolled_back.len(),
            failed = failed.len(),
            "rollback finished"
        );
        self.publish(
            EventType::WorkflowRollback,
            state,
            None,
            json!({
                "status": state.status.as_str(),
                "rolled_back": rolled_back,
                "failed": failed,
            }),
        );
        Ok(run_result(state, started))
    }

    // -----------------------------------------------------------------------
    // Leases
    // -----------------------------------------------------------------------

    /// Worst-case wall time of a step plus margin.
    fn step_lease_ttl(&self, step: &Step) -> Duration {
        let policy = step.retry.as_ref();
        self.executor
            .timeout_for(step)
            .saturating_mul(RetryHandler::max_attempts(policy))
            .saturating_add(RetryHandler::total_backoff(policy))
            .saturating_add(LEASE_MARGIN)
    }

    async fn renew_lease(&self, run_id: Uuid, ttl: Duration) -> Result<(), EngineError> {
        if self.checkpoints.acquire_lease(run_id, &self.holder, ttl).await? {
            Ok(())
        } else {
            Err(EngineError::RunLocked(run_id))
        }
    }

    async fn release(&self, run_id: Uuid) {
        if let Err(e) = self.checkpoints.release_lease(run_id, Some(&self.holder)).await {
            tracing::warn!(run_id = %run_id, error = %e, "failed to release run lease");
        }
    }

    // -----------------------------------------------------------------------
    // Events
    // -----------------------------------------------------------------------

    fn publish(&self, event_type: EventType, state: &RunState, step: Option<&Step>, data: Value) {
        let mut event = Event::new(event_type, EVENT_SOURCE, data).with_run(state.run_id);
        if let Some(step) = step {
            event = event.with_step(step.id.clone());
        }
        self.bus.publish(event);
    }

    fn publish_start(&self, workflow: &Workflow, state: &RunState, resumed: bool) {
        self.publish(
            EventType::WorkflowStart,
            state,
            None,
            json!({
                "workflow_id": workflow.id,
                "workflow_name": workflow.name,
                "steps": workflow.steps.len(),
                "resumed": resumed,
                "start_idx": state.current_step_idx,
            }),
        );
    }

    fn publish_checkpoint(&self, state: &RunState) {
        self.publish(
            EventType::WorkflowCheckpoint,
            state,
            None,
            json!({
                "current_step_idx": state.current_step_idx,
                "status": state.status.as_str(),
            }),
        );
    }

    fn publish_complete(&self, state: &RunState, started: Instant) {
        self.publish(
            EventType::WorkflowComplete,
            state,
            None,
            json!({
                "status": state.status.as_str(),
                "error": state.error,
                "duration_ms": started.elapsed().as_millis() as u64,
            }),
        );
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn verify_workflow(workflow: &Workflow, state: &RunState) -> Result<(), EngineError> {
    if state.workflow_id != workflow.id {
        return Err(EngineError::WorkflowMismatch(format!(
            "run {} belongs to workflow '{}', not '{}'",
            state.run_id, state.workflow_id, workflow.id
        )));
    }
    if state.current_step_idx > workflow.steps.len() {
        return Err(EngineError::WorkflowMismatch(format!(
            "run {} is at step {} but workflow '{}' has {} steps",
            state.run_id,
            state.current_step_idx,
            workflow.id,
            workflow.steps.len()
        )));
    }
    Ok(())
}

fn run_result(state: &RunState, started: Instant) -> RunResult {
    RunResult {
        run_id: state.run_id,
        status: state.status,
        duration: started.elapsed(),
        error: state.error.clone(),
    }
}

fn stored_result(state: &RunState) -> RunResult {
    RunResult {
        run_id: state.run_id,
        status: state.status,
        duration: state.summary().duration(),
        error: state.error.clone(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryStore, Scripted, ScriptedRunner, sample_workflow, step};
    use std::sync::{Arc, Mutex};
    use termops_types::workflow::{Backoff, RetryPolicy};

    fn engine(store: &MemoryStore, runner: &ScriptedRunner) -> Engine<MemoryStore, ScriptedRunner> {
        Engine::new(
            store.clone(),
            runner.clone(),
            EventBus::default(),
            EngineOptions {
                default_timeout: Duration::from_secs(5),
                max_output_bytes: 1024,
            },
        )
        .with_env(HashMap::from([("STAGE".to_string(), "prod".to_string())]))
    }

    fn deploy_workflow() -> Workflow {
        let mut wf = sample_workflow(&["build", "push", "deploy"]);
        wf.id = "deploy".to_string();
        wf.name = "deploy".to_string();
        wf
    }

    fn fail(code: i32) -> Vec<Scripted> {
        vec![Scripted::Exit(code, format!("exit {code}"))]
    }

    #[tokio::test]
    async fn run_completes_all_steps_in_order() {
        let store = MemoryStore::new();
        let runner = ScriptedRunner::new();
        let engine = engine(&store, &runner);
        let wf = deploy_workflow();

        let result = engine.run(&wf, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(runner.invocations(), vec!["run build", "run push", "run deploy"]);

        let state = store.run(result.run_id).unwrap();
        assert_eq!(state.current_step_idx, 3);
        assert!(state.completed_at.is_some());
        assert!(state.step_results.values().all(|r| r.status == StepStatus::Success));
        assert_eq!(store.lease_holder(result.run_id), None);
    }

    #[tokio::test]
    async fn failed_step_halts_run_with_cursor_on_it() {
        let store = MemoryStore::new();
        let runner = ScriptedRunner::new();
        runner.script("run push", fail(1));
        let engine = engine(&store, &runner);

        let result = engine
            .run(&deploy_workflow(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert!(result.error.unwrap().contains("push"));
        assert_eq!(runner.count("run deploy"), 0);

        let state = store.run(result.run_id).unwrap();
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.current_step_idx, 1);
        assert_eq!(state.step_results["build"].status, StepStatus::Success);
        assert_eq!(state.step_results["push"].status, StepStatus::Failed);
        assert_eq!(state.step_results["push"].exit_code, Some(1));
        assert!(!state.step_results.contains_key("deploy"));
    }

    #[tokio::test]
    async fn retry_exhaustion_runs_max_attempts() {
        let store = MemoryStore::new();
        let runner = ScriptedRunner::new();
        runner.script("run flaky", fail(2));
        let mut wf = sample_workflow(&["flaky", "after"]);
        wf.steps[0].retry = Some(RetryPolicy {
            max_attempts: 3,
            delay_ms: 0,
            backoff: Backoff::Fixed,
        });
        let engine = engine(&store, &runner);

        let result = engine.run(&wf, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(runner.count("run flaky"), 3);
        assert_eq!(runner.count("run after"), 0);

        let state = store.run(result.run_id).unwrap();
        let flaky = &state.step_results["flaky"];
        assert_eq!(flaky.retries, 2);
        assert_eq!(flaky.status, StepStatus::Failed);
        assert_eq!(state.current_step_idx, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_recovers_after_transient_failure() {
        let store = MemoryStore::new();
        let runner = ScriptedRunner::new();
        runner.script(
            "run flaky",
            vec![
                Scripted::Exit(1, "first".to_string()),
                Scripted::Exit(0, "second".to_string()),
            ],
        );
        let mut wf = sample_workflow(&["flaky"]);
        wf.steps[0].retry = Some(RetryPolicy {
            max_attempts: 3,
            delay_ms: 500,
            backoff: Backoff::Exponential,
        });
        let engine = engine(&store, &runner);

        let result = engine.run(&wf, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        let state = store.run(result.run_id).unwrap();
        let flaky = &state.step_results["flaky"];
        assert_eq!(flaky.retries, 1);
        assert_eq!(flaky.output, "second");
    }

    #[tokio::test]
    async fn attempt_history_is_persisted_between_retries() {
        let store = MemoryStore::new();
        let runner = ScriptedRunner::new();
        runner.script("run flaky", fail(1));
        let mut wf = sample_workflow(&["flaky"]);
        wf.steps[0].retry = Some(RetryPolicy::default());
        // Initial save succeeds; the post-step checkpoint fails.
        store.fail_saves_after(1);
        let engine = engine(&store, &runner);

        let err = engine.run(&wf, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::Checkpoint(_)));

        let run_id = store.run_ids()[0];
        let state = store.run(run_id).unwrap();
        assert_eq!(state.status, RunStatus::Running);
        // Last recorded attempt before the final one.
        assert_eq!(state.step_results["flaky"].retries, 1);
    }

    #[tokio::test]
    async fn false_condition_skips_without_running() {
        let store = MemoryStore::new();
        let runner = ScriptedRunner::new();
        let mut wf = sample_workflow(&["probe", "gated"]);
        wf.steps[1].condition = Some("env.STAGE == 'dev'".to_string());
        let engine = engine(&store, &runner);

        let result = engine.run(&wf, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(runner.count("run gated"), 0);

        let state = store.run(result.run_id).unwrap();
        assert_eq!(state.step_results["gated"].status, StepStatus::Skipped);
        assert_eq!(state.step_results["gated"].retries, 0);
        assert_eq!(state.current_step_idx, 2);
    }

    #[tokio::test]
    async fn condition_sees_prior_step_results() {
        let store = MemoryStore::new();
        let runner = ScriptedRunner::new();
        runner.script("run probe", vec![Scripted::Exit(0, "status: READY".to_string())]);
        let mut wf = sample_workflow(&["probe", "gated"]);
        wf.steps[1].condition = Some(
            "steps.probe.exit_code == 0 && steps.probe.output|contains('READY')".to_string(),
        );
        let engine = engine(&store, &runner);

        let result = engine.run(&wf, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert_eq!(runner.count("run gated"), 1);
    }

    #[tokio::test]
    async fn condition_error_fails_step_without_retry() {
        let store = MemoryStore::new();
        let runner = ScriptedRunner::new();
        let mut wf = sample_workflow(&["gated"]);
        wf.steps[0].condition = Some("env.STAGE ==".to_string());
        wf.steps[0].retry = Some(RetryPolicy::default());
        let engine = engine(&store, &runner);

        let result = engine.run(&wf, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert!(runner.invocations().is_empty());
        let state = store.run(result.run_id).unwrap();
        assert!(state.step_results["gated"].error.as_ref().unwrap().contains("condition"));
    }

    #[tokio::test]
    async fn rollback_only_step_succeeds_without_process() {
        let store = MemoryStore::new();
        let runner = ScriptedRunner::new();
        let mut wf = sample_workflow(&["guard"]);
        wf.steps[0].command = None;
        wf.steps[0].rollback = Some("cleanup".to_string());
        let engine = engine(&store, &runner);

        let result = engine.run(&wf, &CancellationToken::new()).await.unwrap();
        assert_eq!(result.status, RunStatus::Completed);
        assert!(runner.invocations().is_empty());
        let state = store.run(result.run_id).unwrap();
        assert_eq!(state.step_results["guard"].exit_code, Some(0));
    }

    #[tokio::test]
    async fn cancellation_pauses_before_next_step() {
        let store = MemoryStore::new();
        let runner = ScriptedRunner::new();
        let cancel = CancellationToken::new();
        runner.cancel_on("run push", cancel.clone());
        let engine = engine(&store, &runner);

        let result = engine.run(&deploy_workflow(), &cancel).await.unwrap();
        assert_eq!(result.status, RunStatus::Paused);
        assert_eq!(result.error, None);
        // The in-flight step finished before the pause took effect.
        assert_eq!(runner.invocations(), vec!["run build", "run push"]);

        let state = store.run(result.run_id).unwrap();
        assert_eq!(state.status, RunStatus::Paused);
        assert_eq!(state.current_step_idx, 2);
        assert!(!state.step_results.contains_key("deploy"));
        assert!(state.completed_at.is_none());
    }

    #[tokio::test]
    async fn resume_matches_uninterrupted_run() {
        let wf = deploy_workflow();

        let straight_store = MemoryStore::new();
        let straight = engine(&straight_store, &ScriptedRunner::new())
            .run(&wf, &CancellationToken::new())
            .await
            .unwrap();

        let store = MemoryStore::new();
        let runner = ScriptedRunner::new();
        let cancel = CancellationToken::new();
        runner.cancel_on("run build", cancel.clone());
        let engine = engine(&store, &runner);
        let paused = engine.run(&wf, &cancel).await.unwrap();
        assert_eq!(paused.status, RunStatus::Paused);

        let resumed = engine
            .resume(&wf, paused.run_id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resumed.status, RunStatus::Completed);
        assert_eq!(resumed.run_id, paused.run_id);
        for cmd in ["run build", "run push", "run deploy"] {
            assert_eq!(runner.count(cmd), 1, "{cmd} should run exactly once");
        }

        let a = straight_store.run(straight.run_id).unwrap();
        let b = store.run(paused.run_id).unwrap();
        assert_eq!(a.current_step_idx, b.current_step_idx);
        for id in ["build", "push", "deploy"] {
            assert_eq!(a.step_results[id].status, b.step_results[id].status);
            assert_eq!(a.step_results[id].exit_code, b.step_results[id].exit_code);
            assert_eq!(a.step_results[id].output, b.step_results[id].output);
        }
    }

    #[tokio::test]
    async fn resume_failed_run_reexecutes_failed_step_only() {
        let store = MemoryStore::new();
        let runner = ScriptedRunner::new();
        runner.script(
            "run push",
            vec![Scripted::Exit(1, String::new()), Scripted::Exit(0, String::new())],
        );
        let engine = engine(&store, &runner);
        let wf = deploy_workflow();

        let failed = engine.run(&wf, &CancellationToken::new()).await.unwrap();
        assert_eq!(failed.status, RunStatus::Failed);

        let resumed = engine
            .resume(&wf, failed.run_id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resumed.status, RunStatus::Completed);
        assert_eq!(runner.count("run build"), 1);
        assert_eq!(runner.count("run push"), 2);
        assert_eq!(runner.count("run deploy"), 1);

        let state = store.run(failed.run_id).unwrap();
        assert_eq!(state.error, None);
        assert_eq!(state.step_results["push"].status, StepStatus::Success);
    }

    #[tokio::test]
    async fn resume_completed_run_is_noop() {
        let store = MemoryStore::new();
        let runner = ScriptedRunner::new();
        let engine = engine(&store, &runner);
        let wf = deploy_workflow();

        let done = engine.run(&wf, &CancellationToken::new()).await.unwrap();
        let saves = store.saves();
        let again = engine
            .resume(&wf, done.run_id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again.status, RunStatus::Completed);
        assert_eq!(runner.invocations().len(), 3);
        assert_eq!(store.saves(), saves);
    }

    #[tokio::test]
    async fn resume_unknown_run_is_not_found() {
        let store = MemoryStore::new();
        let engine = engine(&store, &ScriptedRunner::new());
        let id = Uuid::now_v7();
        let err = engine
            .resume(&deploy_workflow(), id, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RunNotFound(found) if found == id));
        assert_eq!(store.lease_holder(id), None);
    }

    #[tokio::test]
    async fn resume_with_other_workflow_is_mismatch() {
        let store = MemoryStore::new();
        let runner = ScriptedRunner::new();
        runner.script("run push", fail(1));
        let engine = engine(&store, &runner);
        let failed = engine
            .run(&deploy_workflow(), &CancellationToken::new())
            .await
            .unwrap();

        let other = sample_workflow(&["x"]);
        let err = engine
            .resume(&other, failed.run_id, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::WorkflowMismatch(_)));
    }

    #[tokio::test]
    async fn held_lease_blocks_resume() {
        let store = MemoryStore::new();
        let runner = ScriptedRunner::new();
        runner.script("run push", fail(1));
        let engine = engine(&store, &runner);
        let wf = deploy_workflow();
        let failed = engine.run(&wf, &CancellationToken::new()).await.unwrap();

        store.insert_lease(failed.run_id, "other-process", Duration::from_secs(600));
        let err = engine
            .resume(&wf, failed.run_id, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::RunLocked(_)));
        assert_eq!(runner.count("run push"), 1);
        assert_eq!(store.lease_holder(failed.run_id).as_deref(), Some("other-process"));
    }

    #[tokio::test]
    async fn store_failure_is_fatal_and_keeps_last_commit() {
        let store = MemoryStore::new();
        let runner = ScriptedRunner::new();
        let engine = engine(&store, &runner);
        // Initial save and the "build" checkpoint succeed; "push" fails to persist.
        store.fail_saves_after(2);

        let err = engine
            .run(&deploy_workflow(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Checkpoint(_)));
        assert_eq!(runner.count("run deploy"), 0);

        let run_id = store.run_ids()[0];
        let state = store.run(run_id).unwrap();
        assert_eq!(state.status, RunStatus::Running);
        assert_eq!(state.current_step_idx, 1);
        assert!(state.step_results.contains_key("build"));
        assert!(!state.step_results.contains_key("push"));
        assert_eq!(store.lease_holder(run_id), None);
    }

    #[tokio::test]
    async fn rollback_reverses_only_successes() {
        let store = MemoryStore::new();
        let runner = ScriptedRunner::new();
        runner.script("run b", fail(1));
        let mut wf = sample_workflow(&["a", "b"]);
        wf.steps[0].rollback = Some("undo a".to_string());
        wf.steps[1].rollback = Some("undo b".to_string());
        let engine = engine(&store, &runner);

        let failed = engine.run(&wf, &CancellationToken::new()).await.unwrap();
        assert_eq!(failed.status, RunStatus::Failed);

        let rolled = engine
            .rollback(&wf, failed.run_id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(rolled.status, RunStatus::RolledBack);
        assert_eq!(runner.count("undo a"), 1);
        assert_eq!(runner.count("undo b"), 0);

        let state = store.run(failed.run_id).unwrap();
        assert_eq!(state.status, RunStatus::RolledBack);
        assert_eq!(state.step_results["a"].status, StepStatus::RolledBack);
        assert_eq!(state.step_results["b"].status, StepStatus::Failed);
    }

    #[tokio::test]
    async fn rollback_runs_in_reverse_order() {
        let store = MemoryStore::new();
        let runner = ScriptedRunner::new();
        let mut wf = sample_workflow(&["a", "b", "c"]);
        for s in &mut wf.steps {
            s.rollback = Some(format!("undo {}", s.id));
        }
        let engine = engine(&store, &runner);
        let done = engine.run(&wf, &CancellationToken::new()).await.unwrap();

        engine
            .rollback(&wf, done.run_id, &CancellationToken::new())
            .await
            .unwrap();
        let undos: Vec<_> = runner
            .invocations()
            .into_iter()
            .filter(|c| c.starts_with("undo"))
            .collect();
        assert_eq!(undos, vec!["undo c", "undo b", "undo a"]);
    }

    #[tokio::test]
    async fn failed_undo_is_recorded_and_traversal_continues() {
        let store = MemoryStore::new();
        let runner = ScriptedRunner::new();
        runner.script("undo b", fail(4));
        let mut wf = sample_workflow(&["a", "b"]);
        wf.steps[0].rollback = Some("undo a".to_string());
        wf.steps[1].rollback = Some("undo b".to_string());
        let engine = engine(&store, &runner);
        let done = engine.run(&wf, &CancellationToken::new()).await.unwrap();

        let result = engine
            .rollback(&wf, done.run_id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status, RunStatus::Failed);
        assert_eq!(result.error.as_deref(), Some("rollback failed for steps: b"));
        assert_eq!(runner.count("undo a"), 1);

        let state = store.run(done.run_id).unwrap();
        assert_eq!(state.step_results["a"].status, StepStatus::RolledBack);
        let b = &state.step_results["b"];
        assert_eq!(b.status, StepStatus::Success);
        assert!(b.error.as_ref().unwrap().starts_with("rollback failed"));
    }

    #[tokio::test]
    async fn resume_refuses_partially_rolled_back_run() {
        let store = MemoryStore::new();
        let runner = ScriptedRunner::new();
        runner.script("undo b", fail(4));
        let mut wf = sample_workflow(&["a", "b"]);
        wf.steps[0].rollback = Some("undo a".to_string());
        wf.steps[1].rollback = Some("undo b".to_string());
        let engine = engine(&store, &runner);
        let done = engine.run(&wf, &CancellationToken::new()).await.unwrap();
        let rolled = engine
            .rollback(&wf, done.run_id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(rolled.status, RunStatus::Failed);
        let saves = store.saves();

        let err = engine
            .resume(&wf, done.run_id, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PartiallyRolledBack(id) if id == done.run_id));
        assert_eq!(store.saves(), saves);
        assert_eq!(store.lease_holder(done.run_id), None);

        let state = store.run(done.run_id).unwrap();
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.step_results["a"].status, StepStatus::RolledBack);
        assert_eq!(runner.count("run a"), 1);
        assert_eq!(runner.count("run b"), 1);
    }

    #[tokio::test]
    async fn failed_attempt_record_aborts_before_next_attempt() {
        let store = MemoryStore::new();
        let runner = ScriptedRunner::new();
        runner.script("run flaky", fail(1));
        let mut wf = sample_workflow(&["flaky"]);
        wf.steps[0].retry = Some(RetryPolicy {
            max_attempts: 3,
            delay_ms: 0,
            backoff: Backoff::Fixed,
        });
        store.fail_updates();
        let engine = engine(&store, &runner);

        let err = engine.run(&wf, &CancellationToken::new()).await.unwrap_err();
        assert!(matches!(err, EngineError::Checkpoint(_)));
        assert_eq!(runner.count("run flaky"), 1);

        let run_id = store.run_ids()[0];
        let state = store.run(run_id).unwrap();
        assert_eq!(state.status, RunStatus::Running);
        assert!(!state.step_results.contains_key("flaky"));
        assert_eq!(store.lease_holder(run_id), None);
    }

    #[tokio::test]
    async fn cancelled_rollback_keeps_persisted_status() {
        let store = MemoryStore::new();
        let runner = ScriptedRunner::new();
        let mut wf = sample_workflow(&["a", "b"]);
        wf.steps[0].rollback = Some("undo a".to_string());
        wf.steps[1].rollback = Some("undo b".to_string());
        let engine = engine(&store, &runner);
        let done = engine.run(&wf, &CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        runner.cancel_on("undo b", cancel.clone());
        let paused = engine.rollback(&wf, done.run_id, &cancel).await.unwrap();
        assert_eq!(paused.status, RunStatus::Paused);
        assert_eq!(runner.count("undo a"), 0);

        let state = store.run(done.run_id).unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.step_results["b"].status, StepStatus::RolledBack);

        let finished = engine
            .rollback(&wf, done.run_id, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(finished.status, RunStatus::RolledBack);
        assert_eq!(runner.count("undo a"), 1);
        assert_eq!(runner.count("undo b"), 1);
    }

    #[tokio::test]
    async fn events_follow_lifecycle_order() {
        let store = MemoryStore::new();
        let runner = ScriptedRunner::new();
        let engine = engine(&store, &runner);
        let seen = Arc::new(Mutex::new(Vec::new()));
        {
            let seen = Arc::clone(&seen);
            engine.bus().subscribe_all(move |e| {
                let phase = e.data_str("phase").unwrap_or("").to_string();
                seen.lock().unwrap().push(format!("{}:{phase}", e.event_type));
            });
        }

        let wf = sample_workflow(&["only"]);
        engine.run(&wf, &CancellationToken::new()).await.unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                "workflow.start:",
                "workflow.step:start",
                "workflow.step:finish",
                "workflow.checkpoint:",
                "workflow.complete:",
            ]
        );
        let complete = engine.bus().recent_by_type(EventType::WorkflowComplete);
        assert_eq!(complete[0].data["status"], "completed");
        assert_eq!(complete[0].source, EVENT_SOURCE);
    }

    #[tokio::test]
    async fn deploy_scenario_push_fails() {
        let store = MemoryStore::new();
        let runner = ScriptedRunner::new();
        runner.script("run push", fail(1));
        let engine = engine(&store, &runner);

        let result = engine
            .run(&deploy_workflow(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(result.status.as_str(), "failed");
        let state = store.run(result.run_id).unwrap();
        assert_eq!(state.current_step_idx, 1);
        assert_eq!(state.step_results["push"].exit_code, Some(1));
    }

    #[test]
    fn step_lease_ttl_covers_retries() {
        let engine = engine(&MemoryStore::new(), &ScriptedRunner::new());
        let mut s = step("a", "ls");
        assert_eq!(engine.step_lease_ttl(&s), Duration::from_secs(5) + LEASE_MARGIN);
        s.retry = Some(RetryPolicy {
            max_attempts: 3,
            delay_ms: 1000,
            backoff: Backoff::Fixed,
        });
        assert_eq!(
            engine.step_lease_ttl(&s),
            Duration::from_secs(15 + 2) + LEASE_MARGIN
        );
    }
}
