//! In-memory test doubles for the core ports.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use termops_types::error::RepositoryError;
use termops_types::workflow::{RunState, RunSummary, Step, StepResult, Workflow};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::repository::checkpoint::CheckpointStore;
use crate::runner::{CommandOutput, CommandRunner};

pub fn step(id: &str, command: &str) -> Step {
    Step {
        id: id.to_string(),
        name: id.to_string(),
        command: Some(command.to_string()),
        condition: None,
        retry: None,
        rollback: None,
        timeout_secs: None,
        position: None,
    }
}

/// Workflow whose steps run `run <id>`.
pub fn sample_workflow(ids: &[&str]) -> Workflow {
    Workflow {
        id: "sample".to_string(),
        name: "sample".to_string(),
        description: None,
        steps: ids.iter().map(|id| step(id, &format!("run {id}"))).collect(),
    }
}

// ---------------------------------------------------------------------------
// MemoryStore
// ---------------------------------------------------------------------------

#[derive(Default)]
struct StoreInner {
    runs: HashMap<Uuid, RunState>,
    leases: HashMap<Uuid, (String, Instant)>,
    saves: usize,
    fail_saves_after: Option<usize>,
    fail_updates: bool,
}

/// `CheckpointStore` backed by a map, with failure injection.
///
/// Writes replace whole values, so a failed write never leaves partial state.
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<StoreInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Let `n` more `save_run` calls succeed, then fail every one after.
    pub fn fail_saves_after(&self, n: usize) {
        let mut inner = self.inner.lock().unwrap();
        inner.fail_saves_after = Some(inner.saves + n);
    }

    pub fn fail_updates(&self) {
        self.inner.lock().unwrap().fail_updates = true;
    }

    pub fn saves(&self) -> usize {
        self.inner.lock().unwrap().saves
    }

    pub fn run(&self, run_id: Uuid) -> Option<RunState> {
        self.inner.lock().unwrap().runs.get(&run_id).cloned()
    }

    pub fn run_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.inner.lock().unwrap().runs.keys().copied().collect();
        ids.sort();
        ids
    }

    pub fn lease_holder(&self, run_id: Uuid) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .leases
            .get(&run_id)
            .map(|(holder, _)| holder.clone())
    }

    pub fn insert_lease(&self, run_id: Uuid, holder: &str, ttl: Duration) {
        self.inner
            .lock()
            .unwrap()
            .leases
            .insert(run_id, (holder.to_string(), Instant::now() + ttl));
    }
}

impl CheckpointStore for MemoryStore {
    async fn init_schema(&self) -> Result<(), RepositoryError> {
        Ok(())
    }

    async fn save_run(&self, state: &RunState) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_saves_after.is_some_and(|limit| inner.saves >= limit) {
            return Err(RepositoryError::Query("injected save failure".to_string()));
        }
        inner.saves += 1;
        inner.runs.insert(state.run_id, state.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: &Uuid) -> Result<RunState, RepositoryError> {
        self.inner
            .lock()
            .unwrap()
            .runs
            .get(run_id)
            .cloned()
            .ok_or(RepositoryError::NotFound)
    }

    async fn list_runs(&self, limit: u32) -> Result<Vec<RunSummary>, RepositoryError> {
        let inner = self.inner.lock().unwrap();
        let mut runs: Vec<RunSummary> = inner.runs.values().map(RunState::summary).collect();
        runs.sort_by(|a, b| b.run_id.cmp(&a.run_id));
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn update_step_result(
        &self,
        run_id: &Uuid,
        step_id: &str,
        result: &StepResult,
    ) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_updates {
            return Err(RepositoryError::Query("injected update failure".to_string()));
        }
        let run = inner.runs.get_mut(run_id).ok_or(RepositoryError::NotFound)?;
        run.step_results.insert(step_id.to_string(), result.clone());
        Ok(())
    }

    async fn acquire_lease(
        &self,
        run_id: &Uuid,
        holder: &str,
        ttl: Duration,
    ) -> Result<bool, RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        let now = Instant::now();
        let blocked = matches!(
            inner.leases.get(run_id),
            Some((current, expires)) if current != holder && *expires > now
        );
        if blocked {
            return Ok(false);
        }
        inner.leases.insert(*run_id, (holder.to_string(), now + ttl));
        Ok(true)
    }

    async fn release_lease(
        &self,
        run_id: &Uuid,
        holder: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut inner = self.inner.lock().unwrap();
        let owned = match (inner.leases.get(run_id), holder) {
            (Some(_), None) => true,
            (Some((current, _)), Some(h)) => current == h,
            (None, _) => false,
        };
        if owned {
            inner.leases.remove(run_id);
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ScriptedRunner
// ---------------------------------------------------------------------------

/// Scripted outcome for one invocation of a command.
#[derive(Debug, Clone)]
pub enum Scripted {
    Exit(i32, String),
    SpawnError(String),
    Sleep(Duration),
}

#[derive(Default)]
struct RunnerInner {
    scripts: HashMap<String, VecDeque<Scripted>>,
    invocations: Vec<String>,
    cancel_on: HashMap<String, CancellationToken>,
}

/// `CommandRunner` that replays scripted outcomes and records every call.
///
/// Commands without a script exit 0 with output `ok: <command>`. When a
/// command's queue has a single entry left it is reused for every later call.
#[derive(Clone, Default)]
pub struct ScriptedRunner {
    inner: Arc<Mutex<RunnerInner>>,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, command: &str, outcomes: Vec<Scripted>) -> &Self {
        self.inner
            .lock()
            .unwrap()
            .scripts
            .insert(command.to_string(), outcomes.into());
        self
    }

    /// Cancel `token` while `command` is running.
    pub fn cancel_on(&self, command: &str, token: CancellationToken) -> &Self {
        self.inner
            .lock()
            .unwrap()
            .cancel_on
            .insert(command.to_string(), token);
        self
    }

    pub fn invocations(&self) -> Vec<String> {
        self.inner.lock().unwrap().invocations.clone()
    }

    pub fn count(&self, command: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .invocations
            .iter()
            .filter(|c| c.as_str() == command)
            .count()
    }
}

impl CommandRunner for ScriptedRunner {
    async fn run(&self, command: &str) -> std::io::Result<CommandOutput> {
        let outcome = {
            let mut inner = self.inner.lock().unwrap();
            inner.invocations.push(command.to_string());
            if let Some(token) = inner.cancel_on.get(command) {
                token.cancel();
            }
            match inner.scripts.get_mut(command) {
                Some(queue) if queue.len() > 1 => queue.pop_front(),
                Some(queue) => queue.front().cloned(),
                None => None,
            }
        };

        match outcome {
            None => Ok(CommandOutput {
                exit_code: Some(0),
                output: format!("ok: {command}"),
            }),
            Some(Scripted::Exit(code, output)) => Ok(CommandOutput {
                exit_code: Some(code),
                output,
            }),
            Some(Scripted::SpawnError(message)) => Err(std::io::Error::other(message)),
            Some(Scripted::Sleep(duration)) => {
                tokio::time::sleep(duration).await;
                Ok(CommandOutput {
                    exit_code: Some(0),
                    output: String::new(),
                })
            }
        }
    }
}
