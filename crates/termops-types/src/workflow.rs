//! Workflow domain types for termops.
//!
//! Defines the immutable workflow definition parsed from YAML (`Workflow`,
//! `Step`, `RetryPolicy`) and the execution tracking types persisted after
//! every step (`RunState`, `StepResult`) or returned to callers
//! (`RunResult`, `RunSummary`).

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Workflow Definition
// ---------------------------------------------------------------------------

/// A parsed workflow definition.
///
/// Never mutated after parsing. Step order is execution order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Workflow {
    /// Stable identity used to match persisted runs. Derived from `name`
    /// by the parser when the file omits it.
    #[serde(default)]
    pub id: String,
    /// Human-readable workflow name.
    pub name: String,
    /// Optional longer description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Ordered steps.
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Workflow {
    /// Index of the step with the given ID.
    pub fn step_index(&self, step_id: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.id == step_id)
    }
}

/// A single shell step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    /// Unique within a workflow. Defaults to `step-<n>`.
    #[serde(default)]
    pub id: String,
    /// Display name. Defaults to the step ID.
    #[serde(default)]
    pub name: String,
    /// Shell command run on the forward pass.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    /// JEXL expression gating execution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,
    /// Retry configuration for the forward command.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
    /// Shell command run during reverse traversal.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<String>,
    /// Per-step timeout in seconds (engine default when absent).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
    /// Explicit ordinal position.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position: Option<u32>,
}

/// Retry configuration for a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first (default 3).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay before the first retry, in milliseconds.
    #[serde(default)]
    pub delay_ms: u64,
    /// How the delay grows between retries.
    #[serde(default)]
    pub backoff: Backoff,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            delay_ms: 0,
            backoff: Backoff::default(),
        }
    }
}

/// Backoff strategy between retry attempts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Backoff {
    /// Same delay before every retry.
    #[default]
    Fixed,
    /// Delay doubles before every retry.
    Exponential,
}

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Overall status of a workflow run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    #[serde(rename = "rolledback")]
    RolledBack,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::RolledBack => "rolledback",
        }
    }

    /// Whether `Resume` can continue this run.
    pub fn is_resumable(&self) -> bool {
        matches!(
            self,
            RunStatus::Pending | RunStatus::Running | RunStatus::Paused | RunStatus::Failed
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(RunStatus::Pending),
            "running" => Ok(RunStatus::Running),
            "paused" => Ok(RunStatus::Paused),
            "completed" => Ok(RunStatus::Completed),
            "failed" => Ok(RunStatus::Failed),
            "rolledback" => Ok(RunStatus::RolledBack),
            other => Err(format!("invalid run status: '{other}'")),
        }
    }
}

/// Status of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Success,
    Failed,
    Skipped,
    #[serde(rename = "rolledback")]
    RolledBack,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Pending => "pending",
            StepStatus::Running => "running",
            StepStatus::Success => "success",
            StepStatus::Failed => "failed",
            StepStatus::Skipped => "skipped",
            StepStatus::RolledBack => "rolledback",
        }
    }

    /// Whether the resume cursor may move past a step in this status.
    pub fn advances_cursor(&self) -> bool {
        matches!(self, StepStatus::Success | StepStatus::Skipped)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StepStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(StepStatus::Pending),
            "running" => Ok(StepStatus::Running),
            "success" => Ok(StepStatus::Success),
            "failed" => Ok(StepStatus::Failed),
            "skipped" => Ok(StepStatus::Skipped),
            "rolledback" => Ok(StepStatus::RolledBack),
            other => Err(format!("invalid step status: '{other}'")),
        }
    }
}

// ---------------------------------------------------------------------------
// Step Result
// ---------------------------------------------------------------------------

/// Outcome of a step within a run. Overwritten in place across retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepResult {
    pub status: StepStatus,
    /// Process exit code of the last attempt (None if never spawned,
    /// killed by a signal, or timed out).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Combined stdout+stderr of the last attempt, bounded.
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Attempts consumed beyond the first.
    #[serde(default)]
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Wall-clock time from first attempt to terminal status.
    #[serde(default)]
    pub duration_ms: u64,
}

impl StepResult {
    /// A result for a step that has just begun executing.
    pub fn started() -> Self {
        Self {
            status: StepStatus::Running,
            exit_code: None,
            output: String::new(),
            error: None,
            retries: 0,
            started_at: Some(Utc::now()),
            completed_at: None,
            duration_ms: 0,
        }
    }

    /// A result for a step whose condition evaluated to false.
    pub fn skipped() -> Self {
        let now = Utc::now();
        Self {
            status: StepStatus::Skipped,
            exit_code: None,
            output: String::new(),
            error: None,
            retries: 0,
            started_at: Some(now),
            completed_at: Some(now),
            duration_ms: 0,
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.duration_ms)
    }
}

// ---------------------------------------------------------------------------
// Run State
// ---------------------------------------------------------------------------

/// The unit of durability: everything needed to resume or roll back a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    /// UUIDv7 run ID.
    pub run_id: Uuid,
    pub workflow_id: String,
    /// Denormalized for display.
    pub workflow_name: String,
    pub status: RunStatus,
    /// Index of the next step to execute (the resume cursor).
    pub current_step_idx: usize,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set when the run reaches a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// Last fatal error text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Step results keyed by step ID.
    #[serde(default)]
    pub step_results: HashMap<String, StepResult>,
}

impl RunState {
    /// A fresh run in `Running` status with the cursor at step 0.
    pub fn new(workflow: &Workflow) -> Self {
        let now = Utc::now();
        Self {
            run_id: Uuid::now_v7(),
            workflow_id: workflow.id.clone(),
            workflow_name: workflow.name.clone(),
            status: RunStatus::Running,
            current_step_idx: 0,
            started_at: now,
            updated_at: now,
            completed_at: None,
            error: None,
            step_results: HashMap::new(),
        }
    }

    /// Bump `updated_at` to now.
    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }

    pub fn summary(&self) -> RunSummary {
        RunSummary {
            run_id: self.run_id,
            workflow_id: self.workflow_id.clone(),
            workflow_name: self.workflow_name.clone(),
            status: self.status,
            current_step_idx: self.current_step_idx,
            started_at: self.started_at,
            updated_at: self.updated_at,
            completed_at: self.completed_at,
            error: self.error.clone(),
        }
    }
}

/// A run row without its step results, for listings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub workflow_id: String,
    pub workflow_name: String,
    pub status: RunStatus,
    pub current_step_idx: usize,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunSummary {
    /// Time from start to completion, or to the last update for runs that
    /// have not finished.
    pub fn duration(&self) -> Duration {
        let end = self.completed_at.unwrap_or(self.updated_at);
        (end - self.started_at).to_std().unwrap_or_default()
    }
}

// ---------------------------------------------------------------------------
// Run Result
// ---------------------------------------------------------------------------

/// Outcome of a single `run`/`resume`/`rollback` invocation.
#[derive(Debug, Clone, PartialEq)]
pub struct RunResult {
    pub run_id: Uuid,
    pub status: RunStatus,
    /// Time spent in this invocation.
    pub duration: Duration,
    pub error: Option<String>,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
