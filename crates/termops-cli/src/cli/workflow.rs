//! CLI workflow subcommands.
//!
//! Provides run, resume, list, status, and rollback for workflow runs. Runs
//! are driven in-process by the engine; progress is rendered from the event
//! bus.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::Subcommand;
use comfy_table::{Cell, Color, ContentArrangement, Table, presets};
use console::style;
use termops_core::repository::checkpoint::CheckpointStore;
use termops_core::workflow::EngineError;
use termops_core::workflow::definition::{WorkflowError, find_workflow, parse_file};
use termops_types::error::RepositoryError;
use termops_types::workflow::{RunResult, RunState, RunStatus, StepResult, StepStatus, Workflow};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::cli::progress::{ProgressRenderer, format_duration, short_id};
use crate::state::AppState;

/// Workflow subcommands.
#[derive(Subcommand)]
pub enum WorkflowCommand {
    /// Run a workflow from a YAML file.
    Run {
        /// Path to the workflow YAML file.
        file: PathBuf,

        /// Print each step's captured output when the run ends.
        #[arg(long)]
        verbose: bool,
    },

    /// Resume a paused, failed, or interrupted run from its checkpoint.
    Resume {
        /// Run ID or unique prefix.
        run_id: String,

        /// Workflow file to use instead of searching the known directories.
        #[arg(long)]
        file: Option<PathBuf>,

        /// Break a lease left behind by another process.
        #[arg(long)]
        force: bool,
    },

    /// List recent runs.
    #[command(alias = "ls")]
    List {
        /// Maximum number of runs to display.
        #[arg(long)]
        limit: Option<u32>,
    },

    /// Show a run with its per-step results.
    Status {
        /// Run ID or unique prefix.
        run_id: String,
    },

    /// Undo the completed steps of a run in reverse order.
    Rollback {
        /// Run ID or unique prefix.
        run_id: String,

        /// Workflow file to use instead of searching the known directories.
        #[arg(long)]
        file: Option<PathBuf>,

        /// Break a lease left behind by another process.
        #[arg(long)]
        force: bool,
    },
}

/// Output switches shared by every subcommand.
#[derive(Debug, Clone, Copy)]
struct Output {
    json: bool,
    quiet: bool,
}

impl Output {
    fn styled(self) -> bool {
        !self.json && !self.quiet
    }
}

/// Handle a workflow subcommand.
pub async fn handle_workflow_command(
    cmd: WorkflowCommand,
    state: &AppState,
    cancel: &CancellationToken,
    json: bool,
    quiet: bool,
) -> Result<()> {
    let out = Output { json, quiet };
    match cmd {
        WorkflowCommand::Run { file, verbose } => handle_run(&file, verbose, state, cancel, out).await,
        WorkflowCommand::Resume {
            run_id,
            file,
            force,
        } => handle_resume(&run_id, file.as_deref(), force, state, cancel, out).await,
        WorkflowCommand::List { limit } => handle_list(limit, state, out).await,
        WorkflowCommand::Status { run_id } => handle_status(&run_id, state, out).await,
        WorkflowCommand::Rollback {
            run_id,
            file,
            force,
        } => handle_rollback(&run_id, file.as_deref(), force, state, cancel, out).await,
    }
}

// ---------------------------------------------------------------------------
// Run
// ---------------------------------------------------------------------------

async fn handle_run(
    file: &Path,
    verbose: bool,
    state: &AppState,
    cancel: &CancellationToken,
    out: Output,
) -> Result<()> {
    let workflow = load_workflow(file)?;

    let bus = state.event_bus();
    if out.styled() {
        ProgressRenderer::attach(&bus);
    }
    let engine = state.engine(bus);

    let result = engine
        .run(&workflow, cancel)
        .await
        .map_err(|e| engine_error(e, "run"))?;

    report_result(&result, Action::Run, &workflow, state, verbose, out).await
}

// ---------------------------------------------------------------------------
// Resume
// ---------------------------------------------------------------------------

async fn handle_resume(
    run_id_str: &str,
    file: Option<&Path>,
    force: bool,
    state: &AppState,
    cancel: &CancellationToken,
    out: Output,
) -> Result<()> {
    let run_id = resolve_run_id(state, run_id_str).await?;
    let run = load_run(state, run_id).await?;

    if !run.status.is_resumable() {
        if out.json {
            print_json(&run_result_json(run.run_id, run.status, None, run.error.as_deref()))?;
        } else if !out.quiet {
            println!();
            println!(
                "  Run {} is already {}; nothing to resume.",
                style(short_id(&run_id.to_string())).cyan(),
                format_run_status(run.status)
            );
            println!();
        }
        return Ok(());
    }

    let workflow = locate_workflow(file, &run, state)?;
    if force {
        break_lease(state, run_id, out).await?;
    }

    let bus = state.event_bus();
    if out.styled() {
        ProgressRenderer::attach(&bus);
    }
    let engine = state.engine(bus);

    let result = engine
        .resume(&workflow, run_id, cancel)
        .await
        .map_err(|e| engine_error(e, "resume"))?;

    report_result(&result, Action::Resume, &workflow, state, false, out).await
}

// ---------------------------------------------------------------------------
// Rollback
// ---------------------------------------------------------------------------

async fn handle_rollback(
    run_id_str: &str,
    file: Option<&Path>,
    force: bool,
    state: &AppState,
    cancel: &CancellationToken,
    out: Output,
) -> Result<()> {
    let run_id = resolve_run_id(state, run_id_str).await?;
    let run = load_run(state, run_id).await?;
    let workflow = locate_workflow(file, &run, state)?;
    if force {
        break_lease(state, run_id, out).await?;
    }

    let bus = state.event_bus();
    if out.styled() {
        ProgressRenderer::attach(&bus);
        println!();
        println!(
            "  Rolling back {} (run {})",
            style(&workflow.name).cyan(),
            style(short_id(&run_id.to_string())).dim()
        );
        println!();
    }
    let engine = state.engine(bus);

    let result = engine
        .rollback(&workflow, run_id, cancel)
        .await
        .map_err(|e| engine_error(e, "roll back"))?;

    report_result(&result, Action::Rollback, &workflow, state, false, out).await
}

// ---------------------------------------------------------------------------
// List
// ---------------------------------------------------------------------------

async fn handle_list(limit: Option<u32>, state: &AppState, out: Output) -> Result<()> {
    let limit = limit.unwrap_or(state.config.list_limit);
    let runs = state
        .store
        .list_runs(limit)
        .await
        .map_err(|e| anyhow!("Failed to list workflow runs: {e}"))?;

    if out.json {
        return print_json(&serde_json::to_value(&runs)?);
    }
    if out.quiet {
        return Ok(());
    }

    if runs.is_empty() {
        println!();
        println!("  No workflow runs yet.");
        println!(
            "  Start one with: {}",
            style("termops workflow run <file.yaml>").dim()
        );
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Run ID").fg(Color::Cyan),
            Cell::new("Workflow"),
            Cell::new("Status"),
            Cell::new("Next Step"),
            Cell::new("Started"),
            Cell::new("Duration"),
        ]);

    for r in &runs {
        table.add_row(vec![
            Cell::new(short_id(&r.run_id.to_string())),
            Cell::new(&r.workflow_name),
            status_cell(r.status),
            Cell::new(r.current_step_idx + 1),
            Cell::new(
                r.started_at
                    .with_timezone(&chrono::Local)
                    .format("%Y-%m-%d %H:%M")
                    .to_string(),
            ),
            Cell::new(format_duration(r.duration().as_millis() as u64)),
        ]);
    }

    println!();
    println!("{table}");
    println!();

    Ok(())
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

async fn handle_status(run_id_str: &str, state: &AppState, out: Output) -> Result<()> {
    let run_id = resolve_run_id(state, run_id_str).await?;
    let run = load_run(state, run_id).await?;

    if out.json {
        return print_json(&serde_json::to_value(&run)?);
    }
    if out.quiet {
        return Ok(());
    }

    println!();
    println!(
        "  {} {}",
        style("Run").bold(),
        style(run.run_id.to_string()).cyan()
    );
    println!(
        "  Workflow: {} ({})",
        style(&run.workflow_name).cyan(),
        run.workflow_id
    );
    println!("  Status: {}", format_run_status(run.status));
    println!("  Next step: {}", run.current_step_idx + 1);
    println!(
        "  Started: {}",
        run.started_at.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S")
    );
    if let Some(completed) = run.completed_at {
        println!(
            "  Completed: {}",
            completed.with_timezone(&chrono::Local).format("%Y-%m-%d %H:%M:%S")
        );
    }
    if let Some(ref err) = run.error {
        println!("  Error: {}", style(err).red());
    }
    println!();

    if run.step_results.is_empty() {
        println!("  No steps have run yet.");
        println!();
        return Ok(());
    }

    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Step").fg(Color::Cyan),
            Cell::new("Status"),
            Cell::new("Exit"),
            Cell::new("Retries"),
            Cell::new("Duration"),
            Cell::new("Error"),
        ]);

    for (step_id, result) in ordered_steps(&run) {
        let exit = result
            .exit_code
            .map(|c| c.to_string())
            .unwrap_or_else(|| "-".to_string());
        let error = result
            .error
            .as_ref()
            .map(|e| e.chars().take(60).collect::<String>())
            .unwrap_or_else(|| "-".to_string());

        table.add_row(vec![
            Cell::new(step_id),
            step_status_cell(result.status),
            Cell::new(exit),
            Cell::new(result.retries),
            Cell::new(format_duration(result.duration_ms)),
            Cell::new(error),
        ]);
    }

    println!("{table}");
    println!();

    Ok(())
}

/// Step results in execution order (start time, then ID for steps that
/// never started).
fn ordered_steps(run: &RunState) -> Vec<(&String, &StepResult)> {
    let mut steps: Vec<_> = run.step_results.iter().collect();
    steps.sort_by(|(a_id, a), (b_id, b)| match (a.started_at, b.started_at) {
        (Some(x), Some(y)) => x.cmp(&y).then_with(|| a_id.cmp(b_id)),
        (Some(_), None) => std::cmp::Ordering::Less,
        (None, Some(_)) => std::cmp::Ordering::Greater,
        (None, None) => a_id.cmp(b_id),
    });
    steps
}

// ---------------------------------------------------------------------------
// Result reporting
// ---------------------------------------------------------------------------

/// Which engine entry point produced a result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Run,
    Resume,
    Rollback,
}

async fn report_result(
    result: &RunResult,
    action: Action,
    workflow: &Workflow,
    state: &AppState,
    verbose: bool,
    out: Output,
) -> Result<()> {
    if out.json {
        print_json(&run_result_json(
            result.run_id,
            result.status,
            Some(result.duration.as_millis() as u64),
            result.error.as_deref(),
        ))?;
    } else if !out.quiet {
        if verbose {
            print_step_outputs(result.run_id, workflow, state).await?;
        }
        print_summary(result, action);
    }

    if result.status == RunStatus::Failed {
        bail!(
            "workflow run {} failed: {}",
            short_id(&result.run_id.to_string()),
            result.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn print_summary(result: &RunResult, action: Action) {
    let id = result.run_id.to_string();
    let duration = style(format!("({})", format_duration(result.duration.as_millis() as u64))).dim();
    println!();
    match result.status {
        RunStatus::Completed => {
            println!("  {} Workflow completed {duration}", style("*").green().bold());
        }
        RunStatus::RolledBack => {
            println!("  {} Workflow rolled back {duration}", style("*").magenta().bold());
        }
        RunStatus::Paused if action == Action::Rollback => {
            println!("  {} Rollback paused {duration}", style("*").yellow().bold());
        }
        RunStatus::Paused => {
            println!("  {} Workflow paused {duration}", style("*").yellow().bold());
        }
        RunStatus::Failed => {
            println!("  {} Workflow failed {duration}", style("*").red().bold());
            if let Some(ref err) = result.error {
                println!("  Error: {}", style(err).red());
            }
        }
        other => println!("  Workflow {}", format_run_status(other)),
    }
    for (label, command) in next_commands(result.status, action, &short_id(&id)) {
        println!("  {label}: {}", style(command).dim());
    }
    println!("  Run ID: {id}");
    println!();
}

/// Follow-up commands suggested after a run stops short of a final state.
///
/// A rollback that stopped early is continued with `rollback`; resuming it
/// would run forward steps on top of undone ones.
fn next_commands(status: RunStatus, action: Action, id: &str) -> Vec<(&'static str, String)> {
    let resume = format!("termops workflow resume {id}");
    let rollback = format!("termops workflow rollback {id}");
    match (status, action) {
        (RunStatus::Paused, Action::Rollback) => vec![("Continue rollback with", rollback)],
        (RunStatus::Failed, Action::Rollback) => vec![("Retry rollback with", rollback)],
        (RunStatus::Paused, _) => vec![("Resume with", resume)],
        (RunStatus::Failed, _) => vec![("Resume with", resume), ("Roll back with", rollback)],
        _ => Vec::new(),
    }
}

async fn print_step_outputs(run_id: Uuid, workflow: &Workflow, state: &AppState) -> Result<()> {
    let run = load_run(state, run_id).await?;
    for step in &workflow.steps {
        let Some(result) = run.step_results.get(&step.id) else {
            continue;
        };
        if result.output.is_empty() {
            continue;
        }
        println!();
        println!("  {} {}", style("──").dim(), style(&step.name).bold());
        for line in result.output.lines() {
            println!("  {line}");
        }
    }
    Ok(())
}

fn run_result_json(
    run_id: Uuid,
    status: RunStatus,
    duration_ms: Option<u64>,
    error: Option<&str>,
) -> serde_json::Value {
    serde_json::json!({
        "run_id": run_id.to_string(),
        "status": status.as_str(),
        "duration_ms": duration_ms,
        "error": error,
    })
}

fn print_json(value: &serde_json::Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn load_workflow(path: &Path) -> Result<Workflow> {
    parse_file(path).map_err(|e| match e {
        WorkflowError::ParseError(msg) => {
            anyhow!("Failed to parse workflow YAML {}: {msg}", path.display())
        }
        WorkflowError::ValidationError(msg) => {
            anyhow!("Workflow validation failed for {}: {msg}", path.display())
        }
        WorkflowError::IoError(err) => {
            anyhow!("Failed to read workflow file {}: {err}", path.display())
        }
    })
}

/// Find the definition for a persisted run: `--file` wins, otherwise search
/// the known directories by workflow ID, then name.
fn locate_workflow(file: Option<&Path>, run: &RunState, state: &AppState) -> Result<Workflow> {
    if let Some(path) = file {
        return load_workflow(path);
    }

    let dirs = state.search_dirs();
    let found = find_workflow(&dirs, &run.workflow_id, &run.workflow_name)
        .with_context(|| "Failed to search for workflow files")?;

    match found {
        Some((path, workflow)) => {
            tracing::info!(path = %path.display(), workflow_id = %workflow.id, "located workflow file");
            Ok(workflow)
        }
        None => {
            let searched = dirs
                .iter()
                .map(|d| d.display().to_string())
                .collect::<Vec<_>>()
                .join(", ");
            bail!(
                "Workflow '{}' not found in: {searched}. Pass --file <path>.",
                run.workflow_id
            )
        }
    }
}

async fn resolve_run_id(state: &AppState, input: &str) -> Result<Uuid> {
    if let Ok(id) = input.parse::<Uuid>() {
        return Ok(id);
    }
    state.store.resolve_run_id(input).await.map_err(|e| match e {
        RepositoryError::NotFound => anyhow!("No workflow run matches '{input}'"),
        RepositoryError::Conflict(_) => {
            anyhow!("Run ID prefix '{input}' is ambiguous; use more characters")
        }
        other => anyhow!("Failed to look up run '{input}': {other}"),
    })
}

async fn load_run(state: &AppState, run_id: Uuid) -> Result<RunState> {
    state.store.load_run(&run_id).await.map_err(|e| match e {
        RepositoryError::NotFound => anyhow!("Workflow run '{run_id}' not found"),
        other => anyhow!("Failed to load run '{run_id}': {other}"),
    })
}

async fn break_lease(state: &AppState, run_id: Uuid, out: Output) -> Result<()> {
    state
        .store
        .release_lease(&run_id, None)
        .await
        .map_err(|e| anyhow!("Failed to release run lease: {e}"))?;
    tracing::warn!(run_id = %run_id, "run lease forcibly released");
    if out.styled() {
        println!(
            "  {} Released any existing lease on run {}",
            style("!").yellow().bold(),
            style(short_id(&run_id.to_string())).cyan()
        );
    }
    Ok(())
}

fn engine_error(err: EngineError, action: &str) -> anyhow::Error {
    match err {
        EngineError::RunLocked(id) => anyhow!(
            "Run {id} is being driven by another termops process. \
             If that process is gone, retry with --force."
        ),
        EngineError::PartiallyRolledBack(id) => anyhow!(
            "Run {id} is partially rolled back and cannot be resumed. \
             Finish the rollback with: termops workflow rollback {}",
            short_id(&id.to_string())
        ),
        other => anyhow::Error::new(other).context(format!("Failed to {action} workflow")),
    }
}

fn format_run_status(status: RunStatus) -> String {
    let s = status.as_str();
    match status {
        RunStatus::Completed => style(s).green().to_string(),
        RunStatus::Failed => style(s).red().to_string(),
        RunStatus::Paused => style(s).yellow().to_string(),
        RunStatus::RolledBack => style(s).magenta().to_string(),
        RunStatus::Running => style(s).blue().to_string(),
        RunStatus::Pending => style(s).dim().to_string(),
    }
}

fn status_cell(status: RunStatus) -> Cell {
    let cell = Cell::new(status.as_str());
    match status {
        RunStatus::Pending => cell.fg(Color::Yellow),
        RunStatus::Running => cell.fg(Color::Blue),
        RunStatus::Paused => cell.fg(Color::Magenta),
        RunStatus::Completed => cell.fg(Color::Green),
        RunStatus::Failed => cell.fg(Color::Red),
        RunStatus::RolledBack => cell.fg(Color::DarkYellow),
    }
}

fn step_status_cell(status: StepStatus) -> Cell {
    let cell = Cell::new(status.as_str());
    match status {
        StepStatus::Success => cell.fg(Color::Green),
        StepStatus::Failed => cell.fg(Color::Red),
        StepStatus::Skipped => cell.fg(Color::DarkGrey),
        StepStatus::RolledBack => cell.fg(Color::DarkYellow),
        StepStatus::Running => cell.fg(Color::Blue),
        StepStatus::Pending => cell,
    }
}
