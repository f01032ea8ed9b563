//! Workflow definition parsing, validation, and filesystem discovery.
//!
//! Converts YAML files into the immutable `Workflow` value, fills in derived
//! identities (workflow ID, step IDs, step names), validates structural
//! constraints, and locates workflow files on disk for resume/rollback.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use termops_types::workflow::Workflow;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur while loading a workflow definition.
#[derive(Debug, Error)]
pub enum WorkflowError {
    /// YAML syntax or schema failure.
    #[error("parse error: {0}")]
    ParseError(String),

    /// Structural validation failure.
    #[error("validation error: {0}")]
    ValidationError(String),

    /// Filesystem I/O failure.
    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a YAML string into a validated `Workflow`.
///
/// Fills in defaults before validating, so the returned value always has a
/// non-empty workflow ID and unique step IDs and names. Steps are ordered by
/// `position` only after validation, so `steps[i]` in an error message is
/// the i-th step as written in the file.
pub fn parse_workflow_yaml(yaml: &str) -> Result<Workflow, WorkflowError> {
    let mut workflow: Workflow =
        serde_yaml_ng::from_str(yaml).map_err(|e| WorkflowError::ParseError(e.to_string()))?;
    apply_defaults(&mut workflow);
    validate_definition(&workflow)?;
    order_steps(&mut workflow);
    Ok(workflow)
}

/// Load and parse a workflow file.
pub fn parse_file(path: &Path) -> Result<Workflow, WorkflowError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

/// Derive a stable workflow ID from its declared name.
///
/// Lowercases, collapses runs of non-alphanumeric characters into a single
/// `-`, and trims leading/trailing dashes. `"Deploy API (prod)"` becomes
/// `"deploy-api-prod"`.
pub fn derive_workflow_id(name: &str) -> String {
    let mut id = String::with_capacity(name.len());
    let mut pending_dash = false;
    for c in name.chars() {
        if c.is_alphanumeric() {
            if pending_dash && !id.is_empty() {
                id.push('-');
            }
            pending_dash = false;
            id.extend(c.to_lowercase());
        } else {
            pending_dash = true;
        }
    }
    id
}

fn apply_defaults(workflow: &mut Workflow) {
    workflow.id = workflow.id.trim().to_string();
    if workflow.id.is_empty() {
        workflow.id = derive_workflow_id(&workflow.name);
    }

    for (i, step) in workflow.steps.iter_mut().enumerate() {
        step.id = step.id.trim().to_string();
        if step.id.is_empty() {
            step.id = format!("step-{}", i + 1);
        }
        if step.name.trim().is_empty() {
            step.name = step.id.clone();
        }
    }
}

fn order_steps(workflow: &mut Workflow) {
    if workflow.steps.iter().all(|s| s.position.is_some()) {
        workflow.steps.sort_by_key(|s| s.position);
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate structural constraints on a `Workflow`.
///
/// Checks:
/// - `name` and `id` are non-empty
/// - At least one step exists
/// - All step IDs are unique
/// - Every step has a `command` or a `rollback`
/// - `retry.max_attempts >= 1` and `timeout_secs > 0` when set
/// - `position` is set on all steps or none, and is unique
pub fn validate_definition(workflow: &Workflow) -> Result<(), WorkflowError> {
    if workflow.name.trim().is_empty() {
        return Err(WorkflowError::ValidationError(
            "name: workflow name must not be empty".to_string(),
        ));
    }
    if workflow.id.is_empty() {
        return Err(WorkflowError::ValidationError(format!(
            "id: cannot derive a workflow id from name '{}'",
            workflow.name
        )));
    }

    if workflow.steps.is_empty() {
        return Err(WorkflowError::ValidationError(
            "steps: workflow must have at least one step".to_string(),
        ));
    }

    let mut seen_ids = HashSet::new();
    for (i, step) in workflow.steps.iter().enumerate() {
        if !seen_ids.insert(step.id.as_str()) {
            return Err(WorkflowError::ValidationError(format!(
                "steps[{i}].id: duplicate step ID '{}'",
                step.id
            )));
        }

        let has_command = step.command.as_deref().is_some_and(|c| !c.trim().is_empty());
        let has_rollback = step.rollback.as_deref().is_some_and(|c| !c.trim().is_empty());
        if !has_command && !has_rollback {
            return Err(WorkflowError::ValidationError(format!(
                "steps[{i}].command: step '{}' must declare a command or a rollback",
                step.id
            )));
        }

        if let Some(condition) = &step.condition {
            if condition.trim().is_empty() {
                return Err(WorkflowError::ValidationError(format!(
                    "steps[{i}].condition: condition must not be empty"
                )));
            }
        }

        if let Some(retry) = &step.retry {
            if retry.max_attempts < 1 {
                return Err(WorkflowError::ValidationError(format!(
                    "steps[{i}].retry.max_attempts: must be >= 1"
                )));
            }
        }

        if step.timeout_secs == Some(0) {
            return Err(WorkflowError::ValidationError(format!(
                "steps[{i}].timeout_secs: must be > 0"
            )));
        }
    }

    let positioned = workflow.steps.iter().filter(|s| s.position.is_some()).count();
    if positioned > 0 {
        if positioned != workflow.steps.len() {
            let i = workflow
                .steps
                .iter()
                .position(|s| s.position.is_none())
                .unwrap_or(0);
            return Err(WorkflowError::ValidationError(format!(
                "steps[{i}].position: position must be set on every step or none"
            )));
        }
        let mut seen_positions = HashSet::new();
        for (i, step) in workflow.steps.iter().enumerate() {
            if let Some(pos) = step.position {
                if !seen_positions.insert(pos) {
                    return Err(WorkflowError::ValidationError(format!(
                        "steps[{i}].position: duplicate position {pos}"
                    )));
                }
            }
        }
    }

    Ok(())
}

// ---------------------------------------------------------------------------
// Filesystem operations
// ---------------------------------------------------------------------------

/// Discover all workflow YAML files under `base_dir`.
///
/// Scans for `.yaml` and `.yml` files recursively. Each file is parsed and
/// returned alongside its path. Files that fail to parse are skipped with a
/// warning (they may not be workflows).
pub fn discover_workflows(base_dir: &Path) -> Result<Vec<(PathBuf, Workflow)>, WorkflowError> {
    let mut results = Vec::new();
    if !base_dir.is_dir() {
        return Ok(results);
    }
    discover_recursive(base_dir, &mut results)?;
    results.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(results)
}

fn discover_recursive(
    dir: &Path,
    results: &mut Vec<(PathBuf, Workflow)>,
) -> Result<(), WorkflowError> {
    let entries = std::fs::read_dir(dir)?;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        if path.is_dir() {
            discover_recursive(&path, results)?;
        } else if let Some(ext) = path.extension() {
            if ext == "yaml" || ext == "yml" {
                match parse_file(&path) {
                    Ok(workflow) => results.push((path, workflow)),
                    Err(e) => {
                        tracing::warn!(?path, error = %e, "skipping unparseable workflow file");
                    }
                }
            }
        }
    }
    Ok(())
}

/// Locate the definition for a persisted run across `search_dirs`.
///
/// A match on workflow ID wins over a match on name; within each tier the
/// first directory in `search_dirs` wins.
pub fn find_workflow(
    search_dirs: &[PathBuf],
    workflow_id: &str,
    workflow_name: &str,
) -> Result<Option<(PathBuf, Workflow)>, WorkflowError> {
    let mut by_name = None;
    for dir in search_dirs {
        for (path, workflow) in discover_workflows(dir)? {
            if workflow.id == workflow_id {
                return Ok(Some((path, workflow)));
            }
            if by_name.is_none() && workflow.name == workflow_name {
                by_name = Some((path, workflow));
            }
        }
    }
    Ok(by_name)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
