//! Single-attempt step execution.
//!
//! `StepExecutor` evaluates step conditions and runs one command attempt
//! through a `CommandRunner`, enforcing the step timeout and bounding the
//! captured output. Retry sequencing and persistence belong to the engine.

use std::time::{Duration, Instant};

use serde_json::Value;
use termops_types::workflow::Step;

use crate::runner::CommandRunner;
use crate::workflow::expression::{ExpressionError, WorkflowEvaluator};

/// Marker appended to output cut at the size ceiling.
pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Outcome of one command attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attempt {
    /// `None` when the command never spawned, was killed by a signal, or
    /// timed out.
    pub exit_code: Option<i32>,
    pub output: String,
    /// Failure description; `None` on success.
    pub error: Option<String>,
    pub duration: Duration,
}

impl Attempt {
    pub fn succeeded(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs step commands with timeout enforcement and output bounds.
pub struct StepExecutor<C: CommandRunner> {
    runner: C,
    evaluator: WorkflowEvaluator,
    default_timeout: Duration,
    max_output_bytes: usize,
}

impl<C: CommandRunner> StepExecutor<C> {
    pub fn new(runner: C, default_timeout: Duration, max_output_bytes: usize) -> Self {
        Self {
            runner,
            evaluator: WorkflowEvaluator::new(),
            default_timeout,
            max_output_bytes,
        }
    }

    /// Timeout for one attempt of `step`.
    pub fn timeout_for(&self, step: &Step) -> Duration {
        step.timeout_secs
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout)
    }

    /// Evaluate a step condition against a prepared context.
    pub fn evaluate_condition(
        &self,
        condition: &str,
        context: &Value,
    ) -> Result<bool, ExpressionError> {
        self.evaluator.evaluate_bool(condition, context)
    }

    /// Run `command` once, killing it if it outlives `timeout`.
    pub async fn run_command(&self, command: &str, timeout: Duration) -> Attempt {
        let start = Instant::now();
        let outcome = tokio::time::timeout(timeout, self.runner.run(command)).await;
        let duration = start.elapsed();

        match outcome {
            Ok(Ok(output)) => {
                let error = match output.exit_code {
                    Some(0) => None,
                    Some(code) => Some(format!("exited with code {code}")),
                    None => Some("terminated by signal".to_string()),
                };
                Attempt {
                    exit_code: output.exit_code,
                    output: truncate_output(output.output, self.max_output_bytes),
                    error,
                    duration,
                }
            }
            Ok(Err(e)) => Attempt {
                exit_code: None,
                output: String::new(),
                error: Some(format!("failed to spawn command: {e}")),
                duration,
            },
            Err(_) => Attempt {
                exit_code: None,
                output: String::new(),
                error: Some(format!("timed out after {}s", timeout.as_secs())),
                duration,
            },
        }
    }
}

/// Cut `output` to at most `max_bytes` on a UTF-8 boundary, appending a marker.
pub fn truncate_output(mut output: String, max_bytes: usize) -> String {
    if output.len() <= max_bytes {
        return output;
    }
    let mut cut = max_bytes;
    while !output.is_char_boundary(cut) {
        cut -= 1;
    }
    output.truncate(cut);
    output.push_str(TRUNCATION_MARKER);
    output
}
