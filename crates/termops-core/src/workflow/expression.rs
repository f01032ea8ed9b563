//! JEXL expression evaluator for step `condition` clauses.
//!
//! Wraps `jexl_eval::Evaluator` with pre-registered standard transforms and
//! builds the evaluation context from a run's accumulated step results.
//!
//! Step output and environment values are always passed as context objects,
//! never interpolated into expression strings.

use std::collections::HashMap;

use serde_json::{Map, Value, json};
use termops_types::workflow::{RunState, Workflow};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors that can occur during expression evaluation.
#[derive(Debug, thiserror::Error)]
pub enum ExpressionError {
    #[error("expression evaluation failed: {0}")]
    EvalFailed(String),

    #[error("invalid context: {0}")]
    InvalidContext(String),
}

// ---------------------------------------------------------------------------
// WorkflowEvaluator
// ---------------------------------------------------------------------------

fn str_arg(args: &[Value], index: usize) -> &str {
    args.get(index).and_then(|v| v.as_str()).unwrap_or("")
}

/// JEXL expression evaluator with standard transforms pre-registered.
///
/// Conditions look like `steps.test.status == 'success'` or
/// `steps.probe.output|contains('ready')`.
pub struct WorkflowEvaluator {
    evaluator: jexl_eval::Evaluator<'static>,
}

impl WorkflowEvaluator {
    /// Create a new evaluator with all standard transforms registered.
    pub fn new() -> Self {
        let evaluator = jexl_eval::Evaluator::new()
            // String transforms
            .with_transform("lower", |args: &[Value]| Ok(json!(str_arg(args, 0).to_lowercase())))
            .with_transform("upper", |args: &[Value]| Ok(json!(str_arg(args, 0).to_uppercase())))
            .with_transform("trim", |args: &[Value]| Ok(json!(str_arg(args, 0).trim())))
            .with_transform("split", |args: &[Value]| {
                let delimiter = args.get(1).and_then(|v| v.as_str()).unwrap_or(",");
                let parts: Vec<&str> = str_arg(args, 0).split(delimiter).collect();
                Ok(json!(parts))
            })
            // Boolean transforms
            .with_transform("not", |args: &[Value]| {
                let val = args.first().cloned().unwrap_or(Value::Null);
                Ok(json!(!Self::value_to_bool(&val)))
            })
            // String search transforms
            .with_transform("contains", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).contains(str_arg(args, 1))))
            })
            .with_transform("startsWith", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).starts_with(str_arg(args, 1))))
            })
            .with_transform("endsWith", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).ends_with(str_arg(args, 1))))
            })
            // Substring match, not regex
            .with_transform("match", |args: &[Value]| {
                Ok(json!(str_arg(args, 0).contains(str_arg(args, 1))))
            })
            // Works on strings, arrays, and objects
            .with_transform("length", |args: &[Value]| {
                let len = match args.first() {
                    Some(Value::String(s)) => s.len(),
                    Some(Value::Array(a)) => a.len(),
                    Some(Value::Object(o)) => o.len(),
                    _ => 0,
                };
                Ok(json!(len as f64))
            });

        Self { evaluator }
    }

    /// Evaluate an expression to a boolean result.
    ///
    /// The `context` must be a JSON object. Expression results are coerced
    /// to boolean using JavaScript-like truthiness rules.
    pub fn evaluate_bool(&self, expression: &str, context: &Value) -> Result<bool, ExpressionError> {
        let result = self.evaluate_value(expression, context)?;
        Ok(Self::value_to_bool(&result))
    }

    /// Evaluate an expression and return the raw JSON value.
    pub fn evaluate_value(&self, expression: &str, context: &Value) -> Result<Value, ExpressionError> {
        if !context.is_object() {
            return Err(ExpressionError::InvalidContext(
                "context must be a JSON object".to_string(),
            ));
        }

        self.evaluator
            .eval_in_context(expression, context)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }

    /// Coerce a JSON value to boolean using JavaScript-like truthiness.
    fn value_to_bool(value: &Value) -> bool {
        match value {
            Value::Bool(b) => *b,
            Value::Null => false,
            Value::Number(n) => n.as_f64().unwrap_or(0.0) != 0.0,
            Value::String(s) => !s.is_empty(),
            Value::Array(_) | Value::Object(_) => true,
        }
    }
}

impl Default for WorkflowEvaluator {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Condition context
// ---------------------------------------------------------------------------

/// Build the JSON object a step condition evaluates against.
///
/// Shape:
/// ```json
/// {
///   "steps": { "<step_id>": { "status": "success", "exit_code": 0.0,
///                             "output": "...", "retries": 0.0, "error": null } },
///   "env": { "<VAR>": "..." },
///   "workflow": { "id": "...", "name": "...", "run_id": "..." }
/// }
/// ```
///
/// Numbers are floats because JEXL literals are parsed as `f64` and JSON
/// equality distinguishes integer from float representations.
pub fn condition_context(
    workflow: &Workflow,
    state: &RunState,
    env: &HashMap<String, String>,
) -> Value {
    let mut steps = Map::new();
    for (id, result) in &state.step_results {
        steps.insert(
            id.clone(),
            json!({
                "status": result.status.as_str(),
                "exit_code": result.exit_code.map(f64::from),
                "output": result.output,
                "retries": f64::from(result.retries),
                "error": result.error,
            }),
        );
    }

    json!({
        "steps": steps,
        "env": env,
        "workflow": {
            "id": workflow.id,
            "name": workflow.name,
            "run_id": state.run_id.to_string(),
        },
    })
}

/// Snapshot of the current process environment.
pub fn process_env() -> HashMap<String, String> {
    std::env::vars().collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
