//! Engine configuration types for termops.
//!
//! `EngineConfig` represents the top-level `config.toml` that controls step
//! timeouts, output capture limits, and where workflow files are searched.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level configuration for the workflow engine and CLI.
///
/// Loaded from `~/.termops/config.toml`. All fields have sensible defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Timeout applied to a step that does not declare `timeout_secs`.
    #[serde(default = "default_step_timeout_secs")]
    pub step_timeout_secs: u64,

    /// Ceiling on captured output per step, in bytes.
    #[serde(default = "default_max_output_bytes")]
    pub max_output_bytes: usize,

    /// Number of recent events retained by the event bus.
    #[serde(default = "default_event_history")]
    pub event_history: usize,

    /// Interpreter used to run step commands (`<shell> -c <command>`).
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Extra directories searched when locating a workflow file for resume.
    #[serde(default)]
    pub workflow_dirs: Vec<PathBuf>,

    /// Default number of rows shown by `workflow list`.
    #[serde(default = "default_list_limit")]
    pub list_limit: u32,
}

fn default_step_timeout_secs() -> u64 {
    300
}

fn default_max_output_bytes() -> usize {
    64 * 1024
}

fn default_event_history() -> usize {
    100
}

fn default_shell() -> String {
    "sh".to_string()
}

fn default_list_limit() -> u32 {
    20
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            step_timeout_secs: default_step_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            event_history: default_event_history(),
            shell: default_shell(),
            workflow_dirs: Vec::new(),
            list_limit: default_list_limit(),
        }
    }
}
