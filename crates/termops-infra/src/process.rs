//! Shell command runner for workflow steps.
//!
//! Implements [`CommandRunner`] by spawning `<shell> -c <command>` through
//! `tokio::process`. The child inherits the engine's environment and working
//! directory, gets a null stdin, and is killed when the future is dropped, so
//! a step timeout in the executor terminates the process.

use std::path::PathBuf;
use std::process::Stdio;

use termops_core::runner::{CommandOutput, CommandRunner};
use termops_types::config::EngineConfig;

/// Runs step commands through a POSIX-style shell.
#[derive(Debug, Clone)]
pub struct ShellCommandRunner {
    shell: String,
    working_dir: Option<PathBuf>,
}

impl ShellCommandRunner {
    /// Create a runner that invokes `shell -c <command>`.
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            working_dir: None,
        }
    }

    /// Create a runner using the configured shell.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(config.shell.clone())
    }

    /// Run commands in `dir` instead of the current directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn shell(&self) -> &str {
        &self.shell
    }
}

impl Default for ShellCommandRunner {
    fn default() -> Self {
        Self::new("sh")
    }
}

impl CommandRunner for ShellCommandRunner {
    async fn run(&self, command: &str) -> std::io::Result<CommandOutput> {
        let mut cmd = tokio::process::Command::new(&self.shell);
        cmd.arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let output = cmd.output().await?;

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        tracing::trace!(
            shell = %self.shell,
            exit_code = ?output.status.code(),
            bytes = combined.len(),
            "shell command finished"
        );

        Ok(CommandOutput {
            exit_code: output.status.code(),
            output: combined,
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
