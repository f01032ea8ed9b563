//! Command runner trait (port) for spawning step commands.
//!
//! The engine never spawns processes itself; the infrastructure layer
//! provides a shell-backed implementation.

/// Raw outcome of one command attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was killed by a signal.
    pub exit_code: Option<i32>,
    /// Combined stdout followed by stderr, lossily decoded.
    pub output: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Executes a single shell command to completion.
///
/// Timeouts are enforced by the caller by dropping the returned future, so
/// implementations must kill the child when dropped.
pub trait CommandRunner: Send + Sync {
    fn run(
        &self,
        command: &str,
    ) -> impl std::future::Future<Output = std::io::Result<CommandOutput>> + Send;
}
