//! CLI command definitions for the `termops` binary.
//!
//! Uses clap derive macros for argument parsing. Workflow operations live
//! under `termops workflow <action>`.

pub mod progress;
pub mod workflow;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

/// Run multi-step shell workflows with checkpoint, resume, and rollback.
#[derive(Parser)]
#[command(name = "termops", version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Output machine-readable JSON instead of styled text.
    #[arg(long, global = true)]
    pub json: bool,

    /// Suppress all output except errors.
    #[arg(long, global = true)]
    pub quiet: bool,

    /// Detailed logging (-v for debug, -vv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Export tracing spans through OpenTelemetry (stdout exporter).
    #[arg(long, global = true, env = "TERMOPS_OTEL")]
    pub otel: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run, resume, inspect, and roll back workflows.
    #[command(alias = "wf")]
    Workflow {
        #[command(subcommand)]
        action: workflow::WorkflowCommand,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        shell: Shell,
    },
}
