//! termops CLI entry point.
//!
//! Binary name: `termops`
//!
//! Parses CLI arguments, initializes tracing and the database, then
//! dispatches to the command handler.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;
use tokio_util::sync::CancellationToken;

use cli::{Cli, Commands};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = verbosity_filter(cli.verbose, cli.quiet);
    if let Err(e) = termops_observe::tracing_setup::init_tracing(filter, cli.otel) {
        eprintln!("Warning: failed to initialize tracing: {e}");
    }

    let outcome = run(cli).await;
    termops_observe::tracing_setup::shutdown_tracing();
    outcome
}

/// Default tracing filter for the `-v` count; `RUST_LOG` still overrides it.
fn verbosity_filter(verbose: u8, quiet: bool) -> &'static str {
    match verbose {
        0 if quiet => "error",
        0 => "warn",
        1 => "info,termops_core=debug,termops_infra=debug",
        _ => "trace",
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "termops", &mut std::io::stdout());
        return Ok(());
    }

    let state = AppState::init().await?;

    match cli.command {
        Commands::Workflow { action } => {
            let cancel = CancellationToken::new();
            let watcher = tokio::spawn(cancel_on_signal(cancel.clone(), cli.quiet || cli.json));
            let outcome =
                cli::workflow::handle_workflow_command(action, &state, &cancel, cli.json, cli.quiet)
                    .await;
            watcher.abort();
            outcome?;
        }

        Commands::Completions { .. } => unreachable!("handled above"),
    }

    Ok(())
}

/// Cancel `token` on the first Ctrl+C or SIGTERM.
///
/// The engine notices at the next step boundary. Further signals are
/// swallowed so the step in flight still finishes.
async fn cancel_on_signal(token: CancellationToken, silent: bool) {
    loop {
        shutdown_signal().await;
        if token.is_cancelled() {
            if !silent {
                eprintln!("  Still stopping: waiting for the current step to finish...");
            }
            continue;
        }
        token.cancel();
        if !silent {
            eprintln!();
            eprintln!(
                "  {} Stopping after the current step (further signals are ignored)",
                console::style("!").yellow().bold()
            );
        }
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbose_filter_enables_library_debug() {
        assert_eq!(verbosity_filter(0, true), "error");
        assert_eq!(verbosity_filter(0, false), "warn");
        let filter = verbosity_filter(1, false);
        assert!(filter.contains("termops_core=debug"));
        assert!(filter.contains("termops_infra=debug"));
        assert_eq!(verbosity_filter(3, true), "trace");
    }
}
