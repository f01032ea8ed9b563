//! Live progress rendering driven by engine events.
//!
//! The renderer subscribes to the event bus. Handlers run synchronously on
//! the engine's stack, so each step line is printed before the engine moves
//! on to the next step.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use termops_core::event::EventBus;
use termops_types::event::{Event, EventType};

#[derive(Default)]
struct RenderState {
    spinner: Option<ProgressBar>,
    total: usize,
}

/// Prints one line per step transition and a spinner while a step runs.
#[derive(Default)]
pub struct ProgressRenderer {
    state: Mutex<RenderState>,
}

impl ProgressRenderer {
    /// Subscribe a new renderer to every event on `bus`.
    pub fn attach(bus: &EventBus) -> Arc<Self> {
        let renderer = Arc::new(Self::default());
        let handle = Arc::clone(&renderer);
        bus.subscribe_all(move |event| handle.handle(event));
        renderer
    }

    fn lock(&self) -> MutexGuard<'_, RenderState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn handle(&self, event: &Event) {
        let mut state = self.lock();
        match event.event_type {
            EventType::WorkflowStart => {
                state.total = event.data["steps"].as_u64().unwrap_or(0) as usize;
                println!();
                println!("{}", start_line(event));
                println!();
            }
            EventType::WorkflowStep if event.data_str("phase") == Some("start") => {
                let index = event.data["index"].as_u64().unwrap_or(0) as usize;
                let name = event.data_str("name").unwrap_or("?");
                let spinner = ProgressBar::new_spinner();
                if let Ok(spinner_style) = ProgressStyle::default_spinner().template("  {spinner:.cyan} {msg}") {
                    spinner.set_style(spinner_style);
                }
                spinner.set_message(format!(
                    "{} {}",
                    style(format!("[{}/{}]", index + 1, state.total)).dim(),
                    name
                ));
                spinner.enable_steady_tick(Duration::from_millis(80));
                state.spinner = Some(spinner);
            }
            EventType::WorkflowStep => {
                if let Some(spinner) = state.spinner.take() {
                    spinner.finish_and_clear();
                }
                if let Some(line) = step_line(event, state.total) {
                    println!("{line}");
                }
            }
            EventType::WorkflowComplete | EventType::WorkflowRollback => {
                if let Some(spinner) = state.spinner.take() {
                    spinner.finish_and_clear();
                }
            }
            EventType::WorkflowCheckpoint => {}
        }
    }
}

fn start_line(event: &Event) -> String {
    let name = event.data_str("workflow_name").unwrap_or("workflow");
    let run = event.run_id.map(|id| short_id(&id.to_string())).unwrap_or_default();
    if event.data["resumed"].as_bool().unwrap_or(false) {
        let start = event.data["start_idx"].as_u64().unwrap_or(0) + 1;
        format!(
            "  Resuming {} at step {} (run {})",
            style(name).cyan(),
            start,
            style(run).dim()
        )
    } else {
        format!("  Running {} (run {})", style(name).cyan(), style(run).dim())
    }
}

/// Line printed when a step finishes or is rolled back.
fn step_line(event: &Event, total: usize) -> Option<String> {
    let phase = event.data_str("phase")?;
    let index = event.data["index"].as_u64().unwrap_or(0) as usize;
    let name = event.data_str("name").unwrap_or("?");
    let status = event.data_str("status").unwrap_or("?");
    let duration = event.data["duration_ms"].as_u64().map(format_duration);
    let position = style(format!("[{}/{}]", index + 1, total)).dim();

    let line = match (phase, status) {
        ("finish", "success") => {
            let retries = event.data["retries"].as_u64().unwrap_or(0);
            let mut line = format!("  {} {position} {name}", style("✓").green());
            if retries > 0 {
                line.push_str(&format!(" {}", style(format!("after {retries} retries")).yellow()));
            }
            append_duration(line, duration)
        }
        ("finish", "skipped") => {
            format!("  {} {position} {name} {}", style("↷").dim(), style("skipped").dim())
        }
        ("finish", _) => {
            let exit = event.data["exit_code"]
                .as_i64()
                .map(|code| format!("exit {code}"))
                .unwrap_or_else(|| "no exit code".to_string());
            append_duration(
                format!("  {} {position} {name} {}", style("✗").red(), style(exit).red()),
                duration,
            )
        }
        ("rollback", "rolledback") => append_duration(
            format!("  {} {name} {}", style("↺").magenta(), style("rolled back").magenta()),
            duration,
        ),
        ("rollback", _) => append_duration(
            format!("  {} {name} {}", style("✗").red(), style("rollback failed").red()),
            duration,
        ),
        _ => return None,
    };
    Some(line)
}

fn append_duration(mut line: String, duration: Option<String>) -> String {
    if let Some(d) = duration {
        line.push_str(&format!(" {}", style(format!("({d})")).dim()));
    }
    line
}

/// Human-readable duration: `120ms`, `4.2s`, `3m05s`.
pub fn format_duration(ms: u64) -> String {
    match ms {
        0..1_000 => format!("{ms}ms"),
        1_000..60_000 => format!("{:.1}s", ms as f64 / 1000.0),
        _ => format!("{}m{:02}s", ms / 60_000, (ms % 60_000) / 1000),
    }
}

/// First 8 characters of a run ID, as shown in tables.
pub fn short_id(id: &str) -> String {
    id.chars().take(8).collect()
}
