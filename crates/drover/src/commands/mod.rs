//! CLI command handlers.

use console::{Style, StyledObject};
use indicatif::{ProgressBar, ProgressStyle};

use drover_config::DroverConfig;
use drover_task::Orchestrator;
use drover_types::TaskStatus;

pub mod abort;
pub mod environment;
pub mod metadata;
pub mod query;
pub mod resume;
pub mod status;
pub mod submit;
pub mod watch;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Merged configuration.
    pub config: DroverConfig,
    pub orchestrator: Orchestrator,
    /// Verbose output enabled.
    pub verbose: bool,
}

/// A status word colored by outcome.
pub fn styled_status(status: TaskStatus) -> StyledObject<&'static str> {
    let style = match status {
        TaskStatus::Completed => Style::new().green(),
        TaskStatus::Failed => Style::new().red(),
        TaskStatus::Aborted => Style::new().yellow(),
        TaskStatus::Running => Style::new().cyan(),
        TaskStatus::Processing | TaskStatus::Queued => Style::new().dim(),
    };
    style.apply_to(status.as_str())
}

/// Spinner on stderr for blocking operations. Hidden when stderr is not a
/// terminal.
pub fn spinner(message: impl Into<String>) -> anyhow::Result<ProgressBar> {
    let bar = ProgressBar::new_spinner();
    bar.set_style(ProgressStyle::with_template("{spinner:.cyan} {msg}")?);
    bar.set_message(message.into());
    bar.enable_steady_tick(std::time::Duration::from_millis(120));
    Ok(bar)
}
