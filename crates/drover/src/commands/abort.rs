//! Abort command - stop a task and mark it aborted.

use anyhow::Result;
use clap::Args;
use console::Style;

use drover_types::TaskStatus;

use super::{Context, styled_status};

/// Arguments for the abort command.
#[derive(Args, Debug)]
pub struct AbortArgs {
    /// Task ID
    pub tid: String,
}

/// Run the abort command.
pub async fn run(args: AbortArgs, ctx: &Context) -> Result<()> {
    let status = ctx.orchestrator.abort(&args.tid).await?;
    let dim = Style::new().dim();
    if status == TaskStatus::Aborted {
        println!("{} {}", dim.apply_to("Aborted:"), args.tid);
    } else {
        println!(
            "{} {} already {}",
            dim.apply_to("Unchanged:"),
            args.tid,
            styled_status(status)
        );
    }
    Ok(())
}
