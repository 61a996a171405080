//! Status command - print a task's last recorded status.

use anyhow::Result;
use clap::Args;

use super::{Context, styled_status};

/// Arguments for the status command.
#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Task ID
    pub tid: String,
}

/// Run the status command.
pub async fn run(args: StatusArgs, ctx: &Context) -> Result<()> {
    let status = ctx.orchestrator.status(&args.tid)?;
    println!("{}", styled_status(status));
    Ok(())
}
