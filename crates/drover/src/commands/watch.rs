//! Watch command - follow a task until it reaches a terminal status.

use anyhow::Result;
use clap::Args;
use console::Style;

use drover_types::TaskMetadata;

use super::{Context, spinner, styled_status};

/// Arguments for the watch command.
#[derive(Args, Debug)]
pub struct WatchArgs {
    /// Task ID
    pub tid: String,
}

fn running_jobs(meta: &TaskMetadata) -> usize {
    fn count(jobs: &[drover_types::WorkflowJob]) -> usize {
        jobs.iter()
            .map(|j| usize::from(j.status == drover_types::TaskStatus::Running) + count(&j.jobs))
            .sum()
    }
    count(&meta.jobs)
}

/// Run the watch command.
pub async fn run(args: WatchArgs, ctx: &Context) -> Result<()> {
    let bar = spinner(format!("{}: waiting", args.tid))?;
    let result = ctx
        .orchestrator
        .watch(&args.tid, |meta| {
            bar.set_message(format!(
                "{}: {} ({} running jobs)",
                args.tid,
                meta.status,
                running_jobs(meta)
            ));
        })
        .await;
    bar.finish_and_clear();

    let status = result?;
    let dim = Style::new().dim();
    println!("{} {}", dim.apply_to("Status:"), styled_status(status));
    Ok(())
}
