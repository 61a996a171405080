//! Resume command - drive one task (or every unfinished one) to completion.

use anyhow::{Result, bail};
use clap::Args;
use console::Style;

use super::{Context, spinner, styled_status};

/// Arguments for the resume command.
#[derive(Args, Debug)]
pub struct ResumeArgs {
    /// Task ID
    #[arg(required_unless_present = "all", conflicts_with = "all")]
    pub tid: Option<String>,

    /// Resume every task that has not finished
    #[arg(long)]
    pub all: bool,
}

/// Run the resume command.
pub async fn run(args: ResumeArgs, ctx: &Context) -> Result<()> {
    let dim = Style::new().dim();
    let red = Style::new().red();

    let Some(tid) = args.tid else {
        let bar = spinner("Resuming unfinished tasks")?;
        let results = ctx.orchestrator.resume_all().await;
        bar.finish_and_clear();

        let results = results?;
        if results.is_empty() {
            println!("{}", dim.apply_to("No unfinished tasks"));
            return Ok(());
        }
        let mut failed = 0;
        for (tid, result) in &results {
            match result {
                Ok(status) => println!("  {tid}  {}", styled_status(*status)),
                Err(e) => {
                    failed += 1;
                    println!("  {tid}  {} {e}", red.apply_to("error"));
                }
            }
        }
        if failed > 0 {
            bail!("{failed} of {} tasks could not be resumed", results.len());
        }
        return Ok(());
    };

    let bar = spinner(format!("Resuming {tid}"))?;
    let result = ctx.orchestrator.resume(&tid).await;
    bar.finish_and_clear();

    let status = result?;
    println!("{} {}", dim.apply_to("Status:"), styled_status(status));
    Ok(())
}
