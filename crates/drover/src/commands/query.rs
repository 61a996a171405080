//! Query command - list tasks under the task root.

use anyhow::Result;
use clap::Args;
use console::{Style, style};

use drover_types::TaskStatus;

use super::{Context, styled_status};

/// Arguments for the query command.
#[derive(Args, Debug)]
pub struct QueryArgs {
    /// Only tasks with this status
    #[arg(short, long)]
    pub status: Option<TaskStatus>,

    /// Only tasks in this environment
    #[arg(short, long)]
    pub environment: Option<String>,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

/// Run the query command.
pub async fn run(args: QueryArgs, ctx: &Context) -> Result<()> {
    let records = ctx
        .orchestrator
        .list_tasks(args.status, args.environment.as_deref())?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }

    let dim = Style::new().dim();
    if records.is_empty() {
        println!("{}", dim.apply_to("No tasks"));
        return Ok(());
    }

    println!("{}", style("Tasks").bold());
    println!("{}", dim.apply_to("─".repeat(40)));
    for record in &records {
        let created = record
            .created_at
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "  {}  {:<10}  {:<12}  {}  {}",
            record.tid,
            styled_status(record.status),
            record.environment.as_deref().unwrap_or("-"),
            dim.apply_to(created),
            record.name.as_deref().unwrap_or("")
        );
    }
    if ctx.verbose {
        println!();
        println!(
            "  {} {}",
            dim.apply_to("Task root:"),
            ctx.orchestrator.context().task_root.display()
        );
    }
    Ok(())
}
