//! Metadata command - show what is known about one task or all of them.

use anyhow::Result;
use clap::Args;
use console::Style;

use super::Context;

/// Arguments for the metadata command.
#[derive(Args, Debug)]
pub struct MetadataArgs {
    /// Task ID, or `*` for every task
    pub tid: String,

    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

/// Run the metadata command.
pub async fn run(args: MetadataArgs, ctx: &Context) -> Result<()> {
    let all = if args.tid == "*" {
        ctx.orchestrator.metadata_all().await?
    } else {
        vec![ctx.orchestrator.metadata(&args.tid).await?]
    };

    if args.json {
        if args.tid == "*" {
            println!("{}", serde_json::to_string_pretty(&all)?);
        } else if let Some(meta) = all.first() {
            println!("{}", serde_json::to_string_pretty(meta)?);
        }
        return Ok(());
    }

    let dim = Style::new().dim();
    for (i, meta) in all.iter().enumerate() {
        if i > 0 {
            println!("{}", dim.apply_to("─".repeat(40)));
        }
        print!("{meta}");
    }
    Ok(())
}
