//! Drover - resumable workflow orchestration
//!
//! Main entry point for the drover CLI.

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use console::Style;

mod commands;

use commands::{abort, environment, metadata, query, resume, status, submit, watch};

// ─────────────────────────────────────────────────────────────────────────────
// CLI Structure
// ─────────────────────────────────────────────────────────────────────────────

/// Drover - resumable workflow orchestration across engines and environments
#[derive(Parser)]
#[command(name = "drover")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Use this config file instead of the discovered ones
    #[arg(short, long, global = true, env = "DROVER_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Submit a workflow and run it
    Submit(submit::SubmitArgs),

    /// Show the last recorded status of a task
    Status(status::StatusArgs),

    /// Follow a task until it finishes
    Watch(watch::WatchArgs),

    /// Abort a task
    Abort(abort::AbortArgs),

    /// Show task metadata
    Metadata(metadata::MetadataArgs),

    /// Continue a task from where it stopped
    Resume(resume::ResumeArgs),

    /// List tasks, optionally filtered
    Query(query::QueryArgs),

    /// Configured environments
    Environment(environment::EnvironmentArgs),
}

// ─────────────────────────────────────────────────────────────────────────────
// Main
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Console (human-readable) + rotating JSON file
    let filter = if cli.verbose {
        "drover=debug,drover_task=debug,drover_engine=debug,drover_store=debug,drover_config=debug,info"
    } else {
        "drover=info,drover_task=info,drover_engine=info,warn"
    };

    let log_dir = drover_config::xdg_config_dir()
        .map(|d| d.join("logs"))
        .unwrap_or_else(|| PathBuf::from("logs"));
    let file_appender = tracing_appender::rolling::daily(&log_dir, "drover.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    use tracing_subscriber::prelude::*;
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(std::io::stderr)
                .with_filter(tracing_subscriber::EnvFilter::new(filter)),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .json()
                .with_writer(non_blocking)
                .with_filter(tracing_subscriber::EnvFilter::new(
                    "drover=trace,drover_task=trace,drover_engine=trace,drover_store=debug,drover_config=debug,info",
                )),
        )
        .init();

    let config = match &cli.config {
        Some(path) => drover_config::load_config_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => {
            let cwd = std::env::current_dir().ok();
            let loaded = drover_config::load_config(cwd.as_deref())?;
            let yellow = Style::new().yellow();
            for warning in &loaded.warnings {
                eprintln!("{} {}", yellow.apply_to("warning:"), warning);
            }
            tracing::debug!(sources = ?loaded.loaded_from(), "Configuration loaded");
            loaded.config
        }
    };

    let mut orchestrator = drover_task::Orchestrator::new(&config);
    // A detached resume must see the same explicit config file.
    if let Some(path) = &cli.config {
        let exe = std::env::current_exe()?;
        orchestrator = orchestrator.with_resume_command(vec![
            exe.display().to_string(),
            "--config".to_string(),
            std::path::absolute(path)?.display().to_string(),
            "resume".to_string(),
        ]);
    }
    let ctx = commands::Context {
        config,
        orchestrator,
        verbose: cli.verbose,
    };

    let result = match cli.command {
        Commands::Submit(args) => submit::run(args, &ctx).await,
        Commands::Status(args) => status::run(args, &ctx).await,
        Commands::Watch(args) => watch::run(args, &ctx).await,
        Commands::Abort(args) => abort::run(args, &ctx).await,
        Commands::Metadata(args) => metadata::run(args, &ctx).await,
        Commands::Resume(args) => resume::run(args, &ctx).await,
        Commands::Query(args) => query::run(args, &ctx).await,
        Commands::Environment(args) => environment::run(args, &ctx).await,
    };

    ctx.orchestrator.shutdown().await;
    result
}
