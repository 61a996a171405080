//! Environment command - show configured environments.

use anyhow::Result;
use clap::{Args, Subcommand};
use console::{Style, style};

use drover_config::{EngineConfig, FileSchemeConfig, TemplateConfig};

use super::Context;

/// Arguments for the environment command.
#[derive(Args, Debug)]
pub struct EnvironmentArgs {
    #[command(subcommand)]
    pub command: Option<EnvironmentCommand>,
}

#[derive(Subcommand, Debug)]
pub enum EnvironmentCommand {
    /// List environment ids and their backends (default)
    List,
}

fn describe_engine(engine: &EngineConfig) -> String {
    match engine {
        EngineConfig::Server { url, .. } => format!("server {url}"),
        EngineConfig::Local { executable, .. } => format!("local {executable}"),
    }
}

fn describe_filescheme(scheme: &FileSchemeConfig) -> String {
    match scheme {
        FileSchemeConfig::Local => "local".to_string(),
        FileSchemeConfig::Ssh { host } => format!("ssh {host}"),
    }
}

fn describe_template(template: &TemplateConfig) -> String {
    match template {
        TemplateConfig::Local => "local".to_string(),
        TemplateConfig::Slurm { queues, .. } => format!("slurm {}", queues.join(",")),
    }
}

/// Run the environment command.
pub async fn run(args: EnvironmentArgs, ctx: &Context) -> Result<()> {
    match args.command.unwrap_or(EnvironmentCommand::List) {
        EnvironmentCommand::List => list(ctx),
    }
}

fn list(ctx: &Context) -> Result<()> {
    let dim = Style::new().dim();
    let default = ctx.config.default_environment_id();

    println!("{}", style("Environments").bold());
    println!("{}", dim.apply_to("─".repeat(40)));
    for id in ctx.config.environment_ids() {
        let Some(env) = ctx.config.environment(&id) else {
            continue;
        };
        let marker = if id == default { "*" } else { " " };
        println!("{marker} {}", style(&id).bold());
        println!("    {} {}", dim.apply_to("engine:"), describe_engine(&env.engine));
        println!(
            "    {} {}",
            dim.apply_to("files:"),
            describe_filescheme(&env.filescheme)
        );
        println!(
            "    {} {}",
            dim.apply_to("template:"),
            describe_template(&env.template)
        );
    }
    Ok(())
}
