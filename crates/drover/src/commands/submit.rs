//! Submit command - create a task from a workflow file and run it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, Result, bail};
use clap::Args;
use console::{Style, style};
use serde_json::Value;

use drover_types::{ValidationRequirements, WorkflowGraph};

use super::{Context, spinner, styled_status};

/// Arguments for the submit command.
#[derive(Args, Debug)]
pub struct SubmitArgs {
    /// Workflow definition file
    pub workflow: PathBuf,

    /// Workflow name (defaults to the file stem)
    #[arg(short, long)]
    pub name: Option<String>,

    /// JSON object of workflow inputs
    #[arg(short, long)]
    pub inputs: Option<PathBuf>,

    /// Extra files the workflow imports
    #[arg(short, long = "dependency")]
    pub dependencies: Vec<PathBuf>,

    /// Environment to run in (defaults to the configured default)
    #[arg(short, long)]
    pub environment: Option<String>,

    /// Hand the run to the environment's submission template and return
    #[arg(long)]
    pub no_watch: bool,

    /// Truth VCF to validate calls against
    #[arg(long, requires = "reference")]
    pub truth_vcf: Option<String>,

    /// Reference genome for validation
    #[arg(long, requires = "truth_vcf")]
    pub reference: Option<String>,

    /// Intervals restricting validation
    #[arg(long, requires = "truth_vcf")]
    pub intervals: Option<String>,

    /// Fields compared during validation
    #[arg(long, value_delimiter = ',', requires = "truth_vcf")]
    pub fields: Vec<String>,
}

impl SubmitArgs {
    fn validation(&self) -> Option<ValidationRequirements> {
        let (truth_vcf, reference) = (self.truth_vcf.clone()?, self.reference.clone()?);
        Some(ValidationRequirements {
            truth_vcf,
            reference,
            intervals: self.intervals.clone(),
            fields: self.fields.clone(),
        })
    }

    fn graph(&self) -> Result<WorkflowGraph> {
        let name = match &self.name {
            Some(name) => name.clone(),
            None => self
                .workflow
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .context("workflow path has no file name")?,
        };
        let mut graph = WorkflowGraph::new(name, &self.workflow);
        graph.dependencies = self.dependencies.clone();
        if let Some(path) = &self.inputs {
            graph.inputs = read_inputs(path)?;
        }
        Ok(graph)
    }
}

fn read_inputs(path: &Path) -> Result<BTreeMap<String, Value>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("reading inputs from {}", path.display()))?;
    match serde_json::from_str(&contents)? {
        Value::Object(map) => Ok(map.into_iter().collect()),
        _ => bail!("inputs file {} must hold a JSON object", path.display()),
    }
}

/// Run the submit command.
pub async fn run(args: SubmitArgs, ctx: &Context) -> Result<()> {
    if !args.workflow.is_file() {
        bail!("workflow file not found: {}", args.workflow.display());
    }
    let graph = args.graph()?;
    let validation = args.validation();

    let orchestrator = &ctx.orchestrator;
    let tid = orchestrator
        .submit(&graph, args.environment.as_deref(), validation.as_ref())
        .await?;

    let dim = Style::new().dim();
    println!("{} {}", dim.apply_to("Task:"), style(&tid).bold());

    if args.no_watch {
        let handle = orchestrator.detach(&tid).await?;
        println!("{} {}", dim.apply_to("Detached:"), handle);
        println!(
            "  {}",
            dim.apply_to(format!("Follow it with: drover watch {tid}"))
        );
        return Ok(());
    }

    let bar = spinner(format!("Running {}", graph.name))?;
    let result = orchestrator.resume(&tid).await;
    bar.finish_and_clear();

    let status = result?;
    println!("{} {}", dim.apply_to("Status:"), styled_status(status));
    if !status.is_success() {
        bail!("task {tid} finished as {status}");
    }
    Ok(())
}
