//! Submission templates: how a detached `drover resume <tid>` is launched
//! so that the poll loop survives the submitting shell.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::info;

use crate::error::{EngineError, Result};

#[async_trait]
pub trait SubmissionTemplate: Send + Sync {
    fn id(&self) -> &str;

    /// Launch `command` detached from the caller. Returns a handle the user
    /// can recognise (a pid, a scheduler job id).
    async fn submit_detached(&self, tid: &str, command: &[String], log_dir: &Path)
    -> Result<String>;
}

/// Quote `arg` for a POSIX shell when it contains anything special.
pub fn shell_quote(arg: &str) -> String {
    let safe = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:@%+,".contains(c));
    if safe {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

fn shell_join(command: &[String]) -> String {
    command
        .iter()
        .map(|a| shell_quote(a))
        .collect::<Vec<_>>()
        .join(" ")
}

// ─────────────────────────────────────────────────────────────────────────────
// Local
// ─────────────────────────────────────────────────────────────────────────────

/// Run the command as a background process on this machine.
#[derive(Debug, Clone, Default)]
pub struct LocalTemplate;

#[async_trait]
impl SubmissionTemplate for LocalTemplate {
    fn id(&self) -> &str {
        "local"
    }

    async fn submit_detached(
        &self,
        tid: &str,
        command: &[String],
        log_dir: &Path,
    ) -> Result<String> {
        let (program, args) = command
            .split_first()
            .ok_or_else(|| EngineError::Submission("empty resume command".into()))?;

        tokio::fs::create_dir_all(log_dir).await?;
        let log = std::fs::File::create(log_dir.join("resume.log"))?;
        let log_err = log.try_clone()?;

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err)
            .spawn()
            .map_err(|e| EngineError::Submission(format!("failed to spawn '{program}': {e}")))?;

        let handle = child
            .id()
            .map(|pid| pid.to_string())
            .unwrap_or_else(|| "exited".to_string());
        info!(tid = %tid, pid = %handle, "Detached resume started");
        Ok(handle)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Slurm
// ─────────────────────────────────────────────────────────────────────────────

/// Wrap the command in an `sbatch --wrap` job.
#[derive(Debug, Clone)]
pub struct SlurmTemplate {
    queues: Vec<String>,
    prelude: Option<String>,
    time_minutes: u32,
    sbatch: String,
}

impl SlurmTemplate {
    pub fn new(queues: Vec<String>, prelude: Option<String>, time_minutes: u32) -> Self {
        Self {
            queues,
            prelude,
            time_minutes,
            sbatch: "sbatch".to_string(),
        }
    }

    /// Use a different `sbatch` binary.
    pub fn with_program(mut self, sbatch: impl Into<String>) -> Self {
        self.sbatch = sbatch.into();
        self
    }

    /// Arguments passed to `sbatch`.
    pub fn arguments(&self, tid: &str, command: &[String], log_dir: &Path) -> Vec<String> {
        let mut wrapped = shell_join(command);
        if let Some(prelude) = self.prelude.as_deref().filter(|p| !p.trim().is_empty()) {
            wrapped = format!("{prelude} && {wrapped}");
        }

        let mut args = Vec::new();
        if !self.queues.is_empty() {
            args.push("-p".to_string());
            args.push(self.queues.join(","));
        }
        args.extend([
            "-J".to_string(),
            format!("drover-{tid}"),
            "--time".to_string(),
            self.time_minutes.to_string(),
            "-o".to_string(),
            log_dir.join("slurm-%j.out").display().to_string(),
            "--wrap".to_string(),
            wrapped,
        ]);
        args
    }
}

/// `Submitted batch job 123` -> `123`.
fn parse_job_id(stdout: &str) -> Option<&str> {
    stdout
        .lines()
        .find_map(|line| line.trim().strip_prefix("Submitted batch job "))
        .map(str::trim)
}

#[async_trait]
impl SubmissionTemplate for SlurmTemplate {
    fn id(&self) -> &str {
        "slurm"
    }

    async fn submit_detached(
        &self,
        tid: &str,
        command: &[String],
        log_dir: &Path,
    ) -> Result<String> {
        if command.is_empty() {
            return Err(EngineError::Submission("empty resume command".into()));
        }
        tokio::fs::create_dir_all(log_dir).await?;

        let output = Command::new(&self.sbatch)
            .args(self.arguments(tid, command, log_dir))
            .output()
            .await
            .map_err(|e| EngineError::Submission(format!("failed to run {}: {e}", self.sbatch)))?;

        if !output.status.success() {
            return Err(EngineError::Submission(format!(
                "{} exited with {}: {}",
                self.sbatch,
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let job = parse_job_id(&stdout)
            .map(str::to_string)
            .unwrap_or_else(|| stdout.trim().to_string());
        info!(tid = %tid, job = %job, "Resume submitted to slurm");
        Ok(job)
    }
}
