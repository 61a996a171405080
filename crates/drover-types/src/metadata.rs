//! Snapshot of a task's observable state.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{OutputRecord, TaskStatus, Timestamp, WorkflowJob};

/// Rich task snapshot: status plus the per-job tree.
///
/// Engines fill the engine-side fields; the task manager adds the drover
/// task id, environment and persisted outputs when projecting from the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub engine_tid: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_updated: Option<Timestamp>,
    #[serde(default)]
    pub jobs: Vec<WorkflowJob>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<OutputRecord>,
}

impl TaskMetadata {
    /// An empty snapshot carrying only a status.
    pub fn with_status(status: TaskStatus) -> Self {
        Self {
            tid: None,
            engine_tid: None,
            name: None,
            environment: None,
            status,
            start: None,
            finish: None,
            execution_dir: None,
            error: None,
            last_updated: None,
            jobs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    /// Best-effort snapshot used while an engine has not registered the run yet.
    pub fn partial(engine_tid: impl Into<String>) -> Self {
        Self {
            engine_tid: Some(engine_tid.into()),
            ..Self::with_status(TaskStatus::Processing)
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Copy engine-observed fields from `live`, keeping drover-side identity.
    pub fn merge_live(&mut self, live: TaskMetadata) {
        if !self.status.is_terminal() {
            self.status = live.status;
        }
        self.engine_tid = live.engine_tid.or(self.engine_tid.take());
        self.name = live.name.or(self.name.take());
        self.start = live.start.or(self.start);
        self.finish = live.finish.or(self.finish);
        self.execution_dir = live.execution_dir.or(self.execution_dir.take());
        self.error = live.error.or(self.error.take());
        if !live.jobs.is_empty() {
            self.jobs = live.jobs;
        }
    }
}

impl fmt::Display for TaskMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dash = "-";
        writeln!(f, "TID:        {}", self.tid.as_deref().unwrap_or(dash))?;
        writeln!(f, "Engine TID: {}", self.engine_tid.as_deref().unwrap_or(dash))?;
        writeln!(f, "Name:       {}", self.name.as_deref().unwrap_or(dash))?;
        writeln!(f, "Env:        {}", self.environment.as_deref().unwrap_or(dash))?;
        writeln!(f, "Status:     {}", self.status)?;
        if let Some(start) = self.start {
            writeln!(f, "Start:      {}", start.to_rfc3339())?;
        }
        if let Some(finish) = self.finish {
            writeln!(f, "Finish:     {}", finish.to_rfc3339())?;
        }
        if let Some(dir) = &self.execution_dir {
            writeln!(f, "Exec dir:   {dir}")?;
        }
        if !self.jobs.is_empty() {
            writeln!(f, "Jobs:")?;
            for job in &self.jobs {
                write_job(f, job, 1)?;
            }
        }
        if !self.outputs.is_empty() {
            writeln!(f, "Outputs:")?;
            for out in &self.outputs {
                match &out.copied_path {
                    Some(path) => writeln!(f, "  {} -> {}", out.name, path.display())?,
                    None => writeln!(f, "  {}", out.name)?,
                }
            }
        }
        if let Some(error) = &self.error {
            writeln!(f, "Error:      {error}")?;
        }
        Ok(())
    }
}

fn write_job(f: &mut fmt::Formatter<'_>, job: &WorkflowJob, depth: usize) -> fmt::Result {
    let indent = "  ".repeat(depth);
    match job.shard {
        Some(shard) => writeln!(f, "{indent}[{}] {} (shard {shard})", job.status, job.name)?,
        None => writeln!(f, "{indent}[{}] {}", job.status, job.name)?,
    }
    for child in &job.jobs {
        write_job(f, child, depth + 1)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_live_keeps_terminal_status() {
        let mut stored = TaskMetadata::with_status(TaskStatus::Aborted);
        stored.tid = Some("t1".into());
        let mut live = TaskMetadata::with_status(TaskStatus::Completed);
        live.name = Some("hello".into());
        stored.merge_live(live);
        assert_eq!(stored.status, TaskStatus::Aborted);
        assert_eq!(stored.tid.as_deref(), Some("t1"));
        assert_eq!(stored.name.as_deref(), Some("hello"));
    }

    #[test]
    fn test_display_renders_job_tree() {
        let mut meta = TaskMetadata::with_status(TaskStatus::Running);
        meta.jobs = vec![
            WorkflowJob::new("wf", "wf", TaskStatus::Running)
                .with_child(WorkflowJob::new("wf.a", "a", TaskStatus::Completed)),
        ];
        let text = meta.to_string();
        assert!(text.contains("Status:     running"));
        assert!(text.contains("    [completed] a"));
    }
}
