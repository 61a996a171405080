//! Single-shot local-process backend.
//!
//! Each `start` spawns the engine CLI (e.g. `cwltool`) as a child process and
//! hands it to a supervisor task. The supervisor drains stdout and stderr
//! concurrently so the child never blocks on a full pipe: stderr is scanned
//! for the completion marker, stdout is accumulated until it parses as the
//! JSON outputs object. The exit code decides between `Completed` and
//! `Failed`.
//!
//! Run state lives in memory, and optionally in `<state_dir>/<run_id>.json`
//! so that `poll` from a later process can still answer for finished runs.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tempfile::TempDir;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::Notify;
use tracing::{debug, info, trace, warn};

use drover_types::{
    OutputValue, TaskMetadata, TaskStatus, Timestamp, WorkflowJob, WorkflowPackage,
};

use crate::engine::{Engine, EngineKind};
use crate::error::{EngineError, Result};

/// Runs accept exactly one input document.
const MAX_INPUT_DOCUMENTS: usize = 1;

/// Finished runs kept in memory when there is no state directory.
const MAX_FINISHED_RUNS: usize = 256;

/// Everything known about one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: String,
    pub status: TaskStatus,
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub start: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    /// Whether stderr carried the completion marker.
    #[serde(default)]
    pub saw_completion_marker: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outputs: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

struct RunEntry {
    state: RunState,
    cancel: Arc<Notify>,
}

type RunTable = Arc<Mutex<HashMap<String, RunEntry>>>;

/// Local CLI engine.
pub struct LocalProcessEngine {
    id: String,
    executable: String,
    options: Vec<String>,
    completion_marker: String,
    state_dir: Option<PathBuf>,
    runs: RunTable,
}

impl std::fmt::Debug for LocalProcessEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalProcessEngine")
            .field("executable", &self.executable)
            .field("options", &self.options)
            .field("state_dir", &self.state_dir)
            .finish_non_exhaustive()
    }
}

impl LocalProcessEngine {
    pub fn new(executable: impl Into<String>) -> Self {
        let executable = executable.into();
        let id = Path::new(&executable)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| executable.clone());
        Self {
            id,
            executable,
            options: Vec::new(),
            completion_marker: drover_config::DEFAULT_COMPLETION_MARKER.to_string(),
            state_dir: None,
            runs: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn with_options(mut self, options: Vec<String>) -> Self {
        self.options = options;
        self
    }

    pub fn with_completion_marker(mut self, marker: impl Into<String>) -> Self {
        self.completion_marker = marker.into();
        self
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = Some(dir.into());
        self
    }

    /// Current state of a run, from memory or the state directory.
    pub async fn run_state(&self, run_id: &str) -> Result<RunState> {
        if let Some(entry) = self.runs.lock().get(run_id) {
            return Ok(entry.state.clone());
        }
        match &self.state_dir {
            Some(dir) => read_state_file(dir, run_id).await,
            None => Err(EngineError::UnknownRun(run_id.to_string())),
        }
    }

    /// Write inline text to a scratch directory that lives as long as the run.
    fn materialize_inline(
        source: &str,
        inputs: &[String],
        dependencies: &[(String, String)],
    ) -> Result<(TempDir, PathBuf, Option<PathBuf>)> {
        let scratch = tempfile::Builder::new().prefix("drover-run-").tempdir()?;

        let workflow = scratch.path().join("workflow.cwl");
        std::fs::write(&workflow, source)?;

        let input = match inputs.first() {
            Some(doc) => {
                let path = scratch.path().join("inputs.yml");
                std::fs::write(&path, doc)?;
                Some(path)
            }
            None => None,
        };

        for (name, contents) in dependencies {
            let relative = Path::new(name);
            if relative.is_absolute()
                || relative
                    .components()
                    .any(|c| matches!(c, std::path::Component::ParentDir))
            {
                return Err(EngineError::Submission(format!(
                    "dependency name '{name}' must be a relative path inside the workflow"
                )));
            }
            let path = scratch.path().join(relative);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&path, contents)?;
        }

        Ok((scratch, workflow, input))
    }
}

#[async_trait]
impl Engine for LocalProcessEngine {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> EngineKind {
        EngineKind::LocalProcess
    }

    fn max_input_documents(&self) -> Option<usize> {
        Some(MAX_INPUT_DOCUMENTS)
    }

    async fn start(&self, package: &WorkflowPackage) -> Result<String> {
        let got = package.input_documents();
        if got > MAX_INPUT_DOCUMENTS {
            return Err(EngineError::UnsupportedInputShape {
                backend: EngineKind::LocalProcess.as_str(),
                max: MAX_INPUT_DOCUMENTS,
                got,
            });
        }

        let (scratch, workflow, input) = match package {
            WorkflowPackage::Paths {
                workflow, inputs, ..
            } => (None, workflow.clone(), inputs.first().cloned()),
            WorkflowPackage::Inline {
                source,
                inputs,
                dependencies,
            } => {
                let (dir, workflow, input) =
                    Self::materialize_inline(source, inputs, dependencies)?;
                (Some(dir), workflow, input)
            }
        };

        let mut command = vec![self.executable.clone()];
        command.extend(self.options.iter().cloned());
        command.push(workflow.to_string_lossy().into_owned());
        if let Some(input) = &input {
            command.push(input.to_string_lossy().into_owned());
        }

        // On failure `scratch` drops here and removes the materialized files.
        let mut child = Command::new(&command[0])
            .args(&command[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                EngineError::Submission(format!("failed to spawn '{}': {e}", self.executable))
            })?;

        let run_id = uuid::Uuid::new_v4().simple().to_string();
        let pid = child.id();
        info!(engine = %self.id, engine_tid = %run_id, pid = ?pid, command = ?command, "Engine process started");

        let state = RunState {
            run_id: run_id.clone(),
            status: TaskStatus::Running,
            command,
            pid,
            start: drover_types::now(),
            finish: None,
            exit_code: None,
            saw_completion_marker: false,
            outputs: None,
            error: None,
        };
        if let Some(dir) = &self.state_dir
            && let Err(e) = write_state_file(dir, &state).await
        {
            warn!(engine_tid = %run_id, error = %e, "Failed to write run state file");
        }

        let cancel = Arc::new(Notify::new());
        self.runs.lock().insert(
            run_id.clone(),
            RunEntry {
                state,
                cancel: cancel.clone(),
            },
        );

        let supervisor = Supervisor {
            run_id: run_id.clone(),
            marker: self.completion_marker.clone(),
            state_dir: self.state_dir.clone(),
            runs: self.runs.clone(),
            cancel,
            _scratch: scratch,
        };
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        tokio::spawn(supervisor.run(child, stdout, stderr));

        Ok(run_id)
    }

    async fn poll(&self, run_id: &str) -> Result<TaskStatus> {
        Ok(self.run_state(run_id).await?.status)
    }

    async fn fetch_metadata(&self, run_id: &str) -> Result<TaskMetadata> {
        let state = self.run_state(run_id).await?;
        let name = state
            .command
            .iter()
            .rev()
            .find(|arg| arg.ends_with(".cwl"))
            .and_then(|p| Path::new(p).file_stem())
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.id.clone());

        let mut job = WorkflowJob::new(run_id, name.clone(), state.status);
        job.start = Some(state.start);
        job.finish = state.finish;

        Ok(TaskMetadata {
            engine_tid: Some(run_id.to_string()),
            name: Some(name),
            start: Some(state.start),
            finish: state.finish,
            error: state.error,
            last_updated: Some(drover_types::now()),
            jobs: vec![job],
            ..TaskMetadata::with_status(state.status)
        })
    }

    async fn fetch_outputs(&self, run_id: &str) -> Result<BTreeMap<String, OutputValue>> {
        let state = self.run_state(run_id).await?;
        if !state.status.is_success() {
            return Err(EngineError::NotReady {
                run_id: run_id.to_string(),
                status: state.status,
            });
        }

        let mut outputs = BTreeMap::new();
        if let Some(Value::Object(map)) = &state.outputs {
            for (name, value) in map {
                outputs.insert(name.clone(), OutputValue::from_json(name, value)?);
            }
        }
        Ok(outputs)
    }

    async fn terminate(&self, run_id: &str) -> Result<()> {
        let cancel = self.runs.lock().get(run_id).map(|e| e.cancel.clone());
        match cancel {
            Some(cancel) => {
                info!(engine_tid = %run_id, "Terminating engine process");
                cancel.notify_one();
                Ok(())
            }
            None => {
                // Finished runs need nothing; live runs owned by another
                // process cannot be signalled from here.
                if let Ok(state) = self.run_state(run_id).await
                    && state.status.is_terminal()
                {
                    return Ok(());
                }
                Err(EngineError::Unsupported {
                    backend: "local",
                    operation: "terminating a run started by another process",
                })
            }
        }
    }

    async fn shutdown(&self) -> Result<()> {
        let live: Vec<Arc<Notify>> = self
            .runs
            .lock()
            .values()
            .filter(|e| !e.state.status.is_terminal())
            .map(|e| e.cancel.clone())
            .collect();
        if !live.is_empty() {
            info!(engine = %self.id, runs = live.len(), "Stopping engine processes");
        }
        for cancel in live {
            cancel.notify_one();
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Supervisor
// ─────────────────────────────────────────────────────────────────────────────

/// Owns a running child until it exits. Dropping it removes the scratch
/// directory, whichever way the run ends.
struct Supervisor {
    run_id: String,
    marker: String,
    state_dir: Option<PathBuf>,
    runs: RunTable,
    cancel: Arc<Notify>,
    _scratch: Option<TempDir>,
}

impl Supervisor {
    async fn run(
        self,
        mut child: Child,
        stdout: Option<impl AsyncRead + Unpin>,
        stderr: Option<impl AsyncRead + Unpin>,
    ) {
        let drains = async {
            tokio::join!(
                drain_stderr(stderr, &self.marker, &self.run_id),
                drain_stdout(stdout, &self.run_id)
            )
        };

        let outcome = tokio::select! {
            (saw_marker, outputs) = drains => {
                match child.wait().await {
                    Ok(exit) => Outcome::Exited { code: exit.code(), success: exit.success(), saw_marker, outputs },
                    Err(e) => Outcome::Lost(e.to_string()),
                }
            }
            _ = self.cancel.notified() => {
                if let Err(e) = child.start_kill() {
                    warn!(engine_tid = %self.run_id, error = %e, "Failed to kill engine process");
                }
                if let Err(e) = child.wait().await {
                    warn!(engine_tid = %self.run_id, error = %e, "Failed to reap killed engine process");
                }
                Outcome::Killed
            }
        };

        self.finish(outcome).await;
    }

    async fn finish(&self, outcome: Outcome) {
        let snapshot = {
            let mut runs = self.runs.lock();
            let Some(entry) = runs.get_mut(&self.run_id) else {
                return;
            };
            let state = &mut entry.state;
            state.finish = Some(drover_types::now());
            match outcome {
                Outcome::Exited {
                    code,
                    success,
                    saw_marker,
                    outputs,
                } => {
                    state.exit_code = code;
                    state.saw_completion_marker = saw_marker;
                    state.outputs = outputs;
                    if success {
                        state.status = TaskStatus::Completed;
                    } else {
                        state.status = TaskStatus::Failed;
                        state.error = Some(match code {
                            Some(code) => format!("engine exited with code {code}"),
                            None => "engine terminated by signal".to_string(),
                        });
                    }
                }
                Outcome::Killed => state.status = TaskStatus::Aborted,
                Outcome::Lost(error) => {
                    state.status = TaskStatus::Failed;
                    state.error = Some(error);
                }
            }
            state.clone()
        };

        info!(engine_tid = %self.run_id, status = %snapshot.status, exit_code = ?snapshot.exit_code, "Engine process finished");
        match &self.state_dir {
            // Once the state file holds the run, memory no longer needs to.
            Some(dir) => match write_state_file(dir, &snapshot).await {
                Ok(()) => {
                    self.runs.lock().remove(&self.run_id);
                }
                Err(e) => {
                    warn!(engine_tid = %self.run_id, error = %e, "Failed to write run state file");
                }
            },
            None => prune_finished(&mut self.runs.lock(), MAX_FINISHED_RUNS),
        }
    }
}

enum Outcome {
    Exited {
        code: Option<i32>,
        success: bool,
        saw_marker: bool,
        outputs: Option<Value>,
    },
    Killed,
    Lost(String),
}

/// Drop the oldest finished runs beyond `keep`.
fn prune_finished(runs: &mut HashMap<String, RunEntry>, keep: usize) {
    let mut finished: Vec<(Option<Timestamp>, String)> = runs
        .iter()
        .filter(|(_, e)| e.state.status.is_terminal())
        .map(|(id, e)| (e.state.finish, id.clone()))
        .collect();
    if finished.len() <= keep {
        return;
    }
    finished.sort();
    let excess = finished.len() - keep;
    for (_, id) in finished.into_iter().take(excess) {
        runs.remove(&id);
    }
}

/// Next line with invalid UTF-8 replaced. `None` at end of stream or on a
/// read error; a line that fails to decode never stops the drain.
async fn next_line_lossy(
    reader: &mut (impl AsyncBufRead + Unpin),
    buf: &mut Vec<u8>,
    run_id: &str,
) -> Option<String> {
    buf.clear();
    match reader.read_until(b'\n', buf).await {
        Ok(0) => None,
        Ok(_) => {
            let line = String::from_utf8_lossy(buf);
            Some(line.trim_end_matches(['\n', '\r']).to_string())
        }
        Err(e) => {
            warn!(engine_tid = %run_id, error = %e, "Engine stream read failed");
            None
        }
    }
}

/// Read stderr to the end; report whether the completion marker appeared.
async fn drain_stderr(stream: Option<impl AsyncRead + Unpin>, marker: &str, run_id: &str) -> bool {
    let Some(stream) = stream else {
        return false;
    };
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let mut saw_marker = false;
    while let Some(line) = next_line_lossy(&mut reader, &mut buf, run_id).await {
        let line = line.trim_end();
        if line.is_empty() {
            continue;
        }
        trace!(engine_tid = %run_id, "engine: {line}");
        if !saw_marker && line.contains(marker) {
            debug!(engine_tid = %run_id, "Completion marker seen");
            saw_marker = true;
        }
    }
    saw_marker
}

/// Read stdout to the end; keep the first JSON object it carries.
async fn drain_stdout(stream: Option<impl AsyncRead + Unpin>, run_id: &str) -> Option<Value> {
    let stream = stream?;
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let mut buffer = String::new();
    let mut parsed = None;
    while let Some(line) = next_line_lossy(&mut reader, &mut buf, run_id).await {
        if parsed.is_some() {
            continue;
        }
        if buffer.is_empty() && !line.trim_start().starts_with('{') {
            trace!(engine_tid = %run_id, "engine stdout: {line}");
            continue;
        }
        buffer.push_str(&line);
        buffer.push('\n');
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(&buffer) {
            parsed = Some(value);
        }
    }
    parsed
}

// ─────────────────────────────────────────────────────────────────────────────
// State files
// ─────────────────────────────────────────────────────────────────────────────

fn state_file(dir: &Path, run_id: &str) -> PathBuf {
    dir.join(format!("{run_id}.json"))
}

async fn write_state_file(dir: &Path, state: &RunState) -> Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let path = state_file(dir, &state.run_id);
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, serde_json::to_vec_pretty(state)?).await?;
    tokio::fs::rename(&tmp, &path).await?;
    Ok(())
}

async fn read_state_file(dir: &Path, run_id: &str) -> Result<RunState> {
    let path = state_file(dir, run_id);
    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(EngineError::UnknownRun(run_id.to_string()));
        }
        Err(e) => return Err(e.into()),
    };
    Ok(serde_json::from_slice(&bytes)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drain_stdout_skips_log_lines() {
        let data: &[u8] = b"INFO starting\n{\n  \"out\": 1\n}\nbye\n";
        let value = drain_stdout(Some(data), "r").await;
        assert_eq!(value, Some(serde_json::json!({"out": 1})));
    }

    #[tokio::test]
    async fn test_drain_stderr_finds_marker() {
        let data: &[u8] = b"[job] running\nFinal process status is success\ntrailing\n";
        assert!(drain_stderr(Some(data), "Final process status is success", "r").await);
        let data: &[u8] = b"[job] failed\n";
        assert!(!drain_stderr(Some(data), "Final process status is success", "r").await);
    }

    #[tokio::test]
    async fn test_drains_read_past_invalid_utf8() {
        let data: &[u8] = b"\xff\xfe binary\nFinal process status is success\n";
        assert!(drain_stderr(Some(data), "Final process status is success", "r").await);
        let data: &[u8] = b"log \xff\n{\"out\": 1}\n";
        let value = drain_stdout(Some(data), "r").await;
        assert_eq!(value, Some(serde_json::json!({"out": 1})));
    }

    fn finished_entry(run_id: &str, finish_secs: i64) -> RunEntry {
        RunEntry {
            state: RunState {
                run_id: run_id.into(),
                status: TaskStatus::Completed,
                command: vec![],
                pid: None,
                start: drover_types::now(),
                finish: chrono::DateTime::from_timestamp(finish_secs, 0),
                exit_code: Some(0),
                saw_completion_marker: true,
                outputs: None,
                error: None,
            },
            cancel: Arc::new(Notify::new()),
        }
    }

    #[test]
    fn test_prune_keeps_newest_finished_and_live_runs() {
        let mut runs = HashMap::new();
        for (id, secs) in [("a", 1), ("b", 2), ("c", 3)] {
            runs.insert(id.to_string(), finished_entry(id, secs));
        }
        let mut live = finished_entry("live", 0);
        live.state.status = TaskStatus::Running;
        live.state.finish = None;
        runs.insert("live".to_string(), live);

        prune_finished(&mut runs, 2);
        let mut left: Vec<&str> = runs.keys().map(String::as_str).collect();
        left.sort();
        assert_eq!(left, vec!["b", "c", "live"]);
    }

    #[tokio::test]
    async fn test_rejects_two_input_documents() {
        let engine = LocalProcessEngine::new("cwltool");
        let package = WorkflowPackage::Inline {
            source: "cwlVersion: v1.0".into(),
            inputs: vec!["a: 1".into(), "b: 2".into()],
            dependencies: vec![],
        };
        let err = engine.start(&package).await.unwrap_err();
        assert!(matches!(
            err,
            EngineError::UnsupportedInputShape { max: 1, got: 2, .. }
        ));
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let engine = LocalProcessEngine::new("/usr/bin/cwltool");
        assert_eq!(engine.id(), "cwltool");
        assert!(matches!(
            engine.poll("nope").await.unwrap_err(),
            EngineError::UnknownRun(_)
        ));
        assert!(engine.terminate("nope").await.unwrap_err().is_unsupported());
    }

    #[tokio::test]
    async fn test_state_file_roundtrip() {
        let dir = TempDir::new().unwrap();
        let state = RunState {
            run_id: "r1".into(),
            status: TaskStatus::Completed,
            command: vec!["cwltool".into()],
            pid: Some(42),
            start: drover_types::now(),
            finish: Some(drover_types::now()),
            exit_code: Some(0),
            saw_completion_marker: true,
            outputs: Some(serde_json::json!({"out": "/tmp/x"})),
            error: None,
        };
        write_state_file(dir.path(), &state).await.unwrap();

        let engine = LocalProcessEngine::new("cwltool").with_state_dir(dir.path());
        assert_eq!(engine.poll("r1").await.unwrap(), TaskStatus::Completed);
        let outputs = engine.fetch_outputs("r1").await.unwrap();
        assert_eq!(outputs["out"], OutputValue::Single("/tmp/x".into()));
    }
}
