//! Server-mode backend: a long-lived workflow server reached over HTTP.
//!
//! Speaks the Cromwell REST dialect. The server outlives any single task, so
//! every call is a plain request/response and `poll` works from any process.
//! Optionally the engine launches the server itself and kills it on
//! [`shutdown`](Engine::shutdown).

use std::collections::BTreeMap;
use std::path::Path;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use reqwest::StatusCode;
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::Value;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};
use url::Url;

use drover_types::{OutputValue, TaskMetadata, TaskStatus, WorkflowJob, WorkflowPackage};

use crate::engine::{Engine, EngineKind};
use crate::error::{EngineError, Result};

/// Default timeout for requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Delay between liveness probes while a launched server starts.
const STARTUP_PROBE_INTERVAL: Duration = Duration::from_millis(500);

/// The server accepts `workflowInputs` plus `workflowInputs_2` .. `_5`.
const MAX_INPUT_DOCUMENTS: usize = 5;

/// Workflow server engine.
pub struct ServerEngine {
    id: String,
    http: reqwest::Client,
    base_url: Url,
    timeout: Duration,
    launch_command: Option<Vec<String>>,
    startup_timeout: Duration,
    server: Mutex<Option<Child>>,
}

impl std::fmt::Debug for ServerEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerEngine")
            .field("id", &self.id)
            .field("base_url", &self.base_url.as_str())
            .field("launch_command", &self.launch_command)
            .finish_non_exhaustive()
    }
}

impl ServerEngine {
    /// Create an engine for the server at `url`.
    pub fn new(url: &str) -> Result<Self> {
        let mut base = url.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        Ok(Self {
            id: "cromwell".to_string(),
            http: reqwest::Client::builder().build()?,
            base_url: Url::parse(&base)?,
            timeout: DEFAULT_TIMEOUT,
            launch_command: None,
            startup_timeout: Duration::from_secs(60),
            server: Mutex::new(None),
        })
    }

    /// Start the server with `command` when it does not answer.
    pub fn with_launch_command(mut self, command: Vec<String>, startup_timeout: Duration) -> Self {
        self.launch_command = Some(command).filter(|c| !c.is_empty());
        self.startup_timeout = startup_timeout;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Internal HTTP methods
    // ─────────────────────────────────────────────────────────────────────────

    fn url(&self, path: &str) -> Result<Url> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    fn workflow_url(&self, run_id: &str, action: &str) -> Result<Url> {
        self.url(&format!("api/workflows/v1/{run_id}/{action}"))
    }

    async fn get(&self, url: Url) -> Result<reqwest::Response> {
        Ok(self
            .http
            .get(url)
            .timeout(self.timeout)
            .send()
            .await?)
    }

    /// Handle a response, extracting the body or error.
    async fn handle_response<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T> {
        if response.status().is_success() {
            Ok(response.json().await?)
        } else {
            Err(Self::extract_error(response).await)
        }
    }

    /// Extract an error from a failed response.
    async fn extract_error(response: reqwest::Response) -> EngineError {
        let status = response.status().as_u16();
        let message = match response.json::<ErrorResponse>().await {
            Ok(err) => err.message,
            Err(_) => format!("HTTP {status}"),
        };
        EngineError::Api { status, message }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Server process management
    // ─────────────────────────────────────────────────────────────────────────

    async fn is_alive(&self) -> bool {
        let Ok(url) = self.url("engine/v1/version") else {
            return false;
        };
        match self.get(url).await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }

    /// Make sure the server answers, launching it if configured to.
    async fn ensure_running(&self) -> Result<()> {
        let Some(command) = &self.launch_command else {
            return Ok(());
        };
        if self.is_alive().await {
            return Ok(());
        }

        {
            let mut server = self.server.lock();
            if server.is_none() {
                info!(engine = %self.id, command = ?command, "Launching workflow server");
                let child = Command::new(&command[0])
                    .args(&command[1..])
                    .stdin(Stdio::null())
                    .stdout(Stdio::null())
                    .stderr(Stdio::null())
                    .kill_on_drop(true)
                    .spawn()
                    .map_err(|e| {
                        EngineError::Submission(format!(
                            "failed to launch '{}': {e}",
                            command[0]
                        ))
                    })?;
                *server = Some(child);
            }
        }

        let deadline = Instant::now() + self.startup_timeout;
        while Instant::now() < deadline {
            if self.is_alive().await {
                info!(engine = %self.id, "Workflow server is up");
                return Ok(());
            }
            tokio::time::sleep(STARTUP_PROBE_INTERVAL).await;
        }
        Err(EngineError::Submission(format!(
            "server at {} did not answer within {:?}",
            self.base_url, self.startup_timeout
        )))
    }

    async fn build_form(&self, package: &WorkflowPackage) -> Result<Form> {
        let mut form = Form::new();
        match package {
            WorkflowPackage::Paths {
                workflow,
                inputs,
                dependencies,
            } => {
                form = form.part("workflowSource", file_part(workflow).await?);
                for (index, input) in inputs.iter().enumerate() {
                    form = form.part(inputs_field(index), file_part(input).await?);
                }
                if let Some(deps) = dependencies {
                    form = form.part("workflowDependencies", file_part(deps).await?);
                }
            }
            WorkflowPackage::Inline {
                source,
                inputs,
                dependencies,
            } => {
                if !dependencies.is_empty() {
                    return Err(EngineError::Unsupported {
                        backend: "server",
                        operation: "inline workflow dependencies",
                    });
                }
                form = form.part(
                    "workflowSource",
                    Part::text(source.clone()).file_name("workflow"),
                );
                for (index, input) in inputs.iter().enumerate() {
                    form = form.part(
                        inputs_field(index),
                        Part::text(input.clone()).file_name("inputs.json"),
                    );
                }
            }
        }
        Ok(form)
    }
}

fn inputs_field(index: usize) -> String {
    match index {
        0 => "workflowInputs".to_string(),
        n => format!("workflowInputs_{}", n + 1),
    }
}

async fn file_part(path: &Path) -> Result<Part> {
    let bytes = tokio::fs::read(path).await.map_err(|e| {
        EngineError::Submission(format!("cannot read {}: {e}", path.display()))
    })?;
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "file".to_string());
    Ok(Part::bytes(bytes).file_name(name))
}

#[async_trait]
impl Engine for ServerEngine {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Server
    }

    fn max_input_documents(&self) -> Option<usize> {
        Some(MAX_INPUT_DOCUMENTS)
    }

    async fn start(&self, package: &WorkflowPackage) -> Result<String> {
        self.ensure_running().await?;
        let form = self.build_form(package).await?;

        let url = self.url("api/workflows/v1")?;
        let response = self
            .http
            .post(url)
            .multipart(form)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| EngineError::Submission(format!("server unreachable: {e}")))?;

        let submitted: WorkflowIdAndStatus = match Self::handle_response(response).await {
            Ok(body) => body,
            Err(EngineError::Api { status, message }) => {
                return Err(EngineError::Submission(format!(
                    "server rejected workflow ({status}): {message}"
                )));
            }
            Err(e) => return Err(EngineError::Submission(e.to_string())),
        };
        if submitted.id.is_empty() {
            return Err(EngineError::Submission(
                "server returned an empty workflow id".into(),
            ));
        }

        info!(engine = %self.id, engine_tid = %submitted.id, "Workflow submitted");
        Ok(submitted.id)
    }

    async fn poll(&self, run_id: &str) -> Result<TaskStatus> {
        let response = self.get(self.workflow_url(run_id, "status")?).await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!(engine_tid = %run_id, "Run not registered yet");
            return Ok(TaskStatus::Processing);
        }
        let body: WorkflowIdAndStatus = Self::handle_response(response).await?;
        Ok(map_workflow_status(&body.status))
    }

    async fn fetch_metadata(&self, run_id: &str) -> Result<TaskMetadata> {
        let mut url = self.workflow_url(run_id, "metadata")?;
        url.query_pairs_mut()
            .append_pair("expandSubWorkflows", "true");

        let response = self.get(url).await?;
        if matches!(
            response.status(),
            StatusCode::NOT_FOUND | StatusCode::SERVICE_UNAVAILABLE
        ) {
            debug!(engine_tid = %run_id, status = %response.status(), "Metadata not available yet");
            return Ok(TaskMetadata::partial(run_id));
        }

        let body: WorkflowMetadata = Self::handle_response(response).await?;
        Ok(body.into_task_metadata(run_id))
    }

    async fn fetch_outputs(&self, run_id: &str) -> Result<BTreeMap<String, OutputValue>> {
        let status = self.poll(run_id).await?;
        if !status.is_success() {
            return Err(EngineError::NotReady {
                run_id: run_id.to_string(),
                status,
            });
        }

        let response = self.get(self.workflow_url(run_id, "outputs")?).await?;
        let body: WorkflowOutputs = Self::handle_response(response).await?;

        let mut outputs = BTreeMap::new();
        for (qualified, value) in &body.outputs {
            let name = strip_workflow_prefix(qualified);
            outputs.insert(name.to_string(), OutputValue::from_json(name, value)?);
        }
        Ok(outputs)
    }

    async fn terminate(&self, run_id: &str) -> Result<()> {
        let response = self
            .http
            .post(self.workflow_url(run_id, "abort")?)
            .timeout(self.timeout)
            .send()
            .await?;

        if response.status().is_success() {
            info!(engine_tid = %run_id, "Abort requested from server");
            return Ok(());
        }
        Err(Self::extract_error(response).await)
    }

    async fn shutdown(&self) -> Result<()> {
        let child = self.server.lock().take();
        if let Some(mut child) = child {
            info!(engine = %self.id, "Stopping workflow server");
            if let Err(e) = child.start_kill() {
                warn!(engine = %self.id, error = %e, "Failed to signal workflow server");
            }
            let _ = child.wait().await;
        }
        Ok(())
    }

    async fn version(&self) -> Result<Option<String>> {
        let response = self.get(self.url("engine/v1/version")?).await?;
        let body: BTreeMap<String, Value> = Self::handle_response(response).await?;
        Ok(body.into_iter().next().map(|(engine, version)| match version {
            Value::String(v) => format!("{engine}-{v}"),
            other => format!("{engine}-{other}"),
        }))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Wire types
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    message: String,
}

#[derive(Debug, Deserialize)]
struct WorkflowIdAndStatus {
    id: String,
    status: String,
}

#[derive(Debug, Deserialize)]
struct WorkflowOutputs {
    #[serde(default)]
    outputs: BTreeMap<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WorkflowMetadata {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    workflow_name: Option<String>,
    #[serde(default)]
    workflow_root: Option<String>,
    #[serde(default)]
    start: Option<DateTime<Utc>>,
    #[serde(default)]
    end: Option<DateTime<Utc>>,
    #[serde(default)]
    calls: BTreeMap<String, Vec<CallMetadata>>,
    #[serde(default)]
    failures: Vec<Failure>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallMetadata {
    #[serde(default)]
    shard_index: Option<i64>,
    #[serde(default)]
    attempt: Option<u32>,
    #[serde(default)]
    execution_status: Option<String>,
    #[serde(default)]
    start: Option<DateTime<Utc>>,
    #[serde(default)]
    end: Option<DateTime<Utc>>,
    #[serde(default)]
    sub_workflow_metadata: Option<Box<WorkflowMetadata>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Failure {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    caused_by: Vec<Failure>,
}

impl Failure {
    fn collect_messages(&self, out: &mut Vec<String>) {
        if let Some(message) = &self.message {
            out.push(message.clone());
        }
        for cause in &self.caused_by {
            cause.collect_messages(out);
        }
    }
}

impl WorkflowMetadata {
    fn into_task_metadata(self, run_id: &str) -> TaskMetadata {
        let status = self
            .status
            .as_deref()
            .map(map_workflow_status)
            .unwrap_or(TaskStatus::Processing);

        let mut messages = Vec::new();
        for failure in &self.failures {
            failure.collect_messages(&mut messages);
        }

        let name = self.workflow_name.clone();
        let root_id = self.id.clone().unwrap_or_else(|| run_id.to_string());
        let root = self.to_job(root_id, name.clone().unwrap_or_else(|| "workflow".into()), status);

        TaskMetadata {
            engine_tid: Some(run_id.to_string()),
            name,
            start: self.start,
            finish: self.end,
            execution_dir: self.workflow_root,
            error: (!messages.is_empty()).then(|| messages.join("; ")),
            last_updated: Some(drover_types::now()),
            jobs: vec![root],
            ..TaskMetadata::with_status(status)
        }
    }

    /// The workflow as a job node whose children are its calls.
    fn to_job(&self, id: String, name: String, status: TaskStatus) -> WorkflowJob {
        let mut job = WorkflowJob::new(id, name, status);
        job.start = self.start;
        job.finish = self.end;

        for (call, entries) in &self.calls {
            let short = strip_workflow_prefix(call);
            for entry in entries {
                let shard = entry
                    .shard_index
                    .filter(|s| *s >= 0)
                    .and_then(|s| u32::try_from(s).ok());
                let mut child_id = format!("{}/{}", job.id, short);
                if let Some(shard) = shard {
                    child_id.push_str(&format!("[{shard}]"));
                }
                if let Some(attempt) = entry.attempt.filter(|a| *a > 1) {
                    child_id.push_str(&format!("#{attempt}"));
                }
                let child_status = entry
                    .execution_status
                    .as_deref()
                    .map(map_call_status)
                    .unwrap_or(TaskStatus::Processing);

                let mut child = match &entry.sub_workflow_metadata {
                    Some(sub) => sub.to_job(child_id, short.to_string(), child_status),
                    None => WorkflowJob::new(child_id, short, child_status),
                };
                child.shard = shard;
                child.attempt = entry.attempt;
                child.start = entry.start.or(child.start);
                child.finish = entry.end.or(child.finish);
                job = job.with_child(child);
            }
        }
        job
    }
}

/// Map a workflow-level server status.
pub fn map_workflow_status(status: &str) -> TaskStatus {
    match status {
        "Submitted" => TaskStatus::Queued,
        "Running" | "Aborting" => TaskStatus::Running,
        "Succeeded" => TaskStatus::Completed,
        "Failed" => TaskStatus::Failed,
        "Aborted" => TaskStatus::Aborted,
        _ => TaskStatus::Processing,
    }
}

/// Map a call-level execution status.
fn map_call_status(status: &str) -> TaskStatus {
    match status {
        "Done" => TaskStatus::Completed,
        "Failed" | "RetryableFailure" | "Unstartable" => TaskStatus::Failed,
        "Aborted" => TaskStatus::Aborted,
        "Running" | "Aborting" => TaskStatus::Running,
        "QueuedInCromwell" | "Starting" | "WaitingForQueueSpace" => TaskStatus::Queued,
        _ => TaskStatus::Processing,
    }
}

/// `wf.out` -> `out`; names without a workflow prefix pass through.
fn strip_workflow_prefix(qualified: &str) -> &str {
    qualified
        .split_once('.')
        .map(|(_, rest)| rest)
        .unwrap_or(qualified)
}
