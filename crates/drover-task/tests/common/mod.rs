//! Shared fixtures: a scripted engine, a counting translator and a
//! recording notifier wired into a task root under a temp dir.

#![allow(dead_code)]

use std::collections::{BTreeMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tempfile::TempDir;

use drover_config::PollingConfig;
use drover_engine::{
    Engine, EngineError, EngineKind, Environment, EnvironmentRegistry, LocalFileScheme,
    LocalTemplate,
};
use drover_task::{
    CopyTranslator, ManagerContext, Notifier, TaskSummary, Translator,
};
use drover_types::{
    MaterializedWorkflow, OutputValue, TaskMetadata, TaskStatus, ValidationRequirements,
    WorkflowGraph, WorkflowJob, WorkflowPackage,
};

pub const ENV_ID: &str = "mock";

// ─────────────────────────────────────────────────────────────────────────────
// Engine
// ─────────────────────────────────────────────────────────────────────────────

type PollHook = Box<dyn FnOnce() + Send>;

/// Reports a queued sequence of statuses, one per metadata poll; the last
/// one sticks.
pub struct ScriptedEngine {
    hook: Mutex<Option<(usize, PollHook)>>,
    script: Mutex<VecDeque<TaskStatus>>,
    current: Mutex<TaskStatus>,
    outputs: Mutex<BTreeMap<String, OutputValue>>,
    error: Mutex<Option<String>>,
    max_inputs: Option<usize>,
    failing_starts: AtomicUsize,
    unreachable: AtomicBool,
    pub starts: AtomicUsize,
    pub polls: AtomicUsize,
    pub terminates: AtomicUsize,
    pub output_fetches: AtomicUsize,
}

impl ScriptedEngine {
    pub fn new(script: &[TaskStatus]) -> Self {
        Self {
            hook: Mutex::new(None),
            script: Mutex::new(script.iter().copied().collect()),
            current: Mutex::new(TaskStatus::Queued),
            outputs: Mutex::new(BTreeMap::new()),
            error: Mutex::new(None),
            max_inputs: None,
            failing_starts: AtomicUsize::new(0),
            unreachable: AtomicBool::new(false),
            starts: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
            terminates: AtomicUsize::new(0),
            output_fetches: AtomicUsize::new(0),
        }
    }

    pub fn with_max_inputs(mut self, max: usize) -> Self {
        self.max_inputs = Some(max);
        self
    }

    pub fn with_output(self, name: &str, value: OutputValue) -> Self {
        self.outputs.lock().insert(name.to_string(), value);
        self
    }

    pub fn with_error(self, error: &str) -> Self {
        *self.error.lock() = Some(error.to_string());
        self
    }

    pub fn fail_next_starts(&self, n: usize) {
        self.failing_starts.store(n, Ordering::SeqCst);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Run `hook` during the `n`th metadata poll, before it answers.
    pub fn during_poll(&self, n: usize, hook: impl FnOnce() + Send + 'static) {
        *self.hook.lock() = Some((n, Box::new(hook)));
    }

    pub fn push(&self, status: TaskStatus) {
        self.script.lock().push_back(status);
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Engine for ScriptedEngine {
    fn id(&self) -> &str {
        "scripted"
    }

    fn kind(&self) -> EngineKind {
        EngineKind::Server
    }

    fn max_input_documents(&self) -> Option<usize> {
        self.max_inputs
    }

    async fn start(&self, _package: &WorkflowPackage) -> drover_engine::Result<String> {
        let n = self.starts.fetch_add(1, Ordering::SeqCst);
        let failing = self.failing_starts.load(Ordering::SeqCst);
        if failing > 0 {
            self.failing_starts.store(failing - 1, Ordering::SeqCst);
            return Err(EngineError::Submission("engine down".into()));
        }
        Ok(format!("run-{n}"))
    }

    async fn poll(&self, _run_id: &str) -> drover_engine::Result<TaskStatus> {
        Ok(*self.current.lock())
    }

    async fn fetch_metadata(&self, run_id: &str) -> drover_engine::Result<TaskMetadata> {
        let n = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        let hook = {
            let mut slot = self.hook.lock();
            match slot.take() {
                Some((at, hook)) if at == n => Some(hook),
                other => {
                    *slot = other;
                    None
                }
            }
        };
        if let Some(hook) = hook {
            hook();
        }
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(EngineError::Api {
                status: 503,
                message: "unavailable".into(),
            });
        }

        let status = {
            let mut current = self.current.lock();
            if let Some(next) = self.script.lock().pop_front() {
                *current = next;
            }
            *current
        };
        let error = if status == TaskStatus::Failed {
            self.error.lock().clone()
        } else {
            None
        };
        Ok(TaskMetadata {
            engine_tid: Some(run_id.to_string()),
            name: Some("hello".into()),
            execution_dir: Some(format!("/engine/{run_id}")),
            error,
            jobs: vec![
                WorkflowJob::new(run_id, "hello", status)
                    .with_child(WorkflowJob::new(format!("{run_id}/say"), "say", status)),
            ],
            ..TaskMetadata::with_status(status)
        })
    }

    async fn fetch_outputs(
        &self,
        run_id: &str,
    ) -> drover_engine::Result<BTreeMap<String, OutputValue>> {
        self.output_fetches.fetch_add(1, Ordering::SeqCst);
        let status = *self.current.lock();
        if !status.is_success() {
            return Err(EngineError::NotReady {
                run_id: run_id.to_string(),
                status,
            });
        }
        Ok(self.outputs.lock().clone())
    }

    async fn terminate(&self, _run_id: &str) -> drover_engine::Result<()> {
        self.terminates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn shutdown(&self) -> drover_engine::Result<()> {
        Ok(())
    }

    async fn version(&self) -> drover_engine::Result<Option<String>> {
        Ok(Some("scripted-1".into()))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Translator and notifier
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct CountingTranslator {
    inner: CopyTranslator,
    pub calls: AtomicUsize,
}

#[async_trait]
impl Translator for CountingTranslator {
    fn id(&self) -> &str {
        "counting"
    }

    async fn materialize(
        &self,
        graph: &WorkflowGraph,
        out_dir: &Path,
        validation: Option<&ValidationRequirements>,
    ) -> drover_task::Result<MaterializedWorkflow> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.materialize(graph, out_dir, validation).await
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub seen: Mutex<Vec<TaskStatus>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, status: TaskStatus, _summary: &TaskSummary) -> drover_task::Result<()> {
        self.seen.lock().push(status);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Fixture
// ─────────────────────────────────────────────────────────────────────────────

pub struct Fixture {
    pub root: TempDir,
    pub sources: TempDir,
    pub engine: Arc<ScriptedEngine>,
    pub translator: Arc<CountingTranslator>,
    pub notifier: Arc<RecordingNotifier>,
    pub ctx: ManagerContext,
}

pub fn polling() -> PollingConfig {
    PollingConfig {
        interval_secs: 0,
        abort_grace_polls: 3,
        max_consecutive_failures: 3,
        store_busy_timeout_ms: 1000,
    }
}

impl Fixture {
    pub fn new(engine: ScriptedEngine) -> Self {
        Self::build(|_| engine)
    }

    /// Build the engine once the sources dir exists, so its outputs can
    /// point at files in it.
    pub fn build(make_engine: impl FnOnce(&Path) -> ScriptedEngine) -> Self {
        let sources = TempDir::new().unwrap();
        let engine = Arc::new(make_engine(sources.path()));
        let registry = EnvironmentRegistry::new();
        registry.insert(Environment::new(
            ENV_ID,
            engine.clone(),
            Arc::new(LocalFileScheme::new()),
            Arc::new(LocalTemplate),
        ));

        let translator = Arc::new(CountingTranslator::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let root = TempDir::new().unwrap();
        let ctx = ManagerContext::new(
            root.path(),
            Arc::new(registry),
            translator.clone(),
            notifier.clone(),
            polling(),
        );

        Self {
            root,
            sources,
            engine,
            translator,
            notifier,
            ctx,
        }
    }

    /// A context over the same task root whose registry knows nothing.
    pub fn context_without_environments(&self) -> ManagerContext {
        ManagerContext {
            registry: Arc::new(EnvironmentRegistry::new()),
            ..self.ctx.clone()
        }
    }

    /// Write a file engines can "produce".
    pub fn source_file(&self, name: &str, contents: &str) -> PathBuf {
        write_file(self.sources.path(), name, contents)
    }

    pub fn graph(&self) -> WorkflowGraph {
        WorkflowGraph::new("hello", self.source_file("hello.cwl", "cwlVersion: v1.0"))
            .with_input("name", json!("world"))
            .with_input("count", json!(3))
    }

    pub fn translator_calls(&self) -> usize {
        self.translator.calls.load(Ordering::SeqCst)
    }

    pub fn notifications(&self) -> Vec<TaskStatus> {
        self.notifier.seen.lock().clone()
    }
}

pub fn write_file(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).unwrap();
    path
}

/// Poll `check` until it holds, for at most ~5 seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..500 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
