//! The per-task lifecycle state machine.
//!
//! ```text
//! Created -> DirectoryScaffolded -> WorkflowMaterialized -> Submitted
//!         -> poll loop -> terminal -> OutputsCopied -> MetadataSaved
//! ```
//!
//! Each arrow is a progress marker in the task store. A manager built for an
//! existing task walks the markers and starts at the first one missing, so a
//! step that finished before a restart is never repeated and a step that was
//! interrupted is simply run again.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use drover_config::PollingConfig;
use drover_engine::{CopyOptions, Environment, EnvironmentRegistry, check_input_shape, copy_output};
use drover_store::{StoreOptions, TaskDb, TaskStore};
use drover_types::{
    InfoKey, MaterializedWorkflow, ProgressKey, TaskMetadata, TaskStatus, ValidationRequirements,
    WorkflowGraph,
};

use crate::error::{Result, TaskError};
use crate::layout::TaskLayout;
use crate::notifier::{Notifier, TaskSummary};
use crate::translator::Translator;

/// Upper bound on asking an engine for its version when a task is opened.
const VERSION_PROBE_TIMEOUT: Duration = Duration::from_secs(5);

// ─────────────────────────────────────────────────────────────────────────────
// Context
// ─────────────────────────────────────────────────────────────────────────────

/// Everything a manager needs besides the task itself.
#[derive(Clone)]
pub struct ManagerContext {
    pub task_root: PathBuf,
    pub registry: Arc<EnvironmentRegistry>,
    pub translator: Arc<dyn Translator>,
    pub notifier: Arc<dyn Notifier>,
    pub polling: PollingConfig,
}

impl std::fmt::Debug for ManagerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagerContext")
            .field("task_root", &self.task_root)
            .field("registry", &self.registry)
            .field("translator", &self.translator.id())
            .field("polling", &self.polling)
            .finish_non_exhaustive()
    }
}

impl ManagerContext {
    pub fn new(
        task_root: impl Into<PathBuf>,
        registry: Arc<EnvironmentRegistry>,
        translator: Arc<dyn Translator>,
        notifier: Arc<dyn Notifier>,
        polling: PollingConfig,
    ) -> Self {
        Self {
            task_root: task_root.into(),
            registry,
            translator,
            notifier,
            polling,
        }
    }

    pub fn layout(&self, tid: &str) -> TaskLayout {
        TaskLayout::new(&self.task_root, tid)
    }

    pub fn store_options(&self) -> StoreOptions {
        StoreOptions {
            busy_timeout: self.polling.store_busy_timeout(),
            ..StoreOptions::default()
        }
    }

    /// Open the store of an existing task.
    pub fn open_store(&self, tid: &str) -> Result<TaskStore> {
        let layout = self.layout(tid);
        if !layout.exists() {
            return Err(TaskError::NotFound(tid.to_string()));
        }
        Ok(TaskStore::open(
            layout.store_path(),
            tid,
            self.store_options(),
        )?)
    }
}

/// Stored state of a task as a metadata snapshot: the record, the job tree
/// and the outputs. `None` when the task has no metadata rows yet.
pub fn project(db: &TaskDb<'_>) -> drover_store::Result<Option<TaskMetadata>> {
    let Some(record) = db.metadata().task()? else {
        return Ok(None);
    };
    let mut meta = record.to_metadata();
    meta.jobs = db.jobs().get_tree()?;
    meta.outputs = db.outputs().get_all()?;
    Ok(Some(meta))
}

fn is_transient(e: &TaskError) -> bool {
    matches!(e, TaskError::Store(s) if s.is_transient())
}

// ── JSON files ──────────────────────────────────────────────────────────

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, serde_json::to_vec_pretty(value)?)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let bytes = std::fs::read(path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn read_json_opt<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Task Manager
// ─────────────────────────────────────────────────────────────────────────────

/// Owns one task's lifecycle.
///
/// The store is authoritative: nothing about the task's progress is cached
/// in memory, so several managers (in different processes) may look at the
/// same task and only the markers decide what still needs doing.
pub struct TaskManager {
    layout: TaskLayout,
    store: TaskStore,
    environment: Arc<Environment>,
    translator: Arc<dyn Translator>,
    notifier: Arc<dyn Notifier>,
    polling: PollingConfig,
}

impl std::fmt::Debug for TaskManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskManager")
            .field("tid", &self.layout.tid())
            .field("environment", &self.environment.id)
            .finish_non_exhaustive()
    }
}

impl TaskManager {
    fn assemble(
        ctx: &ManagerContext,
        layout: TaskLayout,
        store: TaskStore,
        environment: Arc<Environment>,
    ) -> Self {
        Self {
            layout,
            store,
            environment,
            translator: ctx.translator.clone(),
            notifier: ctx.notifier.clone(),
            polling: ctx.polling.clone(),
        }
    }

    /// Create a new task for `graph` and materialize its workflow.
    ///
    /// Submission and polling happen in [`resume`](Self::resume). If
    /// translation fails the task still exists and a later resume retries it.
    pub async fn from_workflow(
        ctx: &ManagerContext,
        graph: &WorkflowGraph,
        environment_id: &str,
        validation: Option<&ValidationRequirements>,
    ) -> Result<Self> {
        let environment = ctx.registry.resolve(environment_id)?;
        let tid = drover_types::new_task_id();
        let layout = ctx.layout(&tid);
        layout.scaffold()?;

        let store = TaskStore::open(layout.store_path(), &tid, ctx.store_options())?;

        write_json(&layout.workflow_snapshot_path(), graph)?;
        if let Some(requirements) = validation {
            write_json(&layout.validation_requirements_path(), requirements)?;
        }

        store.write(|db| {
            let meta = db.metadata();
            meta.set(InfoKey::Environment, &environment.id)?;
            meta.set(InfoKey::EngineId, environment.engine.id())?;
            meta.set_bool(InfoKey::Validating, validation.is_some())?;
            meta.set(InfoKey::Name, &graph.name)?;
            meta.set_status(TaskStatus::Processing)?;
            db.inputs().insert_many(graph.inputs.iter())?;
            db.progress().mark(ProgressKey::DirectoryScaffolded)
        })?;
        info!(
            tid = %tid,
            environment = %environment.id,
            workflow = %graph.name,
            dir = %layout.dir().display(),
            "Task created"
        );

        let manager = Self::assemble(ctx, layout, store, environment);
        manager.record_versions().await;

        if let Err(e) = manager.materialize(graph, validation).await {
            warn!(tid = %tid, error = %e, "Workflow translation failed; resume the task to retry");
            return Err(e);
        }
        Ok(manager)
    }

    /// Open an existing task. Fails if its environment no longer resolves.
    pub async fn from_existing_tid(ctx: &ManagerContext, tid: &str) -> Result<Self> {
        let layout = ctx.layout(tid);
        let store = ctx.open_store(tid)?;

        let environment_id = store
            .read_now(|db| db.metadata().get(InfoKey::Environment))?
            .ok_or_else(|| TaskError::MissingMetadata {
                tid: tid.to_string(),
                key: InfoKey::Environment,
            })?;
        let environment = ctx.registry.resolve(&environment_id)?;

        let manager = Self::assemble(ctx, layout, store, environment);
        manager.record_versions().await;
        Ok(manager)
    }

    pub fn tid(&self) -> &str {
        self.layout.tid()
    }

    pub fn layout(&self) -> &TaskLayout {
        &self.layout
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    // ── Lifecycle ───────────────────────────────────────────────────────

    /// Run every step whose marker is missing, blocking until the task is
    /// terminal and its outputs and final metadata are saved.
    pub async fn resume(&self) -> Result<TaskStatus> {
        if !self.has(ProgressKey::DirectoryScaffolded)? {
            self.layout.scaffold()?;
            self.mark(ProgressKey::DirectoryScaffolded)?;
        }

        if !self.has(ProgressKey::WorkflowMaterialized)? {
            let graph: WorkflowGraph = read_json(&self.layout.workflow_snapshot_path())?;
            let validation: Option<ValidationRequirements> =
                read_json_opt(&self.layout.validation_requirements_path())?;
            self.materialize(&graph, validation.as_ref()).await?;
        }

        let stored = self.stored_status()?;
        let status = if stored.is_terminal() {
            debug!(tid = %self.tid(), status = %stored, "Task already terminal");
            stored
        } else {
            if !self.has(ProgressKey::Submitted)? {
                self.submit().await?;
            }
            self.poll_loop().await?
        };

        self.finish(status).await?;
        Ok(status)
    }

    async fn materialize(
        &self,
        graph: &WorkflowGraph,
        validation: Option<&ValidationRequirements>,
    ) -> Result<MaterializedWorkflow> {
        info!(tid = %self.tid(), translator = %self.translator.id(), "Materializing workflow");
        let materialized = self
            .translator
            .materialize(graph, &self.layout.workflow_dir(), validation)
            .await?;

        write_json(&self.layout.materialized_path(), &materialized)?;
        self.mark(ProgressKey::WorkflowMaterialized)?;
        Ok(materialized)
    }

    /// Paths recorded by the translator.
    pub fn materialized(&self) -> Result<MaterializedWorkflow> {
        read_json(&self.layout.materialized_path())
    }

    async fn submit(&self) -> Result<String> {
        let package = self.materialized()?.package();
        let engine = &self.environment.engine;
        check_input_shape(engine.as_ref(), &package)?;

        info!(tid = %self.tid(), engine = %engine.id(), "Submitting workflow");
        let engine_tid = engine.start(&package).await?;

        let recorded = self.store.write(|db| {
            let meta = db.metadata();
            meta.set_engine_tid(&engine_tid)?;
            meta.set_timestamp(InfoKey::Start, &drover_types::now())?;
            db.progress().mark(ProgressKey::Submitted)
        });
        if let Err(e) = recorded {
            // Nothing points at the run; stop it rather than leave it orphaned.
            warn!(tid = %self.tid(), engine_tid = %engine_tid, error = %e, "Could not record submission");
            self.terminate_engine(&engine_tid).await;
            return Err(e.into());
        }

        info!(tid = %self.tid(), engine_tid = %engine_tid, "Workflow submitted");
        Ok(engine_tid)
    }

    /// Poll until the task is terminal.
    ///
    /// An abort request (written to the store by any process) terminates the
    /// run and then waits at most `abort_grace_polls` more polls for the
    /// engine to confirm.
    async fn poll_loop(&self) -> Result<TaskStatus> {
        let tid = self.tid();
        let engine_tid = self
            .engine_tid()?
            .ok_or_else(|| TaskError::NotSubmitted(tid.to_string()))?;
        let engine = &self.environment.engine;

        let mut last_status = self.stored_status()?;
        let mut failures = 0u32;
        let mut abort_polls: Option<u32> = None;

        info!(tid = %tid, engine_tid = %engine_tid, "Polling engine");
        loop {
            if abort_polls.is_none() && self.abort_requested() {
                info!(tid = %tid, engine_tid = %engine_tid, "Abort requested, terminating run");
                self.terminate_engine(&engine_tid).await;
                abort_polls = Some(0);
            }

            match engine.fetch_metadata(&engine_tid).await {
                Ok(observed) => {
                    failures = 0;
                    match self.record_observation(&observed) {
                        Ok(current) => {
                            if current != last_status {
                                self.notify(current).await;
                                last_status = current;
                            }
                            // Aborted by another process while this poll was in flight.
                            if current == TaskStatus::Aborted && abort_polls.is_none() {
                                info!(tid = %tid, engine_tid = %engine_tid, "Task aborted elsewhere, terminating run");
                                self.terminate_engine(&engine_tid).await;
                                abort_polls = Some(0);
                            }
                            let done = match abort_polls {
                                Some(_) => observed.status.is_terminal(),
                                None => current.is_terminal(),
                            };
                            if done {
                                info!(tid = %tid, status = %current, "Task reached terminal status");
                                return Ok(current);
                            }
                        }
                        Err(e) if is_transient(&e) => {
                            debug!(tid = %tid, error = %e, "Store busy, observation skipped");
                        }
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => {
                    failures += 1;
                    warn!(tid = %tid, engine_tid = %engine_tid, error = %e, failures, "Poll failed");
                    if failures >= self.polling.max_consecutive_failures {
                        let message =
                            format!("engine unreachable after {failures} consecutive polls: {e}");
                        let current = self.record_failure(&message)?;
                        if current != last_status {
                            self.notify(current).await;
                        }
                        return Ok(current);
                    }
                }
            }

            if let Some(polls) = abort_polls.as_mut() {
                if *polls >= self.polling.abort_grace_polls {
                    warn!(tid = %tid, engine_tid = %engine_tid, "Engine did not confirm abort in time");
                    self.store
                        .write(|db| db.metadata().set_status(TaskStatus::Aborted))?;
                    let current = self.stored_status()?;
                    if current != last_status {
                        self.notify(current).await;
                    }
                    return Ok(current);
                }
                *polls += 1;
            }

            tokio::time::sleep(self.polling.interval()).await;
        }
    }

    /// Persist one engine observation and return the status the store now
    /// holds (which stays put once terminal).
    fn record_observation(&self, observed: &TaskMetadata) -> Result<TaskStatus> {
        let status = self.store.write(|db| {
            let meta = db.metadata();
            if !observed.jobs.is_empty() {
                db.jobs().update_or_insert_many(&observed.jobs)?;
            }
            meta.set_status(observed.status)?;
            if let Some(dir) = &observed.execution_dir {
                meta.set(InfoKey::ExecutionDir, dir)?;
            }
            if let Some(error) = &observed.error {
                meta.set(InfoKey::Error, error)?;
            }
            if let Some(start) = &observed.start {
                meta.set_timestamp(InfoKey::Start, start)?;
            }
            if let Some(finish) = &observed.finish {
                meta.set_timestamp(InfoKey::Finish, finish)?;
            }
            meta.set_timestamp(InfoKey::LastUpdated, &drover_types::now())?;
            Ok(meta.status()?.unwrap_or(observed.status))
        })?;
        debug!(tid = %self.tid(), observed = %observed.status, status = %status, "Observation recorded");
        Ok(status)
    }

    fn record_failure(&self, message: &str) -> Result<TaskStatus> {
        Ok(self.store.write(|db| {
            let meta = db.metadata();
            if meta.set_status(TaskStatus::Failed)? {
                meta.set(InfoKey::Error, message)?;
                meta.set_timestamp(InfoKey::Finish, &drover_types::now())?;
            }
            Ok(meta.status()?.unwrap_or(TaskStatus::Failed))
        })?)
    }

    async fn finish(&self, status: TaskStatus) -> Result<()> {
        if status.is_success() && !self.has(ProgressKey::OutputsCopied)? {
            self.copy_outputs().await?;
        }
        if !self.has(ProgressKey::MetadataSaved)? {
            self.save_final_metadata()?;
        }
        Ok(())
    }

    /// Fetch outputs and copy each into `outputs/`. The marker is only set
    /// once every output landed, so a retry copies all of them again.
    async fn copy_outputs(&self) -> Result<()> {
        let tid = self.tid();
        let engine_tid = self
            .engine_tid()?
            .ok_or_else(|| TaskError::NotSubmitted(tid.to_string()))?;
        let outputs = self.environment.engine.fetch_outputs(&engine_tid).await?;

        self.store
            .write(|db| db.outputs().insert_or_replace_many(outputs.iter()))?;

        let outputs_dir = self.layout.outputs_dir();
        let options = CopyOptions::default();
        for (name, value) in &outputs {
            let copied = copy_output(
                self.environment.filescheme.as_ref(),
                name,
                value,
                &outputs_dir,
                &options,
            )
            .await?;
            if let Some(primary) = &copied.primary {
                self.store
                    .write(|db| db.outputs().set_copied_path(name, primary))?;
            }
            debug!(tid = %tid, output = %name, files = copied.files.len(), "Output copied");
        }

        self.mark(ProgressKey::OutputsCopied)?;
        info!(tid = %tid, outputs = outputs.len(), dir = %outputs_dir.display(), "Outputs copied");
        Ok(())
    }

    fn save_final_metadata(&self) -> Result<()> {
        self.store.write(|db| {
            let meta = db.metadata();
            if meta.get(InfoKey::Finish)?.is_none() {
                meta.set_timestamp(InfoKey::Finish, &drover_types::now())?;
            }
            Ok(())
        })?;

        let snapshot = self.stored_metadata()?;
        write_json(&self.layout.final_metadata_path(), &snapshot)?;
        self.mark(ProgressKey::MetadataSaved)?;
        debug!(tid = %self.tid(), "Final metadata saved");
        Ok(())
    }

    // ── Queries and control ─────────────────────────────────────────────

    /// Last persisted status.
    pub fn status(&self) -> Result<TaskStatus> {
        self.stored_status()
    }

    /// Stored state, refreshed from the engine while the task is live.
    ///
    /// Read-only: nothing observed here is written back.
    pub async fn metadata(&self) -> Result<TaskMetadata> {
        let mut meta = match self.store.read(|db| project(db))? {
            Some(Some(meta)) => meta,
            Some(None) => TaskMetadata {
                tid: Some(self.tid().to_string()),
                ..TaskMetadata::with_status(TaskStatus::Processing)
            },
            None => {
                debug!(tid = %self.tid(), "Store busy, showing live state only");
                TaskMetadata {
                    tid: Some(self.tid().to_string()),
                    engine_tid: self.engine_tid().ok().flatten(),
                    ..TaskMetadata::with_status(TaskStatus::Processing)
                }
            }
        };

        if !meta.is_terminal()
            && let Some(engine_tid) = meta.engine_tid.clone()
        {
            match self.environment.engine.fetch_metadata(&engine_tid).await {
                Ok(live) => meta.merge_live(live),
                Err(e) => debug!(tid = %self.tid(), error = %e, "Live metadata unavailable"),
            }
        }
        Ok(meta)
    }

    /// Report metadata every poll interval until the task is terminal.
    pub async fn watch(&self, mut on_update: impl FnMut(&TaskMetadata)) -> Result<TaskStatus> {
        loop {
            let meta = self.metadata().await?;
            on_update(&meta);
            if meta.is_terminal() {
                return Ok(meta.status);
            }
            tokio::time::sleep(self.polling.interval()).await;
        }
    }

    /// Mark the task aborted and ask the engine to stop.
    ///
    /// Safe from any process: the poll loop (wherever it runs) sees the
    /// request in the store. A task that is already terminal is left alone.
    pub async fn abort(&self) -> Result<TaskStatus> {
        let status = self.store.write(|db| {
            let meta = db.metadata();
            if let Some(current) = meta.status()?
                && current.is_terminal()
            {
                return Ok(current);
            }
            meta.set_bool(InfoKey::AbortRequested, true)?;
            meta.set_status(TaskStatus::Aborted)?;
            meta.set_timestamp(InfoKey::Finish, &drover_types::now())?;
            Ok(TaskStatus::Aborted)
        })?;

        if status != TaskStatus::Aborted {
            info!(tid = %self.tid(), status = %status, "Task already finished, nothing to abort");
            return Ok(status);
        }

        info!(tid = %self.tid(), "Task aborted");
        if let Some(engine_tid) = self.engine_tid()? {
            self.terminate_engine(&engine_tid).await;
        }
        Ok(status)
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    fn has(&self, key: ProgressKey) -> Result<bool> {
        Ok(self.store.read_now(|db| db.progress().has(key))?)
    }

    fn mark(&self, key: ProgressKey) -> Result<()> {
        self.store.write(|db| db.progress().mark(key))?;
        debug!(tid = %self.tid(), marker = %key, "Progress marked");
        Ok(())
    }

    fn stored_status(&self) -> Result<TaskStatus> {
        Ok(self
            .store
            .read_now(|db| db.metadata().status())?
            .unwrap_or(TaskStatus::Processing))
    }

    fn stored_metadata(&self) -> Result<TaskMetadata> {
        Ok(self
            .store
            .read_now(|db| project(db))?
            .unwrap_or_else(|| TaskMetadata::with_status(TaskStatus::Processing)))
    }

    fn engine_tid(&self) -> Result<Option<String>> {
        Ok(self
            .store
            .read_now(|db| db.metadata().get(InfoKey::EngineTid))?)
    }

    fn abort_requested(&self) -> bool {
        match self
            .store
            .read(|db| db.metadata().get_bool(InfoKey::AbortRequested))
        {
            Ok(Some(requested)) => requested,
            Ok(None) => false,
            Err(e) => {
                warn!(tid = %self.tid(), error = %e, "Could not read abort flag");
                false
            }
        }
    }

    async fn terminate_engine(&self, engine_tid: &str) {
        match self.environment.engine.terminate(engine_tid).await {
            Ok(()) => {}
            Err(e) if e.is_unsupported() => {
                debug!(tid = %self.tid(), engine_tid = %engine_tid, error = %e, "Engine cannot terminate from here");
            }
            Err(e) => {
                warn!(tid = %self.tid(), engine_tid = %engine_tid, error = %e, "Terminate failed");
            }
        }
    }

    fn summary(&self) -> TaskSummary {
        let record = match self.store.read(|db| db.metadata().task()) {
            Ok(Some(record)) => record,
            _ => None,
        };
        TaskSummary {
            tid: self.tid().to_string(),
            name: record.as_ref().and_then(|r| r.name.clone()),
            environment: Some(self.environment.id.clone()),
            task_dir: self.layout.dir(),
            execution_dir: record.as_ref().and_then(|r| r.execution_dir.clone()),
            error: record.and_then(|r| r.error),
        }
    }

    async fn notify(&self, status: TaskStatus) {
        let summary = self.summary();
        if let Err(e) = self.notifier.notify(status, &summary).await {
            warn!(tid = %self.tid(), status = %status, error = %e, "Notification failed");
        }
    }

    /// Append the running drover and engine versions to the version history.
    async fn record_versions(&self) {
        let engine = &self.environment.engine;
        let engine_version = match tokio::time::timeout(VERSION_PROBE_TIMEOUT, engine.version()).await
        {
            Ok(Ok(version)) => version,
            Ok(Err(e)) => {
                debug!(tid = %self.tid(), error = %e, "Engine version unavailable");
                None
            }
            Err(_) => None,
        };

        let recorded = self.store.write(|db| {
            let versions = db.versions();
            versions.record("drover", env!("CARGO_PKG_VERSION"))?;
            if let Some(version) = &engine_version {
                versions.record(engine.id(), version)?;
            }
            Ok(())
        });
        if let Err(e) = recorded {
            debug!(tid = %self.tid(), error = %e, "Version history not recorded");
        }
    }
}
