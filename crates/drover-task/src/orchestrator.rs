//! The operations the CLI calls, one [`TaskManager`] per task.

use std::sync::Arc;

use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use drover_config::DroverConfig;
use drover_engine::EnvironmentRegistry;
use drover_store::TaskRecord;
use drover_types::{TaskMetadata, TaskStatus, ValidationRequirements, WorkflowGraph};

use crate::error::{Result, TaskError};
use crate::layout::discover_tasks;
use crate::manager::{ManagerContext, TaskManager, project};
use crate::notifier::MailNotifier;
use crate::translator::CopyTranslator;

/// Entry point for submitting and inspecting tasks.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    ctx: ManagerContext,
    default_environment: String,
    resume_command: Vec<String>,
}

impl Orchestrator {
    /// Build from configuration with the copy translator and mail notifier.
    pub fn new(config: &DroverConfig) -> Self {
        let ctx = ManagerContext::new(
            config.paths().effective_task_root(),
            Arc::new(EnvironmentRegistry::from_config(config)),
            Arc::new(CopyTranslator::new()),
            Arc::new(MailNotifier::new(config.notifications())),
            config.polling(),
        );
        Self::from_context(ctx).with_default_environment(config.default_environment_id())
    }

    pub fn from_context(ctx: ManagerContext) -> Self {
        Self {
            ctx,
            default_environment: drover_config::BUILTIN_LOCAL_ENVIRONMENT.to_string(),
            resume_command: Vec::new(),
        }
    }

    pub fn with_default_environment(mut self, id: impl Into<String>) -> Self {
        self.default_environment = id.into();
        self
    }

    /// Command a detached resume runs, before the task id is appended.
    /// Defaults to `<current executable> resume`.
    pub fn with_resume_command(mut self, command: Vec<String>) -> Self {
        self.resume_command = command;
        self
    }

    pub fn context(&self) -> &ManagerContext {
        &self.ctx
    }

    pub fn default_environment(&self) -> &str {
        &self.default_environment
    }

    pub fn environment_ids(&self) -> Vec<String> {
        self.ctx.registry.ids()
    }

    /// Create a task and materialize its workflow. Returns the new task id;
    /// run it with [`resume`](Self::resume) or [`detach`](Self::detach).
    pub async fn submit(
        &self,
        graph: &WorkflowGraph,
        environment_id: Option<&str>,
        validation: Option<&ValidationRequirements>,
    ) -> Result<String> {
        let environment_id = environment_id.unwrap_or(&self.default_environment);
        let manager =
            TaskManager::from_workflow(&self.ctx, graph, environment_id, validation).await?;
        Ok(manager.tid().to_string())
    }

    /// Hand the task's resume to its environment's submission template.
    pub async fn detach(&self, tid: &str) -> Result<String> {
        let manager = TaskManager::from_existing_tid(&self.ctx, tid).await?;

        let mut command = if self.resume_command.is_empty() {
            vec![
                std::env::current_exe()?.display().to_string(),
                "resume".to_string(),
            ]
        } else {
            self.resume_command.clone()
        };
        command.push(tid.to_string());

        let template = &manager.environment().template;
        let handle = template
            .submit_detached(tid, &command, &manager.layout().logs_dir())
            .await?;
        info!(tid = %tid, template = %template.id(), handle = %handle, "Task detached");
        Ok(handle)
    }

    /// Drive a task to completion from wherever it stopped.
    pub async fn resume(&self, tid: &str) -> Result<TaskStatus> {
        TaskManager::from_existing_tid(&self.ctx, tid)
            .await?
            .resume()
            .await
    }

    /// Resume every non-terminal task concurrently.
    pub async fn resume_all(&self) -> Result<Vec<(String, Result<TaskStatus>)>> {
        let pending: Vec<String> = self
            .list_tasks(None, None)?
            .into_iter()
            .filter(|record| !record.status.is_terminal())
            .map(|record| record.tid)
            .collect();
        info!(tasks = pending.len(), "Resuming tasks");

        let mut set = JoinSet::new();
        for tid in pending {
            let ctx = self.ctx.clone();
            set.spawn(async move {
                let result = match TaskManager::from_existing_tid(&ctx, &tid).await {
                    Ok(manager) => manager.resume().await,
                    Err(e) => Err(e),
                };
                (tid, result)
            });
        }

        let mut results = Vec::new();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((tid, result)) => {
                    if let Err(e) = &result {
                        warn!(tid = %tid, error = %e, "Resume failed");
                    }
                    results.push((tid, result));
                }
                Err(e) => warn!(error = %e, "Resume task panicked or was cancelled"),
            }
        }
        results.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(results)
    }

    /// Last persisted status. Works whether or not the environment resolves.
    pub fn status(&self, tid: &str) -> Result<TaskStatus> {
        let store = self.ctx.open_store(tid)?;
        Ok(store
            .read_now(|db| db.metadata().status())?
            .unwrap_or(TaskStatus::Processing))
    }

    /// Stored metadata, refreshed live when the environment is available.
    pub async fn metadata(&self, tid: &str) -> Result<TaskMetadata> {
        match TaskManager::from_existing_tid(&self.ctx, tid).await {
            Ok(manager) => manager.metadata().await,
            Err(TaskError::UnknownEnvironment(env)) => {
                warn!(tid = %tid, environment = %env, "Environment unavailable, showing stored metadata");
                let store = self.ctx.open_store(tid)?;
                Ok(store.read_now(|db| project(db))?.unwrap_or_else(|| TaskMetadata {
                    tid: Some(tid.to_string()),
                    ..TaskMetadata::with_status(TaskStatus::Processing)
                }))
            }
            Err(e) => Err(e),
        }
    }

    /// Metadata of every task under the task root.
    pub async fn metadata_all(&self) -> Result<Vec<TaskMetadata>> {
        let mut all = Vec::new();
        for record in self.list_tasks(None, None)? {
            all.push(self.metadata(&record.tid).await?);
        }
        Ok(all)
    }

    pub async fn watch(
        &self,
        tid: &str,
        on_update: impl FnMut(&TaskMetadata),
    ) -> Result<TaskStatus> {
        TaskManager::from_existing_tid(&self.ctx, tid)
            .await?
            .watch(on_update)
            .await
    }

    pub async fn abort(&self, tid: &str) -> Result<TaskStatus> {
        TaskManager::from_existing_tid(&self.ctx, tid)
            .await?
            .abort()
            .await
    }

    /// Tasks under the task root, oldest first, optionally filtered.
    ///
    /// A store that is busy or unreadable right now is skipped, not fatal.
    pub fn list_tasks(
        &self,
        status: Option<TaskStatus>,
        environment: Option<&str>,
    ) -> Result<Vec<TaskRecord>> {
        let mut records = Vec::new();
        for tid in discover_tasks(&self.ctx.task_root)? {
            let store = match self.ctx.open_store(&tid) {
                Ok(store) => store,
                Err(e) => {
                    warn!(tid = %tid, error = %e, "Skipping unreadable task");
                    continue;
                }
            };
            let record = match store.read(|db| db.metadata().task()) {
                Ok(Some(Some(record))) => record,
                Ok(Some(None)) => continue,
                Ok(None) => {
                    debug!(tid = %tid, "Task store busy, skipped");
                    continue;
                }
                Err(e) => {
                    warn!(tid = %tid, error = %e, "Skipping unreadable task");
                    continue;
                }
            };

            if status.is_some_and(|s| s != record.status) {
                continue;
            }
            if environment.is_some_and(|env| record.environment.as_deref() != Some(env)) {
                continue;
            }
            records.push(record);
        }
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    /// Release engine resources held by resolved environments.
    pub async fn shutdown(&self) {
        self.ctx.registry.shutdown().await;
    }
}
