//! Environments: named bindings of an engine, a file scheme and a
//! submission template, built from configuration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, warn};

use drover_config::{
    BUILTIN_LOCAL_ENVIRONMENT, DroverConfig, EngineConfig, EnvironmentConfig, FileSchemeConfig,
    TemplateConfig,
};

use crate::engine::Engine;
use crate::engines::{LocalProcessEngine, ServerEngine};
use crate::error::{EngineError, Result};
use crate::filescheme::{FileScheme, LocalFileScheme, SshFileScheme};
use crate::template::{LocalTemplate, SlurmTemplate, SubmissionTemplate};

/// A resolved environment.
#[derive(Clone)]
pub struct Environment {
    pub id: String,
    pub engine: Arc<dyn Engine>,
    pub filescheme: Arc<dyn FileScheme>,
    pub template: Arc<dyn SubmissionTemplate>,
}

impl std::fmt::Debug for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Environment")
            .field("id", &self.id)
            .field("engine", &self.engine.id())
            .field("filescheme", &self.filescheme.id())
            .field("template", &self.template.id())
            .finish()
    }
}

impl Environment {
    pub fn new(
        id: impl Into<String>,
        engine: Arc<dyn Engine>,
        filescheme: Arc<dyn FileScheme>,
        template: Arc<dyn SubmissionTemplate>,
    ) -> Self {
        Self {
            id: id.into(),
            engine,
            filescheme,
            template,
        }
    }

    /// Build the environment described by `config`.
    pub fn from_config(id: &str, config: &EnvironmentConfig) -> Result<Self> {
        let engine: Arc<dyn Engine> = match &config.engine {
            EngineConfig::Server {
                url,
                launch_command,
                startup_timeout_secs,
            } => {
                let mut engine = ServerEngine::new(url)?;
                if let Some(command) = launch_command {
                    engine = engine.with_launch_command(
                        command.clone(),
                        Duration::from_secs(*startup_timeout_secs),
                    );
                }
                Arc::new(engine)
            }
            EngineConfig::Local {
                executable,
                options,
                state_dir,
                completion_marker,
            } => {
                let mut engine = LocalProcessEngine::new(executable)
                    .with_options(options.clone())
                    .with_completion_marker(completion_marker);
                if let Some(dir) = state_dir {
                    engine = engine.with_state_dir(dir);
                }
                Arc::new(engine)
            }
        };

        let filescheme: Arc<dyn FileScheme> = match &config.filescheme {
            FileSchemeConfig::Local => Arc::new(LocalFileScheme::new()),
            FileSchemeConfig::Ssh { host } => Arc::new(SshFileScheme::new(host)),
        };

        let template: Arc<dyn SubmissionTemplate> = match &config.template {
            TemplateConfig::Local => Arc::new(LocalTemplate),
            TemplateConfig::Slurm {
                queues,
                prelude,
                time_minutes,
            } => Arc::new(SlurmTemplate::new(
                queues.clone(),
                prelude.clone(),
                *time_minutes,
            )),
        };

        Ok(Self::new(id, engine, filescheme, template))
    }
}

/// Every environment the process knows about, resolved lazily and at most
/// once per id so engine state (a launched server, tracked local runs) is
/// shared by all tasks using it.
#[derive(Default)]
pub struct EnvironmentRegistry {
    configs: HashMap<String, EnvironmentConfig>,
    resolved: Mutex<HashMap<String, Arc<Environment>>>,
}

impl std::fmt::Debug for EnvironmentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvironmentRegistry")
            .field("ids", &self.ids())
            .finish_non_exhaustive()
    }
}

impl EnvironmentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_config(config: &DroverConfig) -> Self {
        let mut configs = config.environments.clone();
        configs
            .entry(BUILTIN_LOCAL_ENVIRONMENT.to_string())
            .or_default();
        Self {
            configs,
            resolved: Mutex::new(HashMap::new()),
        }
    }

    /// Register an already-built environment, replacing any config entry.
    pub fn insert(&self, environment: Environment) {
        self.resolved
            .lock()
            .insert(environment.id.clone(), Arc::new(environment));
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.configs.keys().cloned().collect();
        for id in self.resolved.lock().keys() {
            if !self.configs.contains_key(id) {
                ids.push(id.clone());
            }
        }
        ids.sort();
        ids
    }

    pub fn config(&self, id: &str) -> Option<&EnvironmentConfig> {
        self.configs.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.configs.contains_key(id) || self.resolved.lock().contains_key(id)
    }

    /// Resolve an environment id.
    pub fn resolve(&self, id: &str) -> Result<Arc<Environment>> {
        if let Some(env) = self.resolved.lock().get(id) {
            return Ok(env.clone());
        }

        let config = self
            .configs
            .get(id)
            .ok_or_else(|| EngineError::UnknownEnvironment(id.to_string()))?;
        let built = Arc::new(Environment::from_config(id, config)?);
        debug!(environment = %id, engine = %built.engine.id(), "Environment resolved");

        let mut resolved = self.resolved.lock();
        Ok(resolved.entry(id.to_string()).or_insert(built).clone())
    }

    /// Shut down the engine of every resolved environment.
    pub async fn shutdown(&self) {
        let environments: Vec<Arc<Environment>> =
            self.resolved.lock().values().cloned().collect();
        for env in environments {
            if let Err(e) = env.engine.shutdown().await {
                warn!(environment = %env.id, error = %e, "Engine shutdown failed");
            }
        }
    }
}
