//! Configuration types mapping to the TOML schema.
//!
//! Top-level config:
//! ```toml
//! default_environment = "cluster"
//!
//! [paths]                          # task root
//! [polling]                        # poll loop tuning
//! [notifications]                  # status-change mail
//!
//! [environments.cluster.engine]    # engine binding
//! kind = "server"
//! url = "http://localhost:8000"
//!
//! [environments.cluster.filescheme]
//! kind = "ssh"
//! host = "cluster"
//!
//! [environments.cluster.template]
//! kind = "slurm"
//! queues = ["physical"]
//! ```

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::paths::PathConfig;

/// Identifier of the environment that exists even without a config file.
pub const BUILTIN_LOCAL_ENVIRONMENT: &str = "local";

/// Completion line the single-shot CLI engine prints on success.
pub const DEFAULT_COMPLETION_MARKER: &str = "Final process status is success";

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g. project-local
/// overrides) can be loaded and merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DroverConfig {
    /// Environment used when a caller does not name one.
    pub default_environment: Option<String>,

    /// Path management configuration.
    pub paths: Option<PathConfig>,

    /// Poll loop configuration.
    pub polling: Option<PollingConfig>,

    /// Notification configuration.
    pub notifications: Option<NotificationConfig>,

    /// Named environments.
    pub environments: HashMap<String, EnvironmentConfig>,
}

impl DroverConfig {
    /// Create an empty config.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> crate::Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    ///
    /// Sections are replaced wholesale; environments merge by id.
    pub fn merge(&mut self, other: DroverConfig) {
        if other.default_environment.is_some() {
            self.default_environment = other.default_environment;
        }
        if other.paths.is_some() {
            self.paths = other.paths;
        }
        if other.polling.is_some() {
            self.polling = other.polling;
        }
        if other.notifications.is_some() {
            self.notifications = other.notifications;
        }
        for (id, env) in other.environments {
            self.environments.insert(id, env);
        }
    }

    /// Path configuration, defaulted.
    pub fn paths(&self) -> PathConfig {
        self.paths.clone().unwrap_or_default()
    }

    /// Polling configuration, defaulted.
    pub fn polling(&self) -> PollingConfig {
        self.polling.clone().unwrap_or_default()
    }

    /// Notification configuration, defaulted.
    pub fn notifications(&self) -> NotificationConfig {
        self.notifications.clone().unwrap_or_default()
    }

    /// Look up an environment by id, falling back to the built-in `local`.
    pub fn environment(&self, id: &str) -> Option<EnvironmentConfig> {
        match self.environments.get(id) {
            Some(env) => Some(env.clone()),
            None if id == BUILTIN_LOCAL_ENVIRONMENT => Some(EnvironmentConfig::default()),
            None => None,
        }
    }

    /// All known environment ids, including the built-in one, sorted.
    pub fn environment_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.environments.keys().cloned().collect();
        if !self.environments.contains_key(BUILTIN_LOCAL_ENVIRONMENT) {
            ids.push(BUILTIN_LOCAL_ENVIRONMENT.to_string());
        }
        ids.sort();
        ids
    }

    /// The environment id used when a caller does not specify one.
    pub fn default_environment_id(&self) -> &str {
        self.default_environment
            .as_deref()
            .unwrap_or(BUILTIN_LOCAL_ENVIRONMENT)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Polling
// ─────────────────────────────────────────────────────────────────────────────

/// Poll loop tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Seconds to sleep between engine metadata polls.
    /// Default: 5
    pub interval_secs: u64,

    /// Additional polls to wait for the engine to confirm an abort.
    /// Default: 5
    pub abort_grace_polls: u32,

    /// Consecutive failed polls before the loop reports the engine as unreachable.
    /// Default: 12
    pub max_consecutive_failures: u32,

    /// SQLite busy timeout for task stores, in milliseconds.
    /// Default: 250
    pub store_busy_timeout_ms: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            abort_grace_polls: 5,
            max_consecutive_failures: 12,
            store_busy_timeout_ms: 250,
        }
    }
}

impl PollingConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn store_busy_timeout(&self) -> Duration {
        Duration::from_millis(self.store_busy_timeout_ms)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Notifications
// ─────────────────────────────────────────────────────────────────────────────

/// Status-change mail configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Program the rendered mail is piped into (e.g. `sendmail -t`).
    pub mail_program: Option<String>,

    /// Recipients.
    pub email: Vec<String>,

    /// Sender address.
    pub from_email: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            mail_program: None,
            email: Vec::new(),
            from_email: "drover@localhost".to_string(),
        }
    }
}

impl NotificationConfig {
    /// Whether a mail would actually be sent.
    pub fn is_enabled(&self) -> bool {
        self.mail_program.as_deref().is_some_and(|p| !p.trim().is_empty())
            && self.email.iter().any(|e| !e.trim().is_empty())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Environments
// ─────────────────────────────────────────────────────────────────────────────

/// A named binding of an engine, a file scheme and a submission template.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub filescheme: FileSchemeConfig,
    #[serde(default)]
    pub template: TemplateConfig,
}

/// Engine backend selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineConfig {
    /// Long-lived workflow server reached over HTTP.
    Server {
        url: String,
        /// Command that starts the server when it is not already running.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        launch_command: Option<Vec<String>>,
        #[serde(default = "default_startup_timeout_secs")]
        startup_timeout_secs: u64,
    },
    /// Single-shot local CLI run per task.
    Local {
        #[serde(default = "default_local_executable")]
        executable: String,
        #[serde(default)]
        options: Vec<String>,
        /// Directory for run-state files consulted after a restart.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state_dir: Option<PathBuf>,
        #[serde(default = "default_completion_marker")]
        completion_marker: String,
    },
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig::Local {
            executable: default_local_executable(),
            options: Vec::new(),
            state_dir: None,
            completion_marker: default_completion_marker(),
        }
    }
}

impl EngineConfig {
    /// Short backend identifier recorded in task metadata.
    pub fn kind(&self) -> &'static str {
        match self {
            EngineConfig::Server { .. } => "server",
            EngineConfig::Local { .. } => "local",
        }
    }
}

fn default_startup_timeout_secs() -> u64 {
    60
}

fn default_local_executable() -> String {
    "cwltool".to_string()
}

fn default_completion_marker() -> String {
    DEFAULT_COMPLETION_MARKER.to_string()
}

/// How output files are fetched from where the engine ran.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FileSchemeConfig {
    /// Same filesystem; a direct copy.
    #[default]
    Local,
    /// `scp` from an SSH host alias.
    Ssh { host: String },
}

/// How a detached resume command is submitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TemplateConfig {
    /// Spawn the command as a background process on this machine.
    #[default]
    Local,
    /// Wrap the command in an `sbatch --wrap` submission.
    Slurm {
        #[serde(default = "default_queues")]
        queues: Vec<String>,
        /// Shell prefix run before the command (e.g. `module load java`).
        #[serde(default, skip_serializing_if = "Option::is_none")]
        prelude: Option<String>,
        #[serde(default = "default_time_minutes")]
        time_minutes: u32,
    },
}

fn default_queues() -> Vec<String> {
    vec!["physical".to_string()]
}

fn default_time_minutes() -> u32 {
    1440
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config() {
        let config = DroverConfig::from_toml("").unwrap();
        assert!(config.environments.is_empty());
        assert_eq!(config.default_environment_id(), "local");
        assert_eq!(config.polling().interval_secs, 5);
        assert!(!config.notifications().is_enabled());
    }

    #[test]
    fn test_builtin_local_environment() {
        let config = DroverConfig::new();
        let env = config.environment("local").unwrap();
        assert_eq!(env.engine.kind(), "local");
        assert_eq!(env.filescheme, FileSchemeConfig::Local);
        assert!(config.environment("nope").is_none());
        assert_eq!(config.environment_ids(), vec!["local".to_string()]);
    }

    #[test]
    fn test_parse_environments() {
        let toml = r#"
default_environment = "cluster"

[environments.cluster.engine]
kind = "server"
url = "http://localhost:8000"
launch_command = ["java", "-jar", "server.jar", "server"]

[environments.cluster.filescheme]
kind = "ssh"
host = "spartan"

[environments.cluster.template]
kind = "slurm"
prelude = "module load Java"

[environments.laptop.engine]
kind = "local"
options = ["--parallel"]
"#;
        let config = DroverConfig::from_toml(toml).unwrap();
        assert_eq!(config.default_environment_id(), "cluster");

        let cluster = config.environment("cluster").unwrap();
        match &cluster.engine {
            EngineConfig::Server {
                url,
                launch_command,
                startup_timeout_secs,
            } => {
                assert_eq!(url, "http://localhost:8000");
                assert_eq!(launch_command.as_ref().unwrap().len(), 4);
                assert_eq!(*startup_timeout_secs, 60);
            }
            other => panic!("expected server engine, got {other:?}"),
        }
        assert_eq!(
            cluster.filescheme,
            FileSchemeConfig::Ssh {
                host: "spartan".into()
            }
        );
        match &cluster.template {
            TemplateConfig::Slurm {
                queues,
                prelude,
                time_minutes,
            } => {
                assert_eq!(queues, &vec!["physical".to_string()]);
                assert_eq!(prelude.as_deref(), Some("module load Java"));
                assert_eq!(*time_minutes, 1440);
            }
            other => panic!("expected slurm template, got {other:?}"),
        }

        let laptop = config.environment("laptop").unwrap();
        match laptop.engine {
            EngineConfig::Local {
                executable,
                options,
                completion_marker,
                ..
            } => {
                assert_eq!(executable, "cwltool");
                assert_eq!(options, vec!["--parallel".to_string()]);
                assert_eq!(completion_marker, DEFAULT_COMPLETION_MARKER);
            }
            other => panic!("expected local engine, got {other:?}"),
        }
        assert_eq!(laptop.filescheme, FileSchemeConfig::Local);
        assert_eq!(
            config.environment_ids(),
            vec!["cluster".to_string(), "laptop".to_string(), "local".to_string()]
        );
    }

    #[test]
    fn test_merge_overrides_sections_and_environments() {
        let mut base = DroverConfig::from_toml(
            r#"
[polling]
interval_secs = 30

[environments.a.engine]
kind = "local"
"#,
        )
        .unwrap();
        let over = DroverConfig::from_toml(
            r#"
default_environment = "b"

[environments.b.engine]
kind = "server"
url = "http://b"
"#,
        )
        .unwrap();
        base.merge(over);

        assert_eq!(base.polling().interval_secs, 30);
        assert_eq!(base.default_environment_id(), "b");
        assert!(base.environments.contains_key("a"));
        assert!(base.environments.contains_key("b"));
    }

    #[test]
    fn test_notifications_enabled_needs_program_and_recipient() {
        let mut n = NotificationConfig {
            mail_program: Some("sendmail -t".into()),
            ..Default::default()
        };
        assert!(!n.is_enabled());
        n.email = vec!["me@example.org".into()];
        assert!(n.is_enabled());
    }

    #[test]
    fn test_roundtrip_toml() {
        let toml = r#"
[polling]
interval_secs = 2
abort_grace_polls = 3

[notifications]
mail_program = "sendmail -t"
email = ["a@example.org"]

[environments.hpc.engine]
kind = "server"
url = "http://hpc:8000"
"#;
        let config = DroverConfig::from_toml(toml).unwrap();
        let reparsed = DroverConfig::from_toml(&config.to_toml().unwrap()).unwrap();
        assert_eq!(reparsed, config);
        assert_eq!(reparsed.polling().abort_grace_polls, 3);
        assert_eq!(reparsed.polling().max_consecutive_failures, 12);
    }
}
