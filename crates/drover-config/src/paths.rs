//! Task directory root configuration.
//!
//! # Configuration
//!
//! ```toml
//! [paths]
//! task_root = "/scratch/drover/tasks"
//! ```
//!
//! # Environment Variables
//!
//! - `DROVER_TASK_ROOT` - Override the root under which task directories live

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Environment variable overriding the task root.
pub const TASK_ROOT_ENV: &str = "DROVER_TASK_ROOT";

/// Path management configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    /// Root directory for task directories.
    /// Default: `~/drover/tasks`
    ///
    /// Can be overridden by the `DROVER_TASK_ROOT` environment variable.
    pub task_root: Option<PathBuf>,
}

impl PathConfig {
    /// Get the effective task root, checking the environment variable first.
    ///
    /// Resolution order:
    /// 1. `DROVER_TASK_ROOT` environment variable
    /// 2. Configured `task_root` value
    /// 3. Default: `~/drover/tasks`
    pub fn effective_task_root(&self) -> PathBuf {
        if let Ok(env_path) = std::env::var(TASK_ROOT_ENV)
            && !env_path.is_empty()
        {
            return PathBuf::from(env_path);
        }

        self.task_root.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join("drover")
                .join("tasks")
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_config_defaults() {
        let config = PathConfig::default();
        assert!(config.task_root.is_none());
    }

    #[test]
    fn test_configured_root_used() {
        let config = PathConfig {
            task_root: Some(PathBuf::from("/data/tasks")),
        };
        // The env override is only consulted when set; skip when a developer has it set.
        if std::env::var(TASK_ROOT_ENV).is_err() {
            assert_eq!(config.effective_task_root(), PathBuf::from("/data/tasks"));
        }
    }

    #[test]
    fn test_parse_paths_section() {
        let config: PathConfig = toml::from_str(r#"task_root = "/x/y""#).unwrap();
        assert_eq!(config.task_root, Some(PathBuf::from("/x/y")));
    }
}
