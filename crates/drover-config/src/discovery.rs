//! Locating and layering `drover.toml` files.
//!
//! Two layers, the later overriding the earlier:
//! 1. `<config dir>/config.toml`, where the config dir is `DROVER_CONFIG_DIR`
//!    or the platform's (`~/.config/drover`)
//! 2. `drover.toml` in the working directory
//!
//! An explicit `--config` path skips both and goes through
//! [`load_config_file`].

use std::path::{Path, PathBuf};

use crate::{BUILTIN_LOCAL_ENVIRONMENT, ConfigError, DroverConfig, Result};

const PROJECT_CONFIG_FILE: &str = "drover.toml";
const USER_CONFIG_FILE: &str = "config.toml";
const APP_NAME: &str = "drover";
const CONFIG_DIR_ENV: &str = "DROVER_CONFIG_DIR";

/// Which layer a config file belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigLayer {
    User,
    Project,
}

/// A file that discovery looked at.
#[derive(Debug, Clone)]
pub struct ConfigSource {
    pub layer: ConfigLayer,
    pub path: PathBuf,
    /// False when the file is absent or failed to parse.
    pub loaded: bool,
}

/// Merged configuration plus how it was assembled.
#[derive(Debug, Clone)]
pub struct LoadedConfig {
    pub config: DroverConfig,
    /// Lowest precedence first.
    pub sources: Vec<ConfigSource>,
    /// Unreadable layers and dangling environment references. Never fatal.
    pub warnings: Vec<String>,
}

impl LoadedConfig {
    pub fn loaded_from(&self) -> Vec<&Path> {
        self.sources
            .iter()
            .filter(|s| s.loaded)
            .map(|s| s.path.as_path())
            .collect()
    }

    /// Merge `path` if it exists and parses; a broken file becomes a warning.
    fn merge_layer(&mut self, layer: ConfigLayer, path: PathBuf) {
        let loaded = path.is_file()
            && match load_config_file(&path) {
                Ok(config) => {
                    self.config.merge(config);
                    true
                }
                Err(e) => {
                    self.warnings
                        .push(format!("Failed to load {}: {e}", path.display()));
                    false
                }
            };
        self.sources.push(ConfigSource {
            layer,
            path,
            loaded,
        });
    }
}

/// Discover and merge both layers, with `project_dir` holding `drover.toml`.
pub fn load_config(project_dir: Option<&Path>) -> Result<LoadedConfig> {
    load_config_with_options(project_dir, None)
}

/// Like [`load_config`], with `config_dir` standing in for the user config
/// directory (tests use this to stay away from the real one).
pub fn load_config_with_options(
    project_dir: Option<&Path>,
    config_dir: Option<&Path>,
) -> Result<LoadedConfig> {
    let mut loaded = LoadedConfig {
        config: DroverConfig::new(),
        sources: Vec::new(),
        warnings: Vec::new(),
    };

    let user_file = config_dir
        .map(|d| d.join(USER_CONFIG_FILE))
        .or_else(xdg_config_path);
    if let Some(path) = user_file {
        loaded.merge_layer(ConfigLayer::User, path);
    }

    let project_file = project_dir
        .unwrap_or(Path::new("."))
        .join(PROJECT_CONFIG_FILE);
    loaded.merge_layer(ConfigLayer::Project, project_file);

    if let Some(id) = loaded.config.default_environment.as_deref()
        && id != BUILTIN_LOCAL_ENVIRONMENT
        && !loaded.config.environments.contains_key(id)
    {
        let warning = format!("default_environment '{id}' is not defined under [environments]");
        loaded.warnings.push(warning);
    }

    Ok(loaded)
}

/// Parse one file, no discovery or merging.
pub fn load_config_file(path: &Path) -> Result<DroverConfig> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
        path: path.display().to_string(),
        source,
    })?;
    DroverConfig::from_toml(&contents)
}

/// `<config dir>/config.toml`.
pub fn xdg_config_path() -> Option<PathBuf> {
    xdg_config_dir().map(|d| d.join(USER_CONFIG_FILE))
}

/// `DROVER_CONFIG_DIR` when set and non-empty, else the platform config
/// directory joined with `drover`. Logs live under `<this>/logs`.
pub fn xdg_config_dir() -> Option<PathBuf> {
    match std::env::var(CONFIG_DIR_ENV) {
        Ok(dir) if !dir.is_empty() => Some(PathBuf::from(dir)),
        _ => dirs::config_dir().map(|d| d.join(APP_NAME)),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
