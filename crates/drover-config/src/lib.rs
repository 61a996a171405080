//! Configuration system for drover.
//!
//! Provides TOML-based configuration with:
//! - The task root under which every task directory lives (`[paths]`)
//! - Poll loop tuning (`[polling]`)
//! - Status-change mail notifications (`[notifications]`)
//! - Named environments binding an engine, a file scheme and a submission
//!   template (`[environments.<id>]`)
//!
//! Config file layering: XDG user config, then project-local `drover.toml`.
//! Configuration values are passed explicitly into constructors; nothing in
//! drover reads a process-wide config.

pub mod discovery;
pub mod error;
pub mod paths;
pub mod types;

pub use discovery::{
    ConfigLayer, ConfigSource, LoadedConfig, load_config, load_config_file,
    load_config_with_options, xdg_config_dir, xdg_config_path,
};
pub use error::{ConfigError, Result};
pub use paths::PathConfig;
pub use types::*;
