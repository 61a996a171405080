//! Execution side of drover.
//!
//! - [`Engine`]: the capability interface over execution backends, with a
//!   server-mode ([`ServerEngine`]) and a single-shot local-process
//!   ([`LocalProcessEngine`]) implementation.
//! - [`FileScheme`]: transports that copy outputs into a task directory,
//!   plus the shape-aware [`copy_output`] policy.
//! - [`SubmissionTemplate`]: how a detached resume is launched.
//! - [`Environment`] / [`EnvironmentRegistry`]: named bindings of the three,
//!   built from configuration.

pub mod engine;
pub mod engines;
pub mod environment;
pub mod error;
pub mod filescheme;
pub mod policy;
pub mod template;

pub use engine::{Engine, EngineKind, check_input_shape};
pub use engines::{LocalProcessEngine, RunState, ServerEngine};
pub use environment::{Environment, EnvironmentRegistry};
pub use error::{EngineError, FileSchemeError, Result};
pub use filescheme::{CopyOptions, FileScheme, LocalFileScheme, SshFileScheme};
pub use policy::{CopiedOutput, copy_output, extension_of};
pub use template::{LocalTemplate, SlurmTemplate, SubmissionTemplate};
