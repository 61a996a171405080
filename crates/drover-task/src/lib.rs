//! Task lifecycle for drover.
//!
//! A [`TaskManager`] owns one task end to end: directory scaffold,
//! translation hand-off, submission, the poll loop, output retrieval and the
//! final metadata snapshot. Every step is guarded by a progress marker in
//! the task store, so a manager rebuilt after a restart carries on where the
//! last one stopped.
//!
//! [`Orchestrator`] exposes the operations the CLI needs on top of that.

pub mod error;
pub mod layout;
pub mod manager;
pub mod notifier;
pub mod orchestrator;
pub mod translator;

pub use error::{Result, TaskError};
pub use layout::{SUBDIRECTORIES, TaskLayout, discover_tasks};
pub use manager::{ManagerContext, TaskManager, project};
pub use notifier::{LogNotifier, MailNotifier, Notifier, TaskSummary};
pub use orchestrator::Orchestrator;
pub use translator::{CopyTranslator, INPUTS_FILE, Translator};
