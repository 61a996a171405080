//! Shared types for the drover workflow orchestrator.
//!
//! Everything here is plain data: task status, the recursive job tree and
//! its flattened arena form, engine outputs, well-known metadata and
//! progress keys, and the workflow package handed to engines.

pub mod error;
pub mod job;
pub mod keys;
pub mod metadata;
pub mod output;
pub mod status;
pub mod workflow;

pub use error::{Error, Result};
pub use job::{JobArena, JobRecord, WorkflowJob, flatten};
pub use keys::{InfoKey, ProgressKey};
pub use metadata::TaskMetadata;
pub use output::{OutputRecord, OutputValue};
pub use status::TaskStatus;
pub use workflow::{
    MaterializedWorkflow, ValidationRequirements, WorkflowGraph, WorkflowPackage,
};

/// Timestamp type used throughout drover.
pub type Timestamp = chrono::DateTime<chrono::Utc>;

/// Generate a fresh, globally unique task identifier.
pub fn new_task_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

/// Current UTC timestamp.
pub fn now() -> Timestamp {
    chrono::Utc::now()
}
