//! Reference engine backends.

mod local;
mod server;

pub use local::{LocalProcessEngine, RunState};
pub use server::{ServerEngine, map_workflow_status};
