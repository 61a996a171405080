//! Well-known metadata keys and lifecycle progress markers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::Error;

/// Keys of the per-task metadata key/value store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfoKey {
    Environment,
    EngineId,
    EngineTid,
    Validating,
    Status,
    Name,
    Start,
    Finish,
    ExecutionDir,
    Error,
    AbortRequested,
    LastUpdated,
}

impl InfoKey {
    pub const ALL: [InfoKey; 12] = [
        InfoKey::Environment,
        InfoKey::EngineId,
        InfoKey::EngineTid,
        InfoKey::Validating,
        InfoKey::Status,
        InfoKey::Name,
        InfoKey::Start,
        InfoKey::Finish,
        InfoKey::ExecutionDir,
        InfoKey::Error,
        InfoKey::AbortRequested,
        InfoKey::LastUpdated,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            InfoKey::Environment => "environment",
            InfoKey::EngineId => "engine_id",
            InfoKey::EngineTid => "engine_tid",
            InfoKey::Validating => "validating",
            InfoKey::Status => "status",
            InfoKey::Name => "name",
            InfoKey::Start => "start",
            InfoKey::Finish => "finish",
            InfoKey::ExecutionDir => "execution_dir",
            InfoKey::Error => "error",
            InfoKey::AbortRequested => "abort_requested",
            InfoKey::LastUpdated => "last_updated",
        }
    }
}

impl fmt::Display for InfoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InfoKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        InfoKey::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::UnknownInfoKey(s.to_string()))
    }
}

/// Durable lifecycle checkpoints.
///
/// Presence of a marker means the step finished and must not be redone;
/// absence means it runs (or re-runs) on resume. Declaration order is the
/// order the task manager walks them in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressKey {
    DirectoryScaffolded,
    WorkflowMaterialized,
    Submitted,
    OutputsCopied,
    MetadataSaved,
}

impl ProgressKey {
    pub const ALL: [ProgressKey; 5] = [
        ProgressKey::DirectoryScaffolded,
        ProgressKey::WorkflowMaterialized,
        ProgressKey::Submitted,
        ProgressKey::OutputsCopied,
        ProgressKey::MetadataSaved,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ProgressKey::DirectoryScaffolded => "directory_scaffolded",
            ProgressKey::WorkflowMaterialized => "workflow_materialized",
            ProgressKey::Submitted => "submitted",
            ProgressKey::OutputsCopied => "outputs_copied",
            ProgressKey::MetadataSaved => "metadata_saved",
        }
    }
}

impl fmt::Display for ProgressKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProgressKey {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ProgressKey::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| Error::UnknownProgressKey(s.to_string()))
    }
}
