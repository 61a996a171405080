//! The engine capability interface.
//!
//! Every backend implements the same six operations. Callers never branch on
//! the concrete backend; the only place a backend is chosen is environment
//! resolution.

use std::collections::BTreeMap;

use async_trait::async_trait;

use drover_types::{OutputValue, TaskMetadata, TaskStatus, WorkflowPackage};

use crate::error::{EngineError, Result};

/// Backend family, for logs and the `engine_id` metadata key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineKind {
    /// Long-lived server polled over HTTP.
    Server,
    /// One local subprocess per run.
    LocalProcess,
}

impl EngineKind {
    pub fn as_str(self) -> &'static str {
        match self {
            EngineKind::Server => "server",
            EngineKind::LocalProcess => "local",
        }
    }
}

impl std::fmt::Display for EngineKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An execution backend.
///
/// `poll` and `fetch_metadata` may be called at any interval, from a process
/// other than the one that called `start`.
#[async_trait]
pub trait Engine: Send + Sync {
    /// Identifier of the engine program (e.g. `cromwell`, `cwltool`).
    fn id(&self) -> &str;

    fn kind(&self) -> EngineKind;

    /// Most input documents a single `start` accepts. `None` means unbounded.
    fn max_input_documents(&self) -> Option<usize> {
        None
    }

    /// Submit a prepared package and return the engine's run id.
    async fn start(&self, package: &WorkflowPackage) -> Result<String>;

    /// One non-blocking status check.
    async fn poll(&self, run_id: &str) -> Result<TaskStatus>;

    /// Status plus the per-job tree. Partial while the engine warms up.
    async fn fetch_metadata(&self, run_id: &str) -> Result<TaskMetadata>;

    /// Output name to engine-native location(s). Fails with
    /// [`EngineError::NotReady`] unless the run completed successfully.
    async fn fetch_outputs(&self, run_id: &str) -> Result<BTreeMap<String, OutputValue>>;

    /// Best-effort cancellation; `poll` reflects `Aborted` once confirmed.
    async fn terminate(&self, run_id: &str) -> Result<()>;

    /// Release engine-managed resources. Safe to call more than once.
    async fn shutdown(&self) -> Result<()>;

    /// Version string of the running engine, when it reports one.
    async fn version(&self) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Reject a package with more input documents than `engine` accepts.
pub fn check_input_shape(engine: &dyn Engine, package: &WorkflowPackage) -> Result<()> {
    let got = package.input_documents();
    match engine.max_input_documents() {
        Some(max) if got > max => Err(EngineError::UnsupportedInputShape {
            backend: engine.kind().as_str(),
            max,
            got,
        }),
        _ => Ok(()),
    }
}
