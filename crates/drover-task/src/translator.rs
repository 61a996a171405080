//! The hand-off to workflow translation.
//!
//! drover does not interpret workflow definitions. A [`Translator`] turns an
//! abstract [`WorkflowGraph`] into engine-native files inside the task's
//! `workflow/` directory; the task manager only stores the returned paths.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::debug;

use drover_types::{MaterializedWorkflow, ValidationRequirements, WorkflowGraph};

use crate::error::{Result, TaskError};

#[async_trait]
pub trait Translator: Send + Sync {
    fn id(&self) -> &str;

    /// Write engine-native files for `graph` into `out_dir`.
    async fn materialize(
        &self,
        graph: &WorkflowGraph,
        out_dir: &Path,
        validation: Option<&ValidationRequirements>,
    ) -> Result<MaterializedWorkflow>;
}

/// Inputs document written next to the workflow.
pub const INPUTS_FILE: &str = "inputs.json";

/// Treats `graph.source` as an already-native workflow.
///
/// The source and its dependencies are copied verbatim; inputs are written
/// as a JSON document. A single `.zip` dependency is handed to the engine as
/// its dependencies bundle, anything else is copied alongside the workflow
/// so relative imports resolve.
#[derive(Debug, Clone, Default)]
pub struct CopyTranslator;

impl CopyTranslator {
    pub fn new() -> Self {
        Self
    }
}

async fn copy_into(source: &Path, out_dir: &Path) -> Result<PathBuf> {
    let name = source.file_name().ok_or_else(|| {
        TaskError::Translation(format!("'{}' has no file name", source.display()))
    })?;
    let dest = out_dir.join(name);
    tokio::fs::copy(source, &dest).await.map_err(|e| {
        TaskError::Translation(format!("cannot copy {}: {e}", source.display()))
    })?;
    Ok(dest)
}

fn is_bundle(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext.eq_ignore_ascii_case("zip"))
}

#[async_trait]
impl Translator for CopyTranslator {
    fn id(&self) -> &str {
        "copy"
    }

    async fn materialize(
        &self,
        graph: &WorkflowGraph,
        out_dir: &Path,
        validation: Option<&ValidationRequirements>,
    ) -> Result<MaterializedWorkflow> {
        tokio::fs::create_dir_all(out_dir).await?;

        let workflow_file = copy_into(&graph.source, out_dir).await?;

        let mut dependencies_file = None;
        match graph.dependencies.as_slice() {
            [bundle] if is_bundle(bundle) => {
                dependencies_file = Some(copy_into(bundle, out_dir).await?);
            }
            deps => {
                for dep in deps {
                    copy_into(dep, out_dir).await?;
                }
            }
        }

        let inputs_file = if graph.inputs.is_empty() {
            None
        } else {
            let path = out_dir.join(INPUTS_FILE);
            tokio::fs::write(&path, serde_json::to_vec_pretty(&graph.inputs)?).await?;
            Some(path)
        };

        if validation.is_some() {
            debug!(workflow = %graph.name, "Copy translator leaves validation to the workflow itself");
        }

        Ok(MaterializedWorkflow {
            workflow_file,
            inputs_file,
            dependencies_file,
        })
    }
}
