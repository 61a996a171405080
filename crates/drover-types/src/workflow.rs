//! Workflow definitions as they move from the caller to an engine.

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// An abstract workflow as handed to drover by a caller.
///
/// drover never interprets `source`; a translator turns it into
/// engine-native files. `inputs` are persisted per tag in the task store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowGraph {
    pub name: String,
    pub source: PathBuf,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<PathBuf>,
    #[serde(default)]
    pub inputs: BTreeMap<String, Value>,
}

impl WorkflowGraph {
    pub fn new(name: impl Into<String>, source: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            source: source.into(),
            dependencies: Vec::new(),
            inputs: BTreeMap::new(),
        }
    }

    pub fn with_input(mut self, tag: impl Into<String>, value: Value) -> Self {
        self.inputs.insert(tag.into(), value);
        self
    }
}

/// Extra checks requested for a run (variant-calling validation).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRequirements {
    pub truth_vcf: String,
    pub reference: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intervals: Option<String>,
    pub fields: Vec<String>,
}

/// Files produced by a translator inside the task's `workflow/` directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaterializedWorkflow {
    pub workflow_file: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs_file: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dependencies_file: Option<PathBuf>,
}

impl MaterializedWorkflow {
    /// The package an engine is started with.
    pub fn package(&self) -> WorkflowPackage {
        WorkflowPackage::Paths {
            workflow: self.workflow_file.clone(),
            inputs: self.inputs_file.iter().cloned().collect(),
            dependencies: self.dependencies_file.clone(),
        }
    }
}

/// A prepared workflow ready for `Engine::start`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkflowPackage {
    /// Already-translated files on disk.
    Paths {
        workflow: PathBuf,
        inputs: Vec<PathBuf>,
        dependencies: Option<PathBuf>,
    },
    /// In-memory source and input documents.
    Inline {
        source: String,
        inputs: Vec<String>,
        /// `(relative file name, contents)` pairs.
        dependencies: Vec<(String, String)>,
    },
}

impl WorkflowPackage {
    /// Number of input documents in the package.
    pub fn input_documents(&self) -> usize {
        match self {
            WorkflowPackage::Paths { inputs, .. } => inputs.len(),
            WorkflowPackage::Inline { inputs, .. } => inputs.len(),
        }
    }
}
