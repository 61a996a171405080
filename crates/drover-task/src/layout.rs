//! On-disk layout of a task directory.
//!
//! ```text
//! <task_root>/<tid>/
//! ├── task.db              # every store provider
//! ├── workflow/            # translator output + materialized.json
//! ├── metadata/            # workflow.json, metadata.json
//! ├── validation/          # requirements.json when validating
//! ├── outputs/             # copied engine outputs
//! └── logs/                # detached resume logs
//! ```
//!
//! Every path is a pure function of the root and the task id.

use std::path::{Path, PathBuf};

use drover_store::STORE_FILE_NAME;

/// Subdirectories created for every task.
pub const SUBDIRECTORIES: [&str; 5] = ["workflow", "metadata", "validation", "outputs", "logs"];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskLayout {
    root: PathBuf,
    tid: String,
}

impl TaskLayout {
    pub fn new(root: impl Into<PathBuf>, tid: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            tid: tid.into(),
        }
    }

    pub fn tid(&self) -> &str {
        &self.tid
    }

    pub fn dir(&self) -> PathBuf {
        self.root.join(&self.tid)
    }

    pub fn store_path(&self) -> PathBuf {
        self.dir().join(STORE_FILE_NAME)
    }

    pub fn workflow_dir(&self) -> PathBuf {
        self.dir().join("workflow")
    }

    pub fn metadata_dir(&self) -> PathBuf {
        self.dir().join("metadata")
    }

    pub fn validation_dir(&self) -> PathBuf {
        self.dir().join("validation")
    }

    pub fn outputs_dir(&self) -> PathBuf {
        self.dir().join("outputs")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.dir().join("logs")
    }

    /// Translator result, written before `WorkflowMaterialized` is marked.
    pub fn materialized_path(&self) -> PathBuf {
        self.workflow_dir().join("materialized.json")
    }

    /// The submitted workflow graph.
    pub fn workflow_snapshot_path(&self) -> PathBuf {
        self.metadata_dir().join("workflow.json")
    }

    /// Final metadata, written once the task is terminal.
    pub fn final_metadata_path(&self) -> PathBuf {
        self.metadata_dir().join("metadata.json")
    }

    pub fn validation_requirements_path(&self) -> PathBuf {
        self.validation_dir().join("requirements.json")
    }

    /// Whether a task store exists for this id.
    pub fn exists(&self) -> bool {
        self.store_path().is_file()
    }

    /// Create the task directory and its subdirectories. Safe to repeat.
    pub fn scaffold(&self) -> std::io::Result<()> {
        for sub in SUBDIRECTORIES {
            std::fs::create_dir_all(self.dir().join(sub))?;
        }
        Ok(())
    }
}

/// Ids of every task directory under `root` that holds a store, sorted.
pub fn discover_tasks(root: &Path) -> std::io::Result<Vec<String>> {
    let entries = match std::fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut tids = Vec::new();
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        if entry.path().join(STORE_FILE_NAME).is_file()
            && let Some(name) = entry.file_name().to_str()
        {
            tids.push(name.to_string());
        }
    }
    tids.sort();
    Ok(tids)
}
