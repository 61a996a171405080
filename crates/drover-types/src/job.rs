//! Workflow job tree and its flattened arena form.
//!
//! Engines report jobs as a recursive tree (scatters and sub-workflows nest
//! their own jobs). The store persists one row per job with the parent
//! identifier in its own column, so the tree is converted to an arena of
//! [`JobRecord`]s by a pure pre-order traversal and rebuilt from it on read.

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::{Error, Result, TaskStatus, Timestamp};

/// A job node as reported by an engine, with its nested children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowJob {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    pub name: String,
    pub status: TaskStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shard: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempt: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish: Option<Timestamp>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jobs: Vec<WorkflowJob>,
}

impl WorkflowJob {
    pub fn new(id: impl Into<String>, name: impl Into<String>, status: TaskStatus) -> Self {
        Self {
            id: id.into(),
            parent: None,
            name: name.into(),
            status,
            shard: None,
            attempt: None,
            start: None,
            finish: None,
            jobs: Vec::new(),
        }
    }

    /// Append a child job, setting its parent linkage to this node.
    pub fn with_child(mut self, mut child: WorkflowJob) -> Self {
        child.parent = Some(self.id.clone());
        self.jobs.push(child);
        self
    }

    /// Number of nodes in this subtree, including `self`.
    pub fn node_count(&self) -> usize {
        1 + self.jobs.iter().map(WorkflowJob::node_count).sum::<usize>()
    }
}

/// One flattened job row: a tree node without its children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub parent: Option<String>,
    pub name: String,
    pub status: TaskStatus,
    pub shard: Option<u32>,
    pub attempt: Option<u32>,
    pub start: Option<Timestamp>,
    pub finish: Option<Timestamp>,
}

impl JobRecord {
    fn from_node(node: &WorkflowJob, parent: Option<&str>) -> Self {
        Self {
            id: node.id.clone(),
            parent: parent.map(str::to_string).or_else(|| node.parent.clone()),
            name: node.name.clone(),
            status: node.status,
            shard: node.shard,
            attempt: node.attempt,
            start: node.start,
            finish: node.finish,
        }
    }

    fn into_node(self) -> WorkflowJob {
        WorkflowJob {
            id: self.id,
            parent: self.parent,
            name: self.name,
            status: self.status,
            shard: self.shard,
            attempt: self.attempt,
            start: self.start,
            finish: self.finish,
            jobs: Vec::new(),
        }
    }
}

/// Pre-order flatten of a job forest.
///
/// Visits every node exactly once and never mutates the input. A child's
/// parent column is always the identifier of the node it was nested under.
pub fn flatten(jobs: &[WorkflowJob]) -> Vec<JobRecord> {
    let mut out = Vec::with_capacity(jobs.iter().map(WorkflowJob::node_count).sum());
    let mut stack: Vec<(&WorkflowJob, Option<&str>)> =
        jobs.iter().rev().map(|job| (job, None)).collect();

    while let Some((node, parent)) = stack.pop() {
        out.push(JobRecord::from_node(node, parent));
        for child in node.jobs.iter().rev() {
            stack.push((child, Some(node.id.as_str())));
        }
    }
    out
}

/// Flat, identifier-keyed storage for a job forest.
#[derive(Debug, Clone, Default)]
pub struct JobArena {
    records: Vec<JobRecord>,
    index: HashMap<String, usize>,
}

impl JobArena {
    /// Build an arena from a job forest, rejecting duplicate identifiers.
    pub fn from_tree(jobs: &[WorkflowJob]) -> Result<Self> {
        Self::from_records(flatten(jobs))
    }

    /// Build an arena from rows (e.g. read back from the store).
    pub fn from_records(records: Vec<JobRecord>) -> Result<Self> {
        let mut index = HashMap::with_capacity(records.len());
        for (position, record) in records.iter().enumerate() {
            if index.insert(record.id.clone(), position).is_some() {
                return Err(Error::DuplicateJob(record.id.clone()));
            }
        }
        Ok(Self { records, index })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&JobRecord> {
        self.index.get(id).map(|&i| &self.records[i])
    }

    pub fn records(&self) -> &[JobRecord] {
        &self.records
    }

    /// Direct children of `id`, in arena order.
    pub fn children<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a JobRecord> + 'a {
        self.records
            .iter()
            .filter(move |r| r.parent.as_deref() == Some(id))
    }

    /// Rebuild the nested tree.
    ///
    /// Roots are records with no parent or whose parent is not in the arena.
    /// Sibling order follows arena order, so `from_tree(t).into_tree() == t`.
    pub fn into_tree(self) -> Vec<WorkflowJob> {
        let known: HashSet<String> = self.index.into_keys().collect();
        let mut children: HashMap<Option<String>, Vec<JobRecord>> = HashMap::new();
        for record in self.records {
            let key = record.parent.clone().filter(|p| known.contains(p));
            children.entry(key).or_default().push(record);
        }

        fn build(
            record: JobRecord,
            children: &mut HashMap<Option<String>, Vec<JobRecord>>,
        ) -> WorkflowJob {
            let kids = children.remove(&Some(record.id.clone())).unwrap_or_default();
            let mut node = record.into_node();
            node.jobs = kids.into_iter().map(|k| build(k, children)).collect();
            node
        }

        let roots = children.remove(&None).unwrap_or_default();
        roots.into_iter().map(|r| build(r, &mut children)).collect()
    }
}
