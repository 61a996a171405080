//! Per-job rows of the engine's job tree.
//!
//! The tree is flattened before storage; `parent` carries the nesting and
//! [`JobsDb::get_tree`] rebuilds it.

use rusqlite::{Connection, params};

use drover_types::{JobArena, JobRecord, TaskStatus, WorkflowJob, flatten};

use crate::error::{Result, StoreError};
use crate::providers::{format_dt, parse_dt};
use crate::schema::ProviderSchema;

pub(crate) const SCHEMA: ProviderSchema = ProviderSchema {
    name: "jobs",
    version: 2,
    create,
    upgrade,
};

fn create(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS jobs (
            tid TEXT NOT NULL,
            jid TEXT NOT NULL,
            parent TEXT,
            name TEXT NOT NULL,
            status TEXT NOT NULL,
            shard INTEGER,
            attempt INTEGER,
            start TEXT,
            finish TEXT,
            PRIMARY KEY (tid, jid)
        );
        CREATE INDEX IF NOT EXISTS idx_jobs_parent ON jobs(tid, parent);",
    )?;
    Ok(())
}

/// v1 -> v2: retry attempt per job.
fn upgrade(conn: &Connection, from: i32) -> Result<()> {
    if from < 2 {
        conn.execute_batch(
            "ALTER TABLE jobs ADD COLUMN attempt INTEGER;
             CREATE INDEX IF NOT EXISTS idx_jobs_parent ON jobs(tid, parent);",
        )?;
    }
    Ok(())
}

const INSERT_JOB: &str =
    "INSERT INTO jobs (tid, jid, parent, name, status, shard, attempt, start, finish)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)";

const UPSERT_JOB: &str =
    "INSERT INTO jobs (tid, jid, parent, name, status, shard, attempt, start, finish)
     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
     ON CONFLICT(tid, jid) DO UPDATE SET
        parent = excluded.parent,
        name = excluded.name,
        status = excluded.status,
        shard = excluded.shard,
        attempt = excluded.attempt,
        start = COALESCE(excluded.start, jobs.start),
        finish = COALESCE(excluded.finish, jobs.finish)";

pub struct JobsDb<'c> {
    conn: &'c Connection,
    tid: &'c str,
}

impl<'c> JobsDb<'c> {
    pub(crate) fn new(conn: &'c Connection, tid: &'c str) -> Self {
        Self { conn, tid }
    }

    /// Insert new job rows; fails if any job id is already stored.
    pub fn insert_many(&self, jobs: &[WorkflowJob]) -> Result<usize> {
        let records = flatten(jobs);
        for record in &records {
            self.execute_row(INSERT_JOB, record).map_err(|e| {
                if StoreError::is_constraint(&e) {
                    StoreError::AlreadyExists {
                        entity: "job",
                        key: record.id.clone(),
                    }
                } else {
                    e.into()
                }
            })?;
        }
        Ok(records.len())
    }

    /// Insert or update every job in the tree, keyed by job id.
    pub fn update_or_insert_many(&self, jobs: &[WorkflowJob]) -> Result<usize> {
        let records = flatten(jobs);
        for record in &records {
            self.execute_row(UPSERT_JOB, record)?;
        }
        Ok(records.len())
    }

    fn execute_row(&self, sql: &str, record: &JobRecord) -> rusqlite::Result<usize> {
        self.conn.execute(
            sql,
            params![
                self.tid,
                record.id,
                record.parent,
                record.name,
                record.status.as_str(),
                record.shard,
                record.attempt,
                record.start.as_ref().map(format_dt),
                record.finish.as_ref().map(format_dt),
            ],
        )
    }

    /// All rows in insertion order.
    pub fn get_all(&self) -> Result<Vec<JobRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT jid, parent, name, status, shard, attempt, start, finish
             FROM jobs WHERE tid = ?1 ORDER BY rowid",
        )?;
        let rows = stmt.query_map([self.tid], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, Option<String>>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<u32>>(4)?,
                row.get::<_, Option<u32>>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, Option<String>>(7)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, parent, name, status, shard, attempt, start, finish) = row?;
            records.push(JobRecord {
                id,
                parent,
                name,
                status: status.parse::<TaskStatus>()?,
                shard,
                attempt,
                start: start.as_deref().and_then(parse_dt),
                finish: finish.as_deref().and_then(parse_dt),
            });
        }
        Ok(records)
    }

    /// Rebuild the nested job tree from the stored rows.
    pub fn get_tree(&self) -> Result<Vec<WorkflowJob>> {
        let arena = JobArena::from_records(self.get_all()?)?;
        Ok(arena.into_tree())
    }
}
