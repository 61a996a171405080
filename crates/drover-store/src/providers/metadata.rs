//! Task-level key/value metadata.
//!
//! Plain keys are last-write-wins. Two keys are guarded: the status never
//! leaves a terminal value once stored, and the engine run id is set once.

use std::collections::BTreeMap;

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};
use tracing::warn;

use drover_types::{InfoKey, TaskMetadata, TaskStatus, Timestamp};

use crate::error::{Result, StoreError};
use crate::providers::{format_dt, parse_dt};
use crate::schema::{ProviderSchema, no_upgrade};

pub(crate) const SCHEMA: ProviderSchema = ProviderSchema {
    name: "metadata",
    version: 1,
    create,
    upgrade: no_upgrade,
};

fn create(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS metadata (
            tid TEXT NOT NULL,
            key TEXT NOT NULL,
            value TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (tid, key)
        );",
    )?;
    Ok(())
}

/// Typed view of everything in the metadata table for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskRecord {
    pub tid: String,
    pub environment: Option<String>,
    pub engine_id: Option<String>,
    pub engine_tid: Option<String>,
    pub name: Option<String>,
    pub status: TaskStatus,
    pub validating: bool,
    pub abort_requested: bool,
    pub start: Option<Timestamp>,
    pub finish: Option<Timestamp>,
    pub execution_dir: Option<String>,
    pub error: Option<String>,
    pub created_at: Option<Timestamp>,
    pub last_updated: Option<Timestamp>,
}

impl TaskRecord {
    /// Project into a snapshot without jobs or outputs.
    pub fn to_metadata(&self) -> TaskMetadata {
        TaskMetadata {
            tid: Some(self.tid.clone()),
            engine_tid: self.engine_tid.clone(),
            name: self.name.clone(),
            environment: self.environment.clone(),
            start: self.start,
            finish: self.finish,
            execution_dir: self.execution_dir.clone(),
            error: self.error.clone(),
            last_updated: self.last_updated,
            ..TaskMetadata::with_status(self.status)
        }
    }
}

pub struct MetadataDb<'c> {
    conn: &'c Connection,
    tid: &'c str,
}

impl<'c> MetadataDb<'c> {
    pub(crate) fn new(conn: &'c Connection, tid: &'c str) -> Self {
        Self { conn, tid }
    }

    pub fn set(&self, key: InfoKey, value: &str) -> Result<()> {
        let now = format_dt(&drover_types::now());
        self.conn.execute(
            "INSERT INTO metadata (tid, key, value, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(tid, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at",
            params![self.tid, key.as_str(), value, now],
        )?;
        Ok(())
    }

    pub fn set_bool(&self, key: InfoKey, value: bool) -> Result<()> {
        self.set(key, if value { "true" } else { "false" })
    }

    pub fn set_timestamp(&self, key: InfoKey, value: &Timestamp) -> Result<()> {
        self.set(key, &format_dt(value))
    }

    /// Store `status` unless a terminal status is already stored.
    ///
    /// Returns whether the write was accepted. The guard lives in the
    /// statement itself, so concurrent writers cannot race past it.
    pub fn set_status(&self, status: TaskStatus) -> Result<bool> {
        let now = format_dt(&drover_types::now());
        let changed = self.conn.execute(
            "INSERT INTO metadata (tid, key, value, created_at, updated_at)
             VALUES (?1, 'status', ?2, ?3, ?3)
             ON CONFLICT(tid, key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
             WHERE metadata.value NOT IN ('completed', 'failed', 'aborted')",
            params![self.tid, status.as_str(), now],
        )?;
        Ok(changed > 0)
    }

    /// Store the engine's run id. Setting the same id again is a no-op;
    /// a different id is a conflict.
    pub fn set_engine_tid(&self, engine_tid: &str) -> Result<bool> {
        let now = format_dt(&drover_types::now());
        let inserted = self.conn.execute(
            "INSERT INTO metadata (tid, key, value, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?4)
             ON CONFLICT(tid, key) DO NOTHING",
            params![self.tid, InfoKey::EngineTid.as_str(), engine_tid, now],
        )?;
        if inserted > 0 {
            return Ok(true);
        }

        match self.get(InfoKey::EngineTid)? {
            Some(existing) if existing == engine_tid => Ok(false),
            Some(existing) => Err(StoreError::Conflict {
                key: InfoKey::EngineTid.to_string(),
                existing,
                attempted: engine_tid.to_string(),
            }),
            None => Err(StoreError::Migration(
                "engine_tid vanished during set-once write".into(),
            )),
        }
    }

    pub fn get(&self, key: InfoKey) -> Result<Option<String>> {
        let value = self
            .conn
            .query_row(
                "SELECT value FROM metadata WHERE tid = ?1 AND key = ?2",
                params![self.tid, key.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value)
    }

    pub fn get_bool(&self, key: InfoKey) -> Result<bool> {
        Ok(self.get(key)?.as_deref() == Some("true"))
    }

    pub fn status(&self) -> Result<Option<TaskStatus>> {
        self.get(InfoKey::Status)?
            .map(|s| s.parse::<TaskStatus>().map_err(Into::into))
            .transpose()
    }

    /// Every known key with its value. Unknown keys are skipped.
    pub fn get_all(&self) -> Result<BTreeMap<InfoKey, String>> {
        Ok(self
            .rows()?
            .into_iter()
            .map(|(key, value, _, _)| (key, value))
            .collect())
    }

    fn rows(&self) -> Result<Vec<(InfoKey, String, String, String)>> {
        let mut stmt = self.conn.prepare(
            "SELECT key, value, created_at, updated_at FROM metadata WHERE tid = ?1",
        )?;
        let rows = stmt.query_map([self.tid], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (key, value, created, updated) = row?;
            match key.parse::<InfoKey>() {
                Ok(key) => out.push((key, value, created, updated)),
                Err(e) => warn!(tid = %self.tid, error = %e, "Ignoring unknown metadata key"),
            }
        }
        Ok(out)
    }

    /// Assemble the typed record. `None` when nothing was ever written.
    pub fn task(&self) -> Result<Option<TaskRecord>> {
        let rows = self.rows()?;
        if rows.is_empty() {
            return Ok(None);
        }

        let mut record = TaskRecord {
            tid: self.tid.to_string(),
            environment: None,
            engine_id: None,
            engine_tid: None,
            name: None,
            status: TaskStatus::Processing,
            validating: false,
            abort_requested: false,
            start: None,
            finish: None,
            execution_dir: None,
            error: None,
            created_at: None,
            last_updated: None,
        };

        for (key, value, created, updated) in rows {
            let created = parse_dt(&created);
            let updated = parse_dt(&updated);
            record.created_at = match (record.created_at, created) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            };
            record.last_updated = match (record.last_updated, updated) {
                (Some(a), Some(b)) => Some(a.max(b)),
                (a, b) => a.or(b),
            };

            match key {
                InfoKey::Environment => record.environment = Some(value),
                InfoKey::EngineId => record.engine_id = Some(value),
                InfoKey::EngineTid => record.engine_tid = Some(value),
                InfoKey::Name => record.name = Some(value),
                InfoKey::Status => record.status = value.parse()?,
                InfoKey::Validating => record.validating = value == "true",
                InfoKey::AbortRequested => record.abort_requested = value == "true",
                InfoKey::Start => record.start = parse_dt(&value),
                InfoKey::Finish => record.finish = parse_dt(&value),
                InfoKey::ExecutionDir => record.execution_dir = Some(value),
                InfoKey::Error => record.error = Some(value),
                InfoKey::LastUpdated => {}
            }
        }
        Ok(Some(record))
    }
}
