//! Append-only history of component versions seen by a task.

use rusqlite::{Connection, OptionalExtension, params};
use serde::{Deserialize, Serialize};

use drover_types::Timestamp;

use crate::error::Result;
use crate::providers::{format_dt, parse_dt};
use crate::schema::{ProviderSchema, no_upgrade};

pub(crate) const SCHEMA: ProviderSchema = ProviderSchema {
    name: "versions",
    version: 1,
    create,
    upgrade: no_upgrade,
};

fn create(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS versions (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            tid TEXT NOT NULL,
            component TEXT NOT NULL,
            version TEXT NOT NULL,
            recorded_at TEXT NOT NULL
        );",
    )?;
    Ok(())
}

/// One recorded version of a component (drover itself, an engine, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VersionEntry {
    pub component: String,
    pub version: String,
    pub recorded_at: Option<Timestamp>,
}

pub struct VersionsDb<'c> {
    conn: &'c Connection,
    tid: &'c str,
}

impl<'c> VersionsDb<'c> {
    pub(crate) fn new(conn: &'c Connection, tid: &'c str) -> Self {
        Self { conn, tid }
    }

    /// Append `version` unless it is already the latest for `component`.
    pub fn record(&self, component: &str, version: &str) -> Result<bool> {
        if self.latest(component)?.as_deref() == Some(version) {
            return Ok(false);
        }
        self.conn.execute(
            "INSERT INTO versions (tid, component, version, recorded_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![self.tid, component, version, format_dt(&drover_types::now())],
        )?;
        Ok(true)
    }

    pub fn latest(&self, component: &str) -> Result<Option<String>> {
        let version = self
            .conn
            .query_row(
                "SELECT version FROM versions WHERE tid = ?1 AND component = ?2
                 ORDER BY id DESC LIMIT 1",
                params![self.tid, component],
                |row| row.get(0),
            )
            .optional()?;
        Ok(version)
    }

    pub fn history(&self) -> Result<Vec<VersionEntry>> {
        let mut stmt = self.conn.prepare(
            "SELECT component, version, recorded_at FROM versions WHERE tid = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map([self.tid], |row| {
            Ok(VersionEntry {
                component: row.get(0)?,
                version: row.get(1)?,
                recorded_at: parse_dt(&row.get::<_, String>(2)?),
            })
        })?;
        Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
    }
}
