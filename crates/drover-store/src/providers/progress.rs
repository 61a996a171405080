//! Progress markers: which resume steps have finished.

use rusqlite::{Connection, OptionalExtension, params};
use tracing::warn;

use drover_types::{ProgressKey, Timestamp};

use crate::error::Result;
use crate::providers::{format_dt, parse_dt};
use crate::schema::{ProviderSchema, no_upgrade};

pub(crate) const SCHEMA: ProviderSchema = ProviderSchema {
    name: "progress",
    version: 1,
    create,
    upgrade: no_upgrade,
};

fn create(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS progress (
            tid TEXT NOT NULL,
            key TEXT NOT NULL,
            completed_at TEXT NOT NULL,
            PRIMARY KEY (tid, key)
        );",
    )?;
    Ok(())
}

pub struct ProgressDb<'c> {
    conn: &'c Connection,
    tid: &'c str,
}

impl<'c> ProgressDb<'c> {
    pub(crate) fn new(conn: &'c Connection, tid: &'c str) -> Self {
        Self { conn, tid }
    }

    /// Mark a step as done. Marking twice keeps the first completion time.
    pub fn mark(&self, key: ProgressKey) -> Result<()> {
        self.conn.execute(
            "INSERT OR IGNORE INTO progress (tid, key, completed_at) VALUES (?1, ?2, ?3)",
            params![self.tid, key.as_str(), format_dt(&drover_types::now())],
        )?;
        Ok(())
    }

    pub fn has(&self, key: ProgressKey) -> Result<bool> {
        let found: Option<i32> = self
            .conn
            .query_row(
                "SELECT 1 FROM progress WHERE tid = ?1 AND key = ?2",
                params![self.tid, key.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    /// Remove a marker so the step re-runs on the next resume.
    pub fn clear(&self, key: ProgressKey) -> Result<bool> {
        let removed = self.conn.execute(
            "DELETE FROM progress WHERE tid = ?1 AND key = ?2",
            params![self.tid, key.as_str()],
        )?;
        Ok(removed > 0)
    }

    /// Completed steps with their completion time, in lifecycle order.
    pub fn get_all(&self) -> Result<Vec<(ProgressKey, Option<Timestamp>)>> {
        let mut stmt = self
            .conn
            .prepare("SELECT key, completed_at FROM progress WHERE tid = ?1")?;
        let rows = stmt.query_map([self.tid], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut done = Vec::new();
        for row in rows {
            let (key, at) = row?;
            match key.parse::<ProgressKey>() {
                Ok(key) => done.push((key, parse_dt(&at))),
                Err(e) => warn!(tid = %self.tid, error = %e, "Ignoring unknown progress marker"),
            }
        }
        done.sort_by_key(|(key, _)| *key);
        Ok(done)
    }
}
