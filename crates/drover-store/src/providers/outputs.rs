//! Engine outputs and the local paths they were copied to.

use std::path::{Path, PathBuf};

use rusqlite::{Connection, params};

use drover_types::{OutputRecord, OutputValue};

use crate::error::Result;
use crate::schema::{ProviderSchema, no_upgrade};

pub(crate) const SCHEMA: ProviderSchema = ProviderSchema {
    name: "outputs",
    version: 1,
    create,
    upgrade: no_upgrade,
};

fn create(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS outputs (
            tid TEXT NOT NULL,
            tag TEXT NOT NULL,
            value TEXT NOT NULL,
            new_path TEXT,
            PRIMARY KEY (tid, tag)
        );",
    )?;
    Ok(())
}

pub struct OutputsDb<'c> {
    conn: &'c Connection,
    tid: &'c str,
}

impl<'c> OutputsDb<'c> {
    pub(crate) fn new(conn: &'c Connection, tid: &'c str) -> Self {
        Self { conn, tid }
    }

    /// Record engine outputs, replacing any earlier fetch of the same tag.
    ///
    /// A re-fetch after an interrupted copy clears the stale copied path.
    pub fn insert_or_replace_many<'a>(
        &self,
        outputs: impl IntoIterator<Item = (&'a String, &'a OutputValue)>,
    ) -> Result<usize> {
        let mut count = 0;
        for (tag, value) in outputs {
            let json = serde_json::to_string(value)?;
            self.conn.execute(
                "INSERT INTO outputs (tid, tag, value, new_path) VALUES (?1, ?2, ?3, NULL)
                 ON CONFLICT(tid, tag) DO UPDATE SET value = excluded.value, new_path = NULL",
                params![self.tid, tag, json],
            )?;
            count += 1;
        }
        Ok(count)
    }

    /// Record where `tag` was copied to. Returns false for an unknown tag.
    pub fn set_copied_path(&self, tag: &str, path: &Path) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE outputs SET new_path = ?3 WHERE tid = ?1 AND tag = ?2",
            params![self.tid, tag, path.to_string_lossy()],
        )?;
        Ok(updated > 0)
    }

    pub fn get_all(&self) -> Result<Vec<OutputRecord>> {
        let mut stmt = self.conn.prepare(
            "SELECT tag, value, new_path FROM outputs WHERE tid = ?1 ORDER BY tag",
        )?;
        let rows = stmt.query_map([self.tid], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
            ))
        })?;

        let mut outputs = Vec::new();
        for row in rows {
            let (name, json, new_path) = row?;
            outputs.push(OutputRecord {
                name,
                value: serde_json::from_str(&json)?,
                copied_path: new_path.map(PathBuf::from),
            });
        }
        Ok(outputs)
    }
}
