//! Workflow inputs, keyed by tag.
//!
//! Inputs are write-once: `insert`/`insert_many` refuse an existing tag.
//! `replace` is the explicit re-insert.

use std::collections::BTreeMap;

use rusqlite::{Connection, OptionalExtension, params};
use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::schema::{ProviderSchema, no_upgrade};

pub(crate) const SCHEMA: ProviderSchema = ProviderSchema {
    name: "inputs",
    version: 1,
    create,
    upgrade: no_upgrade,
};

fn create(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS inputs (
            tid TEXT NOT NULL,
            tag TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (tid, tag)
        );",
    )?;
    Ok(())
}

pub struct InputsDb<'c> {
    conn: &'c Connection,
    tid: &'c str,
}

impl<'c> InputsDb<'c> {
    pub(crate) fn new(conn: &'c Connection, tid: &'c str) -> Self {
        Self { conn, tid }
    }

    pub fn insert(&self, tag: &str, value: &Value) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.conn
            .execute(
                "INSERT INTO inputs (tid, tag, value) VALUES (?1, ?2, ?3)",
                params![self.tid, tag, json],
            )
            .map_err(|e| {
                if StoreError::is_constraint(&e) {
                    StoreError::AlreadyExists {
                        entity: "input",
                        key: tag.to_string(),
                    }
                } else {
                    e.into()
                }
            })?;
        Ok(())
    }

    pub fn insert_many<'a>(
        &self,
        inputs: impl IntoIterator<Item = (&'a String, &'a Value)>,
    ) -> Result<usize> {
        let mut count = 0;
        for (tag, value) in inputs {
            self.insert(tag, value)?;
            count += 1;
        }
        Ok(count)
    }

    /// Overwrite (or create) the value for `tag`.
    pub fn replace(&self, tag: &str, value: &Value) -> Result<()> {
        let json = serde_json::to_string(value)?;
        self.conn.execute(
            "INSERT INTO inputs (tid, tag, value) VALUES (?1, ?2, ?3)
             ON CONFLICT(tid, tag) DO UPDATE SET value = excluded.value",
            params![self.tid, tag, json],
        )?;
        Ok(())
    }

    pub fn get(&self, tag: &str) -> Result<Option<Value>> {
        let json: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM inputs WHERE tid = ?1 AND tag = ?2",
                params![self.tid, tag],
                |row| row.get(0),
            )
            .optional()?;
        json.map(|s| serde_json::from_str(&s).map_err(Into::into))
            .transpose()
    }

    pub fn get_all(&self) -> Result<BTreeMap<String, Value>> {
        let mut stmt = self
            .conn
            .prepare("SELECT tag, value FROM inputs WHERE tid = ?1 ORDER BY tag")?;
        let rows = stmt.query_map([self.tid], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut inputs = BTreeMap::new();
        for row in rows {
            let (tag, json) = row?;
            inputs.insert(tag, serde_json::from_str(&json)?);
        }
        Ok(inputs)
    }
}
