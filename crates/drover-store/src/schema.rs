//! Per-provider schema versioning.
//!
//! Each provider owns its tables and records its own version in
//! `schema_versions`, so providers upgrade independently of each other.

use rusqlite::{Connection, OptionalExtension, params};
use tracing::{debug, info};

use crate::error::{Result, StoreError};
use crate::providers::{inputs, jobs, metadata, outputs, progress, versions};

/// Schema declaration of one provider.
pub(crate) struct ProviderSchema {
    pub name: &'static str,
    pub version: i32,
    /// Create the tables at `version` on an empty store.
    pub create: fn(&Connection) -> Result<()>,
    /// Bring tables from the given older version up to `version`.
    pub upgrade: fn(&Connection, i32) -> Result<()>,
}

const PROVIDERS: [&ProviderSchema; 6] = [
    &inputs::SCHEMA,
    &outputs::SCHEMA,
    &jobs::SCHEMA,
    &progress::SCHEMA,
    &metadata::SCHEMA,
    &versions::SCHEMA,
];

/// Apply pending creations and upgrades for every provider.
///
/// Runs on the caller's transaction; a failure leaves the file untouched.
pub(crate) fn upgrade_all(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_versions (
            provider TEXT PRIMARY KEY,
            version INTEGER NOT NULL
        );",
    )?;

    for provider in PROVIDERS {
        upgrade_one(conn, provider)?;
    }
    Ok(())
}

fn upgrade_one(conn: &Connection, provider: &ProviderSchema) -> Result<()> {
    match recorded_version(conn, provider.name)? {
        None => {
            (provider.create)(conn)?;
            debug!(provider = provider.name, version = provider.version, "Schema created");
        }
        Some(found) if found < provider.version => {
            info!(
                provider = provider.name,
                from = found,
                to = provider.version,
                "Upgrading schema"
            );
            (provider.upgrade)(conn, found)?;
        }
        Some(found) if found > provider.version => {
            return Err(StoreError::SchemaTooNew {
                provider: provider.name,
                found,
                supported: provider.version,
            });
        }
        Some(_) => return Ok(()),
    }

    conn.execute(
        "INSERT INTO schema_versions (provider, version) VALUES (?1, ?2)
         ON CONFLICT(provider) DO UPDATE SET version = excluded.version",
        params![provider.name, provider.version],
    )?;
    Ok(())
}

pub(crate) fn recorded_version(conn: &Connection, provider: &str) -> Result<Option<i32>> {
    let version = conn
        .query_row(
            "SELECT version FROM schema_versions WHERE provider = ?1",
            [provider],
            |row| row.get(0),
        )
        .optional()?;
    Ok(version)
}

/// Upgrade hook for providers that have only ever had one version.
pub(crate) fn no_upgrade(_conn: &Connection, from: i32) -> Result<()> {
    Err(StoreError::Migration(format!(
        "no upgrade path from version {from}"
    )))
}
