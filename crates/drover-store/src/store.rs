//! The task store handle: connection setup, schema upgrades and the
//! transactional read/write entry points.

use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, TransactionBehavior};
use tracing::{debug, info};

use crate::error::Result;
use crate::providers::TaskDb;
use crate::schema;

/// File name of the store inside a task directory.
pub const STORE_FILE_NAME: &str = "task.db";

// ─────────────────────────────────────────────────────────────────────────────
// Options
// ─────────────────────────────────────────────────────────────────────────────

/// SQLite journal mode for the store file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum JournalMode {
    /// Write-ahead log. Readers never block the writer.
    #[default]
    Wal,
    /// Rollback journal. Needed on network filesystems without shared memory
    /// support, where WAL is unsafe.
    Delete,
}

impl JournalMode {
    fn pragma(self) -> &'static str {
        match self {
            JournalMode::Wal => "WAL",
            JournalMode::Delete => "DELETE",
        }
    }
}

/// Options for opening a [`TaskStore`].
#[derive(Debug, Clone)]
pub struct StoreOptions {
    pub journal_mode: JournalMode,
    /// How long SQLite waits on a locked file before reporting busy.
    pub busy_timeout: Duration,
}

impl Default for StoreOptions {
    fn default() -> Self {
        Self {
            journal_mode: JournalMode::Wal,
            busy_timeout: Duration::from_millis(250),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Task Store
// ─────────────────────────────────────────────────────────────────────────────

/// Persistent state of a single task.
///
/// Thread-safe via an internal `Mutex<Connection>`. Every operation is keyed
/// by the task id the store was opened for.
pub struct TaskStore {
    conn: Mutex<Connection>,
    tid: String,
    path: Option<PathBuf>,
}

impl std::fmt::Debug for TaskStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskStore")
            .field("tid", &self.tid)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl TaskStore {
    /// Open (or create) the store at `path` and apply pending schema upgrades.
    ///
    /// Upgrades run before the handle is returned, so no caller ever observes
    /// a half-upgraded schema.
    pub fn open(
        path: impl AsRef<Path>,
        tid: impl Into<String>,
        options: StoreOptions,
    ) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_FULL_MUTEX,
        )?;
        conn.busy_timeout(options.busy_timeout)?;
        conn.execute_batch(&format!(
            "PRAGMA journal_mode={}; PRAGMA synchronous=NORMAL;",
            options.journal_mode.pragma()
        ))?;

        let store = Self {
            conn: Mutex::new(conn),
            tid: tid.into(),
            path: Some(path.to_path_buf()),
        };
        store.initialize()?;

        info!(tid = %store.tid, path = %path.display(), "Task store opened");
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory(tid: impl Into<String>) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
            tid: tid.into(),
            path: None,
        };
        store.initialize()?;
        Ok(store)
    }

    fn initialize(&self) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        schema::upgrade_all(&tx)?;
        tx.commit()?;
        Ok(())
    }

    /// The task this store belongs to.
    pub fn tid(&self) -> &str {
        &self.tid
    }

    /// Backing file, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Schema version recorded for a provider, if it has been created.
    pub fn schema_version(&self, provider: &str) -> Result<Option<i32>> {
        let conn = self.conn.lock();
        schema::recorded_version(&conn, provider)
    }

    // ── Units of work ───────────────────────────────────────────────

    /// Run `f` as one write unit.
    ///
    /// Either every write `f` performs lands, or (when `f` or the commit
    /// fails) none of them do.
    pub fn write<T>(&self, f: impl FnOnce(&TaskDb<'_>) -> Result<T>) -> Result<T> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&TaskDb::new(&tx, &self.tid))?;
        tx.commit()?;
        Ok(value)
    }

    /// Run `f` against the store for reading.
    ///
    /// Returns `Ok(None)` when the file is momentarily locked by another
    /// writer or read-only; callers retry on their next poll. Any other
    /// failure is returned as an error.
    pub fn read<T>(&self, f: impl FnOnce(&TaskDb<'_>) -> Result<T>) -> Result<Option<T>> {
        let conn = self.conn.lock();
        match f(&TaskDb::new(&conn, &self.tid)) {
            Ok(value) => Ok(Some(value)),
            Err(e) if e.is_transient() => {
                debug!(tid = %self.tid, error = %e, "Store busy, nothing read");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    /// Like [`read`](Self::read), but treats "nothing available" as an error.
    ///
    /// For one-shot callers (CLI projections) that have no next poll to wait for.
    pub fn read_now<T>(&self, f: impl FnOnce(&TaskDb<'_>) -> Result<T>) -> Result<T> {
        let conn = self.conn.lock();
        f(&TaskDb::new(&conn, &self.tid))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::StoreError;
    use drover_types::{InfoKey, TaskStatus};
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_parent_dirs() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a").join("b").join(STORE_FILE_NAME);
        let store = TaskStore::open(&path, "t1", StoreOptions::default()).unwrap();
        assert!(path.exists());
        assert_eq!(store.tid(), "t1");
        assert_eq!(store.path(), Some(path.as_path()));
    }

    #[test]
    fn test_write_commits_all_or_nothing() {
        let store = TaskStore::open_in_memory("t1").unwrap();

        let result: Result<()> = store.write(|db| {
            db.metadata().set(InfoKey::Name, "hello")?;
            Err(StoreError::Migration("boom".into()))
        });
        assert!(result.is_err());
        let name = store.read(|db| db.metadata().get(InfoKey::Name)).unwrap();
        assert_eq!(name, Some(None));

        store
            .write(|db| {
                db.metadata().set(InfoKey::Name, "hello")?;
                db.metadata().set_status(TaskStatus::Queued)
            })
            .unwrap();
        let name = store.read(|db| db.metadata().get(InfoKey::Name)).unwrap();
        assert_eq!(name, Some(Some("hello".to_string())));
    }

    #[test]
    fn test_reopen_keeps_data() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(STORE_FILE_NAME);
        {
            let store = TaskStore::open(&path, "t1", StoreOptions::default()).unwrap();
            store
                .write(|db| db.metadata().set(InfoKey::Environment, "local"))
                .unwrap();
        }
        let store = TaskStore::open(&path, "t1", StoreOptions::default()).unwrap();
        let env = store
            .read_now(|db| db.metadata().get(InfoKey::Environment))
            .unwrap();
        assert_eq!(env.as_deref(), Some("local"));
    }
}
