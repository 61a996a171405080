//! Store behaviour while another connection holds the file.

use std::time::Duration;

use drover_store::{JournalMode, STORE_FILE_NAME, StoreOptions, TaskStore};
use drover_types::{InfoKey, TaskStatus};
use rusqlite::Connection;
use serde_json::json;
use tempfile::TempDir;

fn rollback_journal() -> StoreOptions {
    StoreOptions {
        journal_mode: JournalMode::Delete,
        busy_timeout: Duration::ZERO,
    }
}

#[test]
fn read_while_exclusively_locked_yields_nothing() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(STORE_FILE_NAME);
    let store = TaskStore::open(&path, "t1", rollback_journal()).unwrap();
    store
        .write(|db| db.inputs().insert("sample", &json!("NA12878")))
        .unwrap();

    let other = Connection::open(&path).unwrap();
    other.execute_batch("BEGIN EXCLUSIVE").unwrap();

    let during = store.read(|db| db.inputs().get_all()).unwrap();
    assert!(during.is_none());

    other.execute_batch("COMMIT").unwrap();

    let after = store.read(|db| db.inputs().get_all()).unwrap().unwrap();
    assert_eq!(after["sample"], json!("NA12878"));
}

#[test]
fn write_while_locked_is_a_transient_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(STORE_FILE_NAME);
    let store = TaskStore::open(&path, "t1", rollback_journal()).unwrap();

    let other = Connection::open(&path).unwrap();
    other.execute_batch("BEGIN EXCLUSIVE").unwrap();

    let err = store
        .write(|db| db.metadata().set_status(TaskStatus::Running))
        .unwrap_err();
    assert!(err.is_transient());

    other.execute_batch("ROLLBACK").unwrap();
    assert!(
        store
            .write(|db| db.metadata().set_status(TaskStatus::Running))
            .unwrap()
    );
}

#[test]
fn two_handles_share_one_task() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join(STORE_FILE_NAME);
    let watcher = TaskStore::open(&path, "t1", StoreOptions::default()).unwrap();
    let aborter = TaskStore::open(&path, "t1", StoreOptions::default()).unwrap();

    watcher
        .write(|db| db.metadata().set_status(TaskStatus::Running))
        .unwrap();
    aborter
        .write(|db| {
            db.metadata().set_bool(InfoKey::AbortRequested, true)?;
            db.metadata().set_status(TaskStatus::Aborted)
        })
        .unwrap();

    // The watcher's late observation does not resurrect the task.
    let accepted = watcher
        .write(|db| db.metadata().set_status(TaskStatus::Completed))
        .unwrap();
    assert!(!accepted);

    let record = watcher
        .read(|db| db.metadata().task())
        .unwrap()
        .flatten()
        .unwrap();
    assert_eq!(record.status, TaskStatus::Aborted);
    assert!(record.abort_requested);
}
