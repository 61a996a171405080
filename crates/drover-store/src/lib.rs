//! Persistent store for drover tasks.
//!
//! One SQLite file per task holds the tables of six independent providers:
//! inputs, outputs, jobs, progress markers, metadata key/values and version
//! history. Each provider declares its own schema version and upgrade hook;
//! pending upgrades run once when the store is opened.
//!
//! Writes go through [`TaskStore::write`], which runs the caller's unit of
//! work in a single transaction and commits only if it succeeds. Reads go
//! through [`TaskStore::read`], which turns lock and read-only conditions
//! caused by a concurrent writer into `Ok(None)` ("nothing available now").

pub mod error;
pub mod providers;
mod schema;
pub mod store;

pub use error::{Result, StoreError};
pub use providers::{
    InputsDb, JobsDb, MetadataDb, OutputsDb, ProgressDb, TaskDb, TaskRecord, VersionEntry,
    VersionsDb,
};
pub use store::{JournalMode, STORE_FILE_NAME, StoreOptions, TaskStore};
