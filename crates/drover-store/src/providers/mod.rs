//! Table providers.
//!
//! A [`TaskDb`] is a borrowed view of the store for the duration of one
//! read or write unit; each accessor returns the provider for one table.

pub(crate) mod inputs;
pub(crate) mod jobs;
pub(crate) mod metadata;
pub(crate) mod outputs;
pub(crate) mod progress;
pub(crate) mod versions;

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use drover_types::Timestamp;

pub use inputs::InputsDb;
pub use jobs::JobsDb;
pub use metadata::{MetadataDb, TaskRecord};
pub use outputs::OutputsDb;
pub use progress::ProgressDb;
pub use versions::{VersionEntry, VersionsDb};

/// Borrowed view over every provider, scoped to one task.
pub struct TaskDb<'c> {
    conn: &'c Connection,
    tid: &'c str,
}

impl<'c> TaskDb<'c> {
    pub(crate) fn new(conn: &'c Connection, tid: &'c str) -> Self {
        Self { conn, tid }
    }

    pub fn tid(&self) -> &str {
        self.tid
    }

    pub fn inputs(&self) -> InputsDb<'c> {
        InputsDb::new(self.conn, self.tid)
    }

    pub fn outputs(&self) -> OutputsDb<'c> {
        OutputsDb::new(self.conn, self.tid)
    }

    pub fn jobs(&self) -> JobsDb<'c> {
        JobsDb::new(self.conn, self.tid)
    }

    pub fn progress(&self) -> ProgressDb<'c> {
        ProgressDb::new(self.conn, self.tid)
    }

    pub fn metadata(&self) -> MetadataDb<'c> {
        MetadataDb::new(self.conn, self.tid)
    }

    pub fn versions(&self) -> VersionsDb<'c> {
        VersionsDb::new(self.conn, self.tid)
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

pub(crate) fn format_dt(dt: &Timestamp) -> String {
    dt.to_rfc3339()
}

pub(crate) fn parse_dt(s: &str) -> Option<Timestamp> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}
