//! Durable Store: SQLite-backed sessions, messages, compaction snapshots,
//! approvals, and runtime settings.
//!
//! A single [`Store`] wraps one [`rusqlite::Connection`] behind a mutex.
//! SQLite serializes writers anyway; a mutex around one connection keeps
//! the crate's locking story simple without reaching for a connection pool
//! this workload doesn't need.

mod approvals;
mod memories;
mod messages;
mod schema;
mod sessions;
mod settings;
mod snapshots;

pub use approvals::{ApprovalRecord, ApprovalStatus};
pub use snapshots::SnapshotInput;

use cc_domain::error::{Error, Result};
use parking_lot::Mutex;
use rusqlite::Connection;
use std::path::Path;

pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open (creating if absent) the database at `path` and run schema
    /// initialization.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| Error::Store(e.to_string()))?;
        schema::init(&conn).map_err(|e| Error::Store(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store, used by tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(|e| Error::Store(e.to_string()))?;
        schema::init(&conn).map_err(|e| Error::Store(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_initializes_schema() {
        let store = Store::open_in_memory().unwrap();
        let conn = store.conn.lock();
        let count: i64 = conn
            .query_row(
                "SELECT count(*) FROM sqlite_master WHERE type='table' AND name='sessions'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(count, 1);
    }
}
