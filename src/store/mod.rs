//! Embedded SQLite persistence
//!
//! - `QueueStore` lives in the device-wide app database
//! - `FileStore`, `LinkStore` and `PackageStore` live in one database per site

pub mod files;
pub mod links;
pub mod packages;
pub mod queue;
pub mod site;

use crate::error::{FilepoolError, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// A single SQLite connection shared by the stores built on it
pub struct Database {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl Database {
    /// Open (or create) a database file
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        tracing::debug!("Opened database {:?}", path);
        Ok(Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            path: None,
        })
    }

    /// Location on disk, `None` for in-memory databases
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Run a closure against the connection.
    ///
    /// The lock is never held across an `.await`; callers keep the closure
    /// to a few statements.
    pub fn with_conn<T>(&self, f: impl FnOnce(&mut Connection) -> rusqlite::Result<T>) -> Result<T> {
        let mut conn = self
            .conn
            .lock()
            .map_err(|e| FilepoolError::Store(format!("Failed to lock database: {}", e)))?;
        Ok(f(&mut *conn)?)
    }
}

/// SQLite has no bool; store 0/1.
pub(crate) fn bool_to_sql(value: bool) -> i64 {
    i64::from(value)
}

pub(crate) fn sql_to_bool(value: i64) -> bool {
    value != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_in_memory() {
        let db = Database::open_in_memory().unwrap();
        assert!(db.path().is_none());
        let one: i64 = db.with_conn(|c| c.query_row("SELECT 1", [], |r| r.get(0))).unwrap();
        assert_eq!(one, 1);
    }

    #[test]
    fn test_open_file_creates_parent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("app.db");
        let db = Database::open(&path).unwrap();
        assert_eq!(db.path(), Some(path.as_path()));
        assert!(path.exists());
    }
}
