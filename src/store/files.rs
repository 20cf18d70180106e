use super::{bool_to_sql, sql_to_bool, Database};
use crate::error::Result;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A file that has been downloaded into the pool of a site
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub file_id: String,
    pub url: String,
    pub revision: i64,
    /// Server-reported modification time, epoch seconds
    pub timemodified: i64,
    /// Forces a re-download regardless of revision data
    pub stale: bool,
    /// Epoch milliseconds
    pub download_time: i64,
    /// Path relative to the site directory
    pub path: String,
    pub extension: Option<String>,
    pub is_external_file: bool,
    pub repository_type: Option<String>,
}

impl FileEntry {
    pub fn new(file_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            file_id: file_id.into(),
            url: url.into(),
            revision: 0,
            timemodified: 0,
            stale: false,
            download_time: 0,
            path: String::new(),
            extension: None,
            is_external_file: false,
            repository_type: None,
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            file_id: row.get("file_id")?,
            url: row.get("url")?,
            revision: row.get("revision")?,
            timemodified: row.get("timemodified")?,
            stale: sql_to_bool(row.get("stale")?),
            download_time: row.get("download_time")?,
            path: row.get("path")?,
            extension: row.get("extension")?,
            is_external_file: sql_to_bool(row.get("is_external_file")?),
            repository_type: row.get("repository_type")?,
        })
    }
}

/// Per-site table of pooled files
#[derive(Clone)]
pub struct FileStore {
    db: Arc<Database>,
}

impl FileStore {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        db.with_conn(|conn| {
            conn.execute(
                r#"
                CREATE TABLE IF NOT EXISTS filepool_files (
                    file_id TEXT PRIMARY KEY,
                    url TEXT NOT NULL,
                    revision INTEGER NOT NULL DEFAULT 0,
                    timemodified INTEGER NOT NULL DEFAULT 0,
                    stale INTEGER NOT NULL DEFAULT 0,
                    download_time INTEGER NOT NULL DEFAULT 0,
                    path TEXT NOT NULL,
                    extension TEXT,
                    is_external_file INTEGER NOT NULL DEFAULT 0,
                    repository_type TEXT
                )
                "#,
                [],
            )
        })?;
        Ok(Self { db })
    }

    /// Insert or replace the entry for `entry.file_id`
    pub fn put(&self, entry: &FileEntry) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT OR REPLACE INTO filepool_files (
                    file_id, url, revision, timemodified, stale, download_time,
                    path, extension, is_external_file, repository_type
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                "#,
                params![
                    entry.file_id,
                    entry.url,
                    entry.revision,
                    entry.timemodified,
                    bool_to_sql(entry.stale),
                    entry.download_time,
                    entry.path,
                    entry.extension,
                    bool_to_sql(entry.is_external_file),
                    entry.repository_type,
                ],
            )
        })?;
        Ok(())
    }

    pub fn get(&self, file_id: &str) -> Result<Option<FileEntry>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM filepool_files WHERE file_id = ?1",
                params![file_id],
                FileEntry::from_row,
            )
            .optional()
        })
    }

    pub fn get_all(&self) -> Result<Vec<FileEntry>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM filepool_files ORDER BY file_id")?;
            let rows = stmt.query_map([], FileEntry::from_row)?;
            rows.collect()
        })
    }

    /// Flag entries as stale. Returns how many rows changed.
    pub fn set_stale(&self, file_ids: &[String]) -> Result<usize> {
        if file_ids.is_empty() {
            return Ok(0);
        }
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let mut changed = 0;
            {
                let mut stmt =
                    tx.prepare("UPDATE filepool_files SET stale = 1 WHERE file_id = ?1")?;
                for id in file_ids {
                    changed += stmt.execute(params![id])?;
                }
            }
            tx.commit()?;
            Ok(changed)
        })
    }

    /// Flag every entry as stale
    pub fn set_all_stale(&self) -> Result<usize> {
        self.db
            .with_conn(|conn| conn.execute("UPDATE filepool_files SET stale = 1", []))
    }

    pub fn remove(&self, file_id: &str) -> Result<bool> {
        let removed = self.db.with_conn(|conn| {
            conn.execute("DELETE FROM filepool_files WHERE file_id = ?1", params![file_id])
        })?;
        Ok(removed > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store() -> FileStore {
        FileStore::new(Arc::new(Database::open_in_memory().unwrap())).unwrap()
    }

    fn sample(id: &str) -> FileEntry {
        FileEntry {
            revision: 3,
            timemodified: 1_700_000_000,
            download_time: 1_700_000_000_123,
            path: format!("filepool/{}.pdf", id),
            extension: Some("pdf".into()),
            repository_type: Some("dropbox".into()),
            ..FileEntry::new(id, format!("https://lms.test/{}.pdf", id))
        }
    }

    #[test]
    fn test_put_and_get() {
        let store = store();
        let entry = sample("a_1");
        store.put(&entry).unwrap();
        assert_eq!(store.get("a_1").unwrap(), Some(entry));
        assert_eq!(store.get("missing").unwrap(), None);
    }

    #[test]
    fn test_put_replaces_existing() {
        let store = store();
        let mut entry = sample("a_1");
        store.put(&entry).unwrap();
        entry.revision = 4;
        entry.stale = false;
        store.put(&entry).unwrap();

        assert_eq!(store.get_all().unwrap().len(), 1);
        assert_eq!(store.get("a_1").unwrap().unwrap().revision, 4);
    }

    #[test]
    fn test_set_stale() {
        let store = store();
        store.put(&sample("a_1")).unwrap();
        store.put(&sample("b_2")).unwrap();

        assert_eq!(store.set_stale(&["a_1".to_string(), "zzz".to_string()]).unwrap(), 1);
        assert!(store.get("a_1").unwrap().unwrap().stale);
        assert!(!store.get("b_2").unwrap().unwrap().stale);

        assert_eq!(store.set_all_stale().unwrap(), 2);
        assert!(store.get("b_2").unwrap().unwrap().stale);
    }

    #[test]
    fn test_remove() {
        let store = store();
        store.put(&sample("a_1")).unwrap();
        assert!(store.remove("a_1").unwrap());
        assert!(!store.remove("a_1").unwrap());
    }
}
