use super::links::ComponentLink;
use super::{bool_to_sql, sql_to_bool, Database};
use crate::error::Result;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Lowest queue priority
pub const MIN_PRIORITY: i64 = 0;
/// Highest queue priority
pub const MAX_PRIORITY: i64 = 999;

/// Clamp a caller priority into the accepted range
pub fn clamp_priority(priority: i64) -> i64 {
    priority.clamp(MIN_PRIORITY, MAX_PRIORITY)
}

/// Identifies one queued file across all sites
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueKey {
    pub site_id: String,
    pub file_id: String,
}

impl QueueKey {
    pub fn new(site_id: impl Into<String>, file_id: impl Into<String>) -> Self {
        Self {
            site_id: site_id.into(),
            file_id: file_id.into(),
        }
    }
}

impl std::fmt::Display for QueueKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.site_id, self.file_id)
    }
}

/// A pending download, shared by every site on the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub site_id: String,
    pub file_id: String,
    pub url: String,
    /// 0..=999, higher first
    pub priority: i64,
    pub revision: i64,
    pub timemodified: i64,
    /// Custom destination relative to the site directory
    pub path: Option<String>,
    pub is_external_file: bool,
    pub repository_type: Option<String>,
    /// Links to apply once the file is downloaded
    pub links: Vec<ComponentLink>,
    /// Enqueue time in epoch milliseconds, FIFO tiebreak
    pub added: i64,
}

impl QueueEntry {
    pub fn key(&self) -> QueueKey {
        QueueKey::new(&self.site_id, &self.file_id)
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let links_json: String = row.get("links")?;
        let links = serde_json::from_str(&links_json).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(
                0,
                rusqlite::types::Type::Text,
                Box::new(e),
            )
        })?;
        Ok(Self {
            site_id: row.get("site_id")?,
            file_id: row.get("file_id")?,
            url: row.get("url")?,
            priority: row.get("priority")?,
            revision: row.get("revision")?,
            timemodified: row.get("timemodified")?,
            path: row.get("path")?,
            is_external_file: sql_to_bool(row.get("is_external_file")?),
            repository_type: row.get("repository_type")?,
            links,
            added: row.get("added")?,
        })
    }

    /// Fold a second request for the same file into this entry.
    ///
    /// Priority only rises and revision data only moves forward. A new
    /// destination or repository type replaces the old one, the external
    /// flag follows the latest request and links accumulate. Returns
    /// whether anything changed.
    pub fn merge(&mut self, other: &QueueEntry) -> bool {
        let mut changed = false;
        if other.priority > self.priority {
            self.priority = other.priority;
            changed = true;
        }
        if other.revision > self.revision {
            self.revision = other.revision;
            changed = true;
        }
        if other.timemodified > self.timemodified {
            self.timemodified = other.timemodified;
            changed = true;
        }
        if other.path.is_some() && other.path != self.path {
            self.path = other.path.clone();
            changed = true;
        }
        if other.repository_type.is_some() && other.repository_type != self.repository_type {
            self.repository_type = other.repository_type.clone();
            changed = true;
        }
        if other.is_external_file != self.is_external_file {
            self.is_external_file = other.is_external_file;
            changed = true;
        }
        if other.url != self.url {
            // Same file id, fresher token or revision in the URL
            self.url = other.url.clone();
            changed = true;
        }
        for link in &other.links {
            if !self.links.contains(link) {
                self.links.push(link.clone());
                changed = true;
            }
        }
        changed
    }
}

/// Device-global table of pending downloads
#[derive(Clone)]
pub struct QueueStore {
    db: Arc<Database>,
}

impl QueueStore {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        db.with_conn(|conn| {
            conn.execute(
                r#"
                CREATE TABLE IF NOT EXISTS filepool_queue (
                    site_id TEXT NOT NULL,
                    file_id TEXT NOT NULL,
                    url TEXT NOT NULL,
                    priority INTEGER NOT NULL DEFAULT 0,
                    revision INTEGER NOT NULL DEFAULT 0,
                    timemodified INTEGER NOT NULL DEFAULT 0,
                    path TEXT,
                    is_external_file INTEGER NOT NULL DEFAULT 0,
                    repository_type TEXT,
                    links TEXT NOT NULL DEFAULT '[]',
                    added INTEGER NOT NULL,
                    PRIMARY KEY (site_id, file_id)
                )
                "#,
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_queue_order ON filepool_queue(priority DESC, added ASC)",
                [],
            )?;
            Ok(())
        })?;
        Ok(Self { db })
    }

    /// Insert a new entry or merge into the existing one for the same key.
    ///
    /// Returns the stored entry and whether it already existed. The read
    /// and write happen in one transaction.
    pub fn upsert(&self, entry: &QueueEntry) -> Result<(QueueEntry, bool)> {
        let links_json = serde_json::to_string(&entry.links)?;
        let result = self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            let existing = tx
                .query_row(
                    "SELECT * FROM filepool_queue WHERE site_id = ?1 AND file_id = ?2",
                    params![entry.site_id, entry.file_id],
                    QueueEntry::from_row,
                )
                .optional()?;

            let outcome = match existing {
                Some(mut current) => {
                    if current.merge(entry) {
                        let merged_links = serde_json::to_string(&current.links)
                            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
                        tx.execute(
                            r#"
                            UPDATE filepool_queue
                            SET url = ?3, priority = ?4, revision = ?5, timemodified = ?6,
                                path = ?7, is_external_file = ?8, repository_type = ?9,
                                links = ?10
                            WHERE site_id = ?1 AND file_id = ?2
                            "#,
                            params![
                                current.site_id,
                                current.file_id,
                                current.url,
                                current.priority,
                                current.revision,
                                current.timemodified,
                                current.path,
                                bool_to_sql(current.is_external_file),
                                current.repository_type,
                                merged_links,
                            ],
                        )?;
                    }
                    (current, true)
                }
                None => {
                    tx.execute(
                        r#"
                        INSERT INTO filepool_queue (
                            site_id, file_id, url, priority, revision, timemodified,
                            path, is_external_file, repository_type, links, added
                        ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
                        "#,
                        params![
                            entry.site_id,
                            entry.file_id,
                            entry.url,
                            entry.priority,
                            entry.revision,
                            entry.timemodified,
                            entry.path,
                            bool_to_sql(entry.is_external_file),
                            entry.repository_type,
                            links_json,
                            entry.added,
                        ],
                    )?;
                    (entry.clone(), false)
                }
            };
            tx.commit()?;
            Ok(outcome)
        })?;
        Ok(result)
    }

    pub fn get(&self, key: &QueueKey) -> Result<Option<QueueEntry>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM filepool_queue WHERE site_id = ?1 AND file_id = ?2",
                params![key.site_id, key.file_id],
                QueueEntry::from_row,
            )
            .optional()
        })
    }

    /// The entry `process_next` would pick: highest priority, then oldest.
    pub fn peek_next(&self) -> Result<Option<QueueEntry>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM filepool_queue ORDER BY priority DESC, added ASC, rowid ASC LIMIT 1",
                [],
                QueueEntry::from_row,
            )
            .optional()
        })
    }

    /// All entries in selection order
    pub fn get_all(&self) -> Result<Vec<QueueEntry>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM filepool_queue ORDER BY priority DESC, added ASC, rowid ASC",
            )?;
            let rows = stmt.query_map([], QueueEntry::from_row)?;
            rows.collect()
        })
    }

    pub fn remove(&self, key: &QueueKey) -> Result<bool> {
        let removed = self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM filepool_queue WHERE site_id = ?1 AND file_id = ?2",
                params![key.site_id, key.file_id],
            )
        })?;
        Ok(removed > 0)
    }

    pub fn len(&self) -> Result<usize> {
        let count: i64 = self.db.with_conn(|conn| {
            conn.query_row("SELECT COUNT(*) FROM filepool_queue", [], |r| r.get(0))
        })?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn store() -> QueueStore {
        QueueStore::new(Arc::new(Database::open_in_memory().unwrap())).unwrap()
    }

    fn entry(file_id: &str, priority: i64, added: i64) -> QueueEntry {
        QueueEntry {
            site_id: "site".into(),
            file_id: file_id.into(),
            url: format!("https://lms.test/{}", file_id),
            priority,
            revision: 0,
            timemodified: 0,
            path: None,
            is_external_file: false,
            repository_type: None,
            links: Vec::new(),
            added,
        }
    }

    #[test]
    fn test_insert_then_get() {
        let store = store();
        let e = entry("a", 5, 1);
        let (stored, existed) = store.upsert(&e).unwrap();
        assert!(!existed);
        assert_eq!(stored, e);
        assert_eq!(store.get(&e.key()).unwrap(), Some(e));
    }

    #[test]
    fn test_duplicate_enqueue_merges() {
        let store = store();
        let mut first = entry("a", 10, 1);
        first.links = vec![ComponentLink::new("mod_page", Some("1"))];
        let mut second = entry("a", 400, 2);
        second.revision = 3;
        second.links = vec![
            ComponentLink::new("mod_page", Some("1")),
            ComponentLink::new("mod_book", Some("2")),
        ];

        store.upsert(&first).unwrap();
        let (merged, existed) = store.upsert(&second).unwrap();

        assert!(existed);
        assert_eq!(store.len().unwrap(), 1);
        assert_eq!(merged.priority, 400);
        assert_eq!(merged.revision, 3);
        // FIFO position is kept
        assert_eq!(merged.added, 1);
        assert_eq!(
            merged.links,
            vec![
                ComponentLink::new("mod_page", Some("1")),
                ComponentLink::new("mod_book", Some("2")),
            ]
        );
        assert_eq!(store.get(&first.key()).unwrap(), Some(merged));
    }

    #[test]
    fn test_merge_never_lowers_priority() {
        let store = store();
        store.upsert(&entry("a", 500, 1)).unwrap();
        let (merged, _) = store.upsert(&entry("a", 0, 2)).unwrap();
        assert_eq!(merged.priority, 500);
    }

    #[test]
    fn test_merge_carries_external_flag_and_repository() {
        let store = store();
        store.upsert(&entry("a", 0, 1)).unwrap();

        let mut external = entry("a", 0, 2);
        external.is_external_file = true;
        external.repository_type = Some("dropbox".into());
        let (merged, _) = store.upsert(&external).unwrap();
        assert!(merged.is_external_file);
        assert_eq!(merged.repository_type.as_deref(), Some("dropbox"));
        assert_eq!(store.get(&merged.key()).unwrap(), Some(merged));

        // No repository in the new request keeps the known one
        let (merged, _) = store.upsert(&entry("a", 0, 3)).unwrap();
        assert!(!merged.is_external_file);
        assert_eq!(merged.repository_type.as_deref(), Some("dropbox"));
        assert_eq!(store.get(&merged.key()).unwrap(), Some(merged));
    }

    #[test]
    fn test_peek_order_priority_then_fifo() {
        let store = store();
        store.upsert(&entry("a", 0, 1)).unwrap();
        store.upsert(&entry("b", 500, 3)).unwrap();
        store.upsert(&entry("c", 500, 2)).unwrap();

        assert_eq!(store.peek_next().unwrap().unwrap().file_id, "c");
        let order: Vec<_> = store.get_all().unwrap().into_iter().map(|e| e.file_id).collect();
        assert_eq!(order, vec!["c", "b", "a"]);
    }

    #[test]
    fn test_remove() {
        let store = store();
        let e = entry("a", 0, 1);
        store.upsert(&e).unwrap();
        assert!(store.remove(&e.key()).unwrap());
        assert!(store.is_empty().unwrap());
        assert!(store.peek_next().unwrap().is_none());
    }

    #[test]
    fn test_clamp_priority() {
        assert_eq!(clamp_priority(-4), 0);
        assert_eq!(clamp_priority(5000), 999);
        assert_eq!(clamp_priority(12), 12);
    }
}
