use super::Database;
use crate::error::Result;
use crate::pool::status::PackageStatus;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Download status of a package owned by a component instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageEntry {
    pub id: String,
    pub component: String,
    pub component_id: Option<String>,
    pub status: PackageStatus,
    /// Status right before the latest transition
    pub previous: Option<PackageStatus>,
    /// Epoch milliseconds of the latest write
    pub updated: i64,
    pub download_time: i64,
    pub previous_download_time: i64,
    /// Opaque caller payload
    pub extra: Option<String>,
}

fn parse_status(idx: usize, raw: &str) -> rusqlite::Result<PackageStatus> {
    raw.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            e.into(),
        )
    })
}

impl PackageEntry {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        let status: String = row.get("status")?;
        let previous: Option<String> = row.get("previous")?;
        let component_id: String = row.get("component_id")?;
        Ok(Self {
            id: row.get("id")?,
            component: row.get("component")?,
            component_id: (!component_id.is_empty()).then_some(component_id),
            status: parse_status(3, &status)?,
            previous: previous.as_deref().map(|p| parse_status(4, p)).transpose()?,
            updated: row.get("updated")?,
            download_time: row.get("download_time")?,
            previous_download_time: row.get("previous_download_time")?,
            extra: row.get("extra")?,
        })
    }
}

/// Per-site table of package statuses
#[derive(Clone)]
pub struct PackageStore {
    db: Arc<Database>,
}

impl PackageStore {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        db.with_conn(|conn| {
            conn.execute(
                r#"
                CREATE TABLE IF NOT EXISTS filepool_packages (
                    id TEXT PRIMARY KEY,
                    component TEXT NOT NULL,
                    component_id TEXT NOT NULL DEFAULT '',
                    status TEXT NOT NULL,
                    previous TEXT,
                    updated INTEGER NOT NULL,
                    download_time INTEGER NOT NULL DEFAULT 0,
                    previous_download_time INTEGER NOT NULL DEFAULT 0,
                    extra TEXT
                )
                "#,
                [],
            )
        })?;
        Ok(Self { db })
    }

    pub fn put(&self, entry: &PackageEntry) -> Result<()> {
        self.db.with_conn(|conn| {
            conn.execute(
                r#"
                INSERT OR REPLACE INTO filepool_packages (
                    id, component, component_id, status, previous, updated,
                    download_time, previous_download_time, extra
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    entry.id,
                    entry.component,
                    entry.component_id.as_deref().unwrap_or(""),
                    entry.status.as_str(),
                    entry.previous.map(PackageStatus::as_str),
                    entry.updated,
                    entry.download_time,
                    entry.previous_download_time,
                    entry.extra,
                ],
            )
        })?;
        Ok(())
    }

    pub fn get(&self, id: &str) -> Result<Option<PackageEntry>> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT * FROM filepool_packages WHERE id = ?1",
                params![id],
                PackageEntry::from_row,
            )
            .optional()
        })
    }

    pub fn get_by_status(&self, status: PackageStatus) -> Result<Vec<PackageEntry>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM filepool_packages WHERE status = ?1")?;
            let rows = stmt.query_map(params![status.as_str()], PackageEntry::from_row)?;
            rows.collect()
        })
    }

    pub fn get_all(&self) -> Result<Vec<PackageEntry>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM filepool_packages ORDER BY component, component_id")?;
            let rows = stmt.query_map([], PackageEntry::from_row)?;
            rows.collect()
        })
    }

    pub fn clear(&self) -> Result<usize> {
        self.db
            .with_conn(|conn| conn.execute("DELETE FROM filepool_packages", []))
    }
}
