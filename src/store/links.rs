use super::Database;
use crate::error::Result;
use rusqlite::params;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Association between a pooled file and the component instance using it
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentLink {
    pub component: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component_id: Option<String>,
}

impl ComponentLink {
    pub fn new(component: impl Into<String>, component_id: Option<impl Into<String>>) -> Self {
        Self {
            component: component.into(),
            component_id: component_id.map(Into::into),
        }
    }

    /// Links for an optional owner; no component means no links.
    pub fn for_owner(component: Option<&str>, component_id: Option<&str>) -> Vec<Self> {
        match component {
            Some(c) if !c.is_empty() => vec![Self::new(c, component_id)],
            _ => Vec::new(),
        }
    }

    fn id_column(&self) -> &str {
        self.component_id.as_deref().unwrap_or("")
    }
}

/// A link row as stored
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileLink {
    pub file_id: String,
    pub link: ComponentLink,
}

/// Per-site table of file/component associations
#[derive(Clone)]
pub struct LinkStore {
    db: Arc<Database>,
}

impl LinkStore {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        db.with_conn(|conn| {
            conn.execute(
                r#"
                CREATE TABLE IF NOT EXISTS filepool_files_links (
                    file_id TEXT NOT NULL,
                    component TEXT NOT NULL,
                    component_id TEXT NOT NULL DEFAULT '',
                    PRIMARY KEY (file_id, component, component_id)
                )
                "#,
                [],
            )?;
            conn.execute(
                "CREATE INDEX IF NOT EXISTS idx_links_component ON filepool_files_links(component, component_id)",
                [],
            )?;
            Ok(())
        })?;
        Ok(Self { db })
    }

    /// Insert links, ignoring ones already present
    pub fn add_links(&self, file_id: &str, links: &[ComponentLink]) -> Result<()> {
        if links.is_empty() {
            return Ok(());
        }
        self.db.with_conn(|conn| {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare(
                    "INSERT OR IGNORE INTO filepool_files_links (file_id, component, component_id) VALUES (?1, ?2, ?3)",
                )?;
                for link in links {
                    stmt.execute(params![file_id, link.component, link.id_column()])?;
                }
            }
            tx.commit()
        })
    }

    pub fn get_links_for_file(&self, file_id: &str) -> Result<Vec<ComponentLink>> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT component, component_id FROM filepool_files_links WHERE file_id = ?1 ORDER BY component, component_id",
            )?;
            let rows = stmt.query_map(params![file_id], |row| {
                let component: String = row.get(0)?;
                let component_id: String = row.get(1)?;
                Ok(ComponentLink {
                    component,
                    component_id: (!component_id.is_empty()).then_some(component_id),
                })
            })?;
            rows.collect()
        })
    }

    /// Links owned by a component; without an id, every instance of it.
    pub fn get_links_for_component(
        &self,
        component: &str,
        component_id: Option<&str>,
    ) -> Result<Vec<FileLink>> {
        self.db.with_conn(|conn| {
            let map_row = |row: &rusqlite::Row<'_>| -> rusqlite::Result<FileLink> {
                let component_id: String = row.get(2)?;
                Ok(FileLink {
                    file_id: row.get(0)?,
                    link: ComponentLink {
                        component: row.get(1)?,
                        component_id: (!component_id.is_empty()).then_some(component_id),
                    },
                })
            };
            match component_id {
                Some(id) => {
                    let mut stmt = conn.prepare(
                        "SELECT file_id, component, component_id FROM filepool_files_links WHERE component = ?1 AND component_id = ?2",
                    )?;
                    let rows = stmt.query_map(params![component, id], map_row)?;
                    rows.collect()
                }
                None => {
                    let mut stmt = conn.prepare(
                        "SELECT file_id, component, component_id FROM filepool_files_links WHERE component = ?1",
                    )?;
                    let rows = stmt.query_map(params![component], map_row)?;
                    rows.collect()
                }
            }
        })
    }

    /// Distinct ids of the files linked to a component, in link order
    pub fn get_file_ids_for_component(
        &self,
        component: &str,
        component_id: Option<&str>,
    ) -> Result<Vec<String>> {
        let mut ids: Vec<String> = Vec::new();
        for link in self.get_links_for_component(component, component_id)? {
            if !ids.contains(&link.file_id) {
                ids.push(link.file_id);
            }
        }
        Ok(ids)
    }

    pub fn remove_links_for_file(&self, file_id: &str) -> Result<usize> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM filepool_files_links WHERE file_id = ?1",
                params![file_id],
            )
        })
    }
}
