//! Per-site databases, opened lazily and kept for the process lifetime

use super::files::FileStore;
use super::links::LinkStore;
use super::packages::PackageStore;
use super::Database;
use crate::error::Result;
use crate::file::naming::check_site_id;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

/// The three tables of one site, sharing a connection
#[derive(Clone)]
pub struct SiteStore {
    pub files: FileStore,
    pub links: LinkStore,
    pub packages: PackageStore,
}

impl SiteStore {
    pub fn new(db: Arc<Database>) -> Result<Self> {
        Ok(Self {
            files: FileStore::new(db.clone())?,
            links: LinkStore::new(db.clone())?,
            packages: PackageStore::new(db)?,
        })
    }
}

/// Where site databases live
#[derive(Debug, Clone)]
pub enum SiteStorage {
    /// `<root>/<site_id>/filepool.db`
    Directory(PathBuf),
    /// Fresh in-memory database per site
    InMemory,
}

/// Registry of open site stores
pub struct SiteStores {
    storage: SiteStorage,
    open: Mutex<HashMap<String, SiteStore>>,
}

impl SiteStores {
    pub fn new(storage: SiteStorage) -> Self {
        Self {
            storage,
            open: Mutex::new(HashMap::new()),
        }
    }

    /// Store for a site, opening its database on first use
    pub fn get(&self, site_id: &str) -> Result<SiteStore> {
        check_site_id(site_id)?;
        let mut open = self.open.lock().map_err(|e| {
            crate::error::FilepoolError::Store(format!("Failed to lock site registry: {}", e))
        })?;
        if let Some(store) = open.get(site_id) {
            return Ok(store.clone());
        }

        let db = match &self.storage {
            SiteStorage::Directory(root) => {
                Database::open(&root.join(site_id).join("filepool.db"))?
            }
            SiteStorage::InMemory => Database::open_in_memory()?,
        };
        let store = SiteStore::new(Arc::new(db))?;
        tracing::debug!("Opened filepool tables for site {}", site_id);
        open.insert(site_id.to_string(), store.clone());
        Ok(store)
    }
}
