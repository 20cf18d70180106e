//! The filepool engine: read path, explicit downloads, removal and invalidation
//!
//! Queue processing lives in `pool::queue` and packages in `pool::package`;
//! all three extend the same `Filepool` handle.

use super::events::{EventBus, FilepoolEvent};
use super::file_id::{download_key, extension_from_url, file_id_from_url, fix_plugin_file_url};
use super::fs::{default_file_path, FileSystem, LocalFileSystem};
use super::http_client::{HttpFetcher, ProgressCallback, RemoteFetcher};
use super::network::{NetworkMonitor, NetworkState};
use super::queue::{QueueState, Waiters};
use super::single_flight::SingleFlight;
use super::status::{is_outdated, is_update_unknown, FileState};
use crate::app::config::{Config, QueueConfig};
use crate::error::{FilepoolError, Result};
use crate::file::metadata::apply_timemodified;
use crate::file::naming::check_relative_path;
use crate::store::files::FileEntry;
use crate::store::links::ComponentLink;
use crate::store::queue::{QueueKey, QueueStore};
use crate::store::site::{SiteStorage, SiteStore, SiteStores};
use crate::store::{now_millis, Database};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{broadcast, Notify};

/// Per-request options for a file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileOptions {
    /// Component that will use the file; links it once downloaded
    pub component: Option<String>,
    pub component_id: Option<String>,
    pub revision: i64,
    /// Server modification time, epoch seconds
    pub timemodified: i64,
    /// Destination relative to the site directory instead of the pool folder
    pub path: Option<String>,
    /// Queue priority, the configured default when unset
    pub priority: Option<i64>,
    pub is_external_file: bool,
    pub repository_type: Option<String>,
    /// Serve an outdated copy instead of refetching
    pub ignore_stale: bool,
}

impl FileOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn for_component(component: impl Into<String>, component_id: Option<&str>) -> Self {
        Self {
            component: Some(component.into()),
            component_id: component_id.map(str::to_string),
            ..Self::default()
        }
    }

    pub fn with_revision(mut self, revision: i64, timemodified: i64) -> Self {
        self.revision = revision;
        self.timemodified = timemodified;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn ignoring_stale(mut self) -> Self {
        self.ignore_stale = true;
        self
    }

    pub fn links(&self) -> Vec<ComponentLink> {
        ComponentLink::for_owner(self.component.as_deref(), self.component_id.as_deref())
    }
}

/// How a local copy is handed back to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum UrlMode {
    /// `file://` URL
    FileUrl,
    /// Absolute filesystem path
    Src,
}

pub(crate) struct Inner {
    pub(crate) queue_config: QueueConfig,
    pub(crate) queue: QueueStore,
    pub(crate) sites: SiteStores,
    pub(crate) fetcher: Arc<dyn RemoteFetcher>,
    pub(crate) fs: Arc<dyn FileSystem>,
    pub(crate) network: Arc<dyn NetworkState>,
    pub(crate) file_flights: SingleFlight<FileEntry>,
    pub(crate) package_flights: SingleFlight<()>,
    pub(crate) waiters: Waiters,
    pub(crate) queue_state: Mutex<QueueState>,
    pub(crate) queue_wake: Notify,
    pub(crate) queue_started: AtomicBool,
    pub(crate) site_tokens: RwLock<HashMap<String, String>>,
    pub(crate) events: EventBus,
}

/// Handle to the engine. Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct Filepool {
    pub(crate) inner: Arc<Inner>,
}

impl Filepool {
    /// Build an engine over explicit adapters
    pub fn new(
        config: &Config,
        fetcher: Arc<dyn RemoteFetcher>,
        fs: Arc<dyn FileSystem>,
        network: Arc<dyn NetworkState>,
    ) -> Result<Self> {
        let (app_db, site_storage) = if config.storage.in_memory {
            (Database::open_in_memory()?, SiteStorage::InMemory)
        } else {
            (
                Database::open(&config.storage.app_db_path())?,
                SiteStorage::Directory(config.storage.sites_dir()),
            )
        };
        let queue = QueueStore::new(Arc::new(app_db))?;

        tracing::info!(
            "Filepool ready (data_dir={:?}, in_memory={})",
            config.storage.data_dir,
            config.storage.in_memory
        );

        Ok(Self {
            inner: Arc::new(Inner {
                queue_config: config.queue.clone(),
                queue,
                sites: SiteStores::new(site_storage),
                fetcher,
                fs,
                network,
                file_flights: SingleFlight::new(),
                package_flights: SingleFlight::new(),
                waiters: Waiters::default(),
                queue_state: Mutex::new(QueueState::Paused),
                queue_wake: Notify::new(),
                queue_started: AtomicBool::new(false),
                site_tokens: RwLock::new(HashMap::new()),
                events: EventBus::default(),
            }),
        })
    }

    /// Build an engine with the HTTP fetcher, local storage under the data
    /// directory and a monitor reporting the device online.
    pub fn open(config: &Config) -> Result<(Self, Arc<NetworkMonitor>)> {
        let fetcher = HttpFetcher::new(&config.network)?;
        let fs = LocalFileSystem::new(config.storage.sites_dir());
        let network = Arc::new(NetworkMonitor::new(true));
        let pool = Self::new(config, Arc::new(fetcher), Arc::new(fs), network.clone())?;
        Ok((pool, network))
    }

    /// Remember the web-service token of a site; plugin file URLs of that
    /// site are fetched through the token endpoint.
    pub fn register_site_token(&self, site_id: &str, token: impl Into<String>) {
        let mut tokens = self
            .inner
            .site_tokens
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        tokens.insert(site_id.to_string(), token.into());
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FilepoolEvent> {
        self.inner.events.subscribe()
    }

    pub fn network(&self) -> &Arc<dyn NetworkState> {
        &self.inner.network
    }

    pub fn file_system(&self) -> &Arc<dyn FileSystem> {
        &self.inner.fs
    }

    pub(crate) fn emit(&self, event: FilepoolEvent) {
        self.inner.events.emit(event);
    }

    pub(crate) fn site(&self, site_id: &str) -> Result<SiteStore> {
        self.inner.sites.get(site_id)
    }

    /// The URL the fetcher will request for `url` on this site
    pub(crate) fn fix_url(&self, site_id: &str, url: &str) -> Result<String> {
        let tokens = self
            .inner
            .site_tokens
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        fix_plugin_file_url(url, tokens.get(site_id).map(String::as_str))
    }

    fn destination(&self, url: &str, file_id: &str, options: &FileOptions) -> Result<String> {
        match &options.path {
            Some(path) => {
                check_relative_path(path)?;
                Ok(path.clone())
            }
            None => Ok(default_file_path(file_id, extension_from_url(url).as_deref())),
        }
    }

    fn flight_key(&self, site_id: &str, url: &str, path: &str) -> String {
        format!("{}:{}", site_id, download_key(url, path))
    }

    /// Absolute path of an entry's local copy, checked on disk
    pub(crate) async fn local_path(&self, site_id: &str, entry: &FileEntry) -> Result<PathBuf> {
        let path = self.inner.fs.resolve(site_id, &entry.path)?;
        self.inner
            .fs
            .get_file(&path)
            .await
            .map_err(|_| FilepoolError::LocalFileMissing(entry.file_id.clone()))
    }

    pub(crate) async fn local_url(
        &self,
        site_id: &str,
        entry: &FileEntry,
        mode: UrlMode,
    ) -> Result<String> {
        let path = self.local_path(site_id, entry).await?;
        match mode {
            UrlMode::Src => Ok(path.to_string_lossy().into_owned()),
            UrlMode::FileUrl => url::Url::from_file_path(&path)
                .map(String::from)
                .map_err(|_| FilepoolError::Io(format!("Not an absolute path: {:?}", path))),
        }
    }

    /// URL to show for a remote file.
    ///
    /// A current local copy yields a `file://` URL. Otherwise the file is
    /// queued in the background and the fetchable remote URL is returned.
    pub async fn get_url_by_url(
        &self,
        site_id: &str,
        url: &str,
        options: &FileOptions,
    ) -> Result<String> {
        self.get_usable_url(site_id, url, options, UrlMode::FileUrl)
            .await
    }

    /// Like `get_url_by_url`, but a local copy yields its absolute path.
    pub async fn get_src_by_url(
        &self,
        site_id: &str,
        url: &str,
        options: &FileOptions,
    ) -> Result<String> {
        self.get_usable_url(site_id, url, options, UrlMode::Src).await
    }

    async fn get_usable_url(
        &self,
        site_id: &str,
        url: &str,
        options: &FileOptions,
        mode: UrlMode,
    ) -> Result<String> {
        let remote = self.fix_url(site_id, url)?;
        let file_id = file_id_from_url(url);
        let site = self.site(site_id)?;

        let entry = site.files.get(&file_id)?.filter(|entry| {
            options.ignore_stale
                || !self.inner.network.is_online()
                || !is_outdated(entry, options.revision, options.timemodified)
        });

        let Some(entry) = entry else {
            tracing::debug!("No current copy of {} in site {}, queueing", file_id, site_id);
            self.enqueue_in_background(site_id, url, options);
            return Ok(remote);
        };

        match self.local_url(site_id, &entry, mode).await {
            Ok(local) => {
                site.links.add_links(&file_id, &options.links())?;
                tracing::debug!("Serving {} from the pool", file_id);
                Ok(local)
            }
            Err(e) => {
                tracing::warn!("File {} is in the pool but missing on disk", file_id);
                if let Err(remove_err) = self.remove_file_by_id(site_id, &file_id).await {
                    tracing::warn!("Failed to drop entry {}: {}", file_id, remove_err);
                }
                self.enqueue_in_background(site_id, url, options);
                if self.inner.network.is_online() {
                    Ok(remote)
                } else {
                    Err(e)
                }
            }
        }
    }

    fn enqueue_in_background(&self, site_id: &str, url: &str, options: &FileOptions) {
        let queued = FileOptions {
            priority: Some(0),
            ..options.clone()
        };
        if let Err(e) = self.add_to_queue_by_url(site_id, url, &queued) {
            tracing::debug!("Background enqueue of {} skipped: {}", url, e);
        }
    }

    /// Download a file now, bypassing the queue, and return its local URL.
    ///
    /// A current local copy is returned as is. Concurrent requests for the
    /// same URL and destination share one transfer.
    pub async fn download_url(
        &self,
        site_id: &str,
        url: &str,
        options: &FileOptions,
        progress: Option<ProgressCallback>,
    ) -> Result<String> {
        self.fix_url(site_id, url)?;
        let file_id = file_id_from_url(url);
        let site = self.site(site_id)?;
        let links = options.links();

        if let Some(entry) = site.files.get(&file_id)? {
            if options.ignore_stale || !is_outdated(&entry, options.revision, options.timemodified)
            {
                if let Some(entry) = self
                    .current_copy(site_id, entry, options.path.as_deref())
                    .await?
                {
                    let local = self.local_url(site_id, &entry, UrlMode::FileUrl).await?;
                    site.links.add_links(&file_id, &links)?;
                    tracing::debug!("{} already downloaded", file_id);
                    return Ok(local);
                }
            }
        }

        let entry = self
            .download_for_pool(site_id, url, options, progress)
            .await?;
        site.links.add_links(&file_id, &links)?;
        self.local_url(site_id, &entry, UrlMode::FileUrl).await
    }

    /// The local copy of an entry at the wanted destination, moved there
    /// when it was downloaded under another path. `None` when the copy is
    /// gone from disk and has to be fetched again.
    pub(crate) async fn current_copy(
        &self,
        site_id: &str,
        entry: FileEntry,
        path: Option<&str>,
    ) -> Result<Option<FileEntry>> {
        let Ok(from) = self.local_path(site_id, &entry).await else {
            return Ok(None);
        };
        let Some(path) = path.filter(|p| *p != entry.path) else {
            return Ok(Some(entry));
        };

        let to = self.inner.fs.resolve(site_id, path)?;
        self.inner.fs.move_file(&from, &to).await?;
        let moved = FileEntry {
            path: path.to_string(),
            ..entry
        };
        self.site(site_id)?.files.put(&moved)?;
        tracing::debug!("Moved {} from {:?} to {}", moved.file_id, from, path);
        Ok(Some(moved))
    }

    /// Fetch a file into the pool and record it, sharing the transfer with
    /// any concurrent request for the same URL and destination.
    pub(crate) async fn download_for_pool(
        &self,
        site_id: &str,
        url: &str,
        options: &FileOptions,
        progress: Option<ProgressCallback>,
    ) -> Result<FileEntry> {
        let file_id = file_id_from_url(url);
        let path = self.destination(url, &file_id, options)?;
        let key = self.flight_key(site_id, url, &path);

        let this = self.clone();
        let site_id = site_id.to_string();
        let url = url.to_string();
        let options = options.clone();
        self.inner
            .file_flights
            .run(&key, move || async move {
                this.fetch_into_pool(&site_id, &url, file_id, path, &options, progress)
                    .await
            })
            .await
    }

    async fn fetch_into_pool(
        &self,
        site_id: &str,
        url: &str,
        file_id: String,
        path: String,
        options: &FileOptions,
        progress: Option<ProgressCallback>,
    ) -> Result<FileEntry> {
        let remote = self.fix_url(site_id, url)?;
        if !self.inner.fs.is_available() {
            return Err(FilepoolError::FilesystemUnavailable);
        }
        if !self.inner.network.is_online() {
            return Err(FilepoolError::Offline);
        }

        let dest = self.inner.fs.resolve(site_id, &path)?;
        if let Some(parent) = dest.parent() {
            self.inner.fs.create_dir(parent).await?;
        }

        tracing::info!("Downloading {} into {:?}", file_id, dest);
        let downloaded = self.inner.fetcher.download(&remote, &dest, progress).await?;

        if let Err(e) = apply_timemodified(&dest, options.timemodified) {
            tracing::warn!("Could not set modification time of {:?}: {}", dest, e);
        }
        let size = self.inner.fs.get_file_size(&dest).await?;
        if size != downloaded.size {
            tracing::warn!(
                "{} has {} bytes on disk, transfer reported {}",
                file_id,
                size,
                downloaded.size
            );
        }

        let entry = FileEntry {
            file_id,
            url: url.to_string(),
            revision: options.revision,
            timemodified: options.timemodified,
            stale: false,
            download_time: now_millis(),
            path,
            extension: extension_from_url(url),
            is_external_file: options.is_external_file,
            repository_type: options.repository_type.clone(),
        };
        self.site(site_id)?.files.put(&entry)?;
        tracing::info!(
            "Downloaded {} ({} bytes) for site {}",
            entry.file_id,
            size,
            site_id
        );
        Ok(entry)
    }

    /// Pool state of a remote file
    pub async fn get_file_state_by_url(
        &self,
        site_id: &str,
        url: &str,
        revision: i64,
        timemodified: i64,
    ) -> Result<FileState> {
        let file_id = file_id_from_url(url);
        let key = QueueKey::new(site_id, &file_id);
        let default_path = self.destination(url, &file_id, &FileOptions::default())?;
        if self.inner.queue.get(&key)?.is_some()
            || self
                .inner
                .file_flights
                .contains(&self.flight_key(site_id, url, &default_path))
        {
            return Ok(FileState::Downloading);
        }

        match self.site(site_id)?.files.get(&file_id)? {
            None => Ok(FileState::NotDownloaded),
            Some(entry) if is_outdated(&entry, revision, timemodified) => Ok(FileState::Outdated),
            Some(_) => Ok(FileState::Downloaded),
        }
    }

    pub fn get_file_entry(&self, site_id: &str, file_id: &str) -> Result<Option<FileEntry>> {
        self.site(site_id)?.files.get(file_id)
    }

    pub fn get_file_entry_by_url(&self, site_id: &str, url: &str) -> Result<Option<FileEntry>> {
        self.get_file_entry(site_id, &file_id_from_url(url))
    }

    /// Mark one file stale so the next read refetches it
    pub fn invalidate_file_by_url(&self, site_id: &str, url: &str) -> Result<bool> {
        let file_id = file_id_from_url(url);
        let changed = self.site(site_id)?.files.set_stale(&[file_id.clone()])?;
        tracing::debug!("Invalidated {} (found={})", file_id, changed > 0);
        Ok(changed > 0)
    }

    /// Mark every file of a site stale, or only those whose freshness
    /// cannot be judged from revision data.
    pub fn invalidate_all_files(&self, site_id: &str, only_unknown: bool) -> Result<usize> {
        let site = self.site(site_id)?;
        let changed = if only_unknown {
            let ids: Vec<String> = site
                .files
                .get_all()?
                .into_iter()
                .filter(is_update_unknown)
                .map(|e| e.file_id)
                .collect();
            site.files.set_stale(&ids)?
        } else {
            site.files.set_all_stale()?
        };
        tracing::info!("Invalidated {} files in site {}", changed, site_id);
        Ok(changed)
    }

    pub fn invalidate_files_by_component(
        &self,
        site_id: &str,
        component: &str,
        component_id: Option<&str>,
        only_unknown: bool,
    ) -> Result<usize> {
        let site = self.site(site_id)?;
        let mut ids = Vec::new();
        for file_id in site.links.get_file_ids_for_component(component, component_id)? {
            match site.files.get(&file_id)? {
                Some(entry) if !only_unknown || is_update_unknown(&entry) => ids.push(file_id),
                _ => {}
            }
        }
        let changed = site.files.set_stale(&ids)?;
        tracing::debug!(
            "Invalidated {} files of {}/{:?}",
            changed,
            component,
            component_id
        );
        Ok(changed)
    }

    /// Remove a file from the pool: entry, links, queue row and local copy.
    pub async fn remove_file_by_id(&self, site_id: &str, file_id: &str) -> Result<()> {
        let site = self.site(site_id)?;
        let entry = site.files.get(file_id)?;

        let key = QueueKey::new(site_id, file_id);
        if self.inner.queue.remove(&key)? {
            self.settle_waiters(&key, Err(FilepoolError::NotInPool(file_id.to_string())));
        }
        site.files.remove(file_id)?;
        site.links.remove_links_for_file(file_id)?;

        if let Some(entry) = entry {
            let path = self.inner.fs.resolve(site_id, &entry.path)?;
            if !self.inner.fs.remove_file(&path).await? {
                tracing::debug!("Local copy of {} was already gone", file_id);
            }
        }
        tracing::info!("Removed {} from site {}", file_id, site_id);
        Ok(())
    }

    pub async fn remove_file_by_url(&self, site_id: &str, url: &str) -> Result<()> {
        self.remove_file_by_id(site_id, &file_id_from_url(url))
            .await
    }

    /// Remove every file linked to a component. Returns how many were removed.
    pub async fn remove_files_by_component(
        &self,
        site_id: &str,
        component: &str,
        component_id: Option<&str>,
    ) -> Result<usize> {
        let file_ids = self
            .site(site_id)?
            .links
            .get_file_ids_for_component(component, component_id)?;
        for file_id in &file_ids {
            self.remove_file_by_id(site_id, file_id).await?;
        }
        Ok(file_ids.len())
    }

    pub fn add_file_link(
        &self,
        site_id: &str,
        file_id: &str,
        component: &str,
        component_id: Option<&str>,
    ) -> Result<()> {
        self.add_file_links(site_id, file_id, &[ComponentLink::new(component, component_id)])
    }

    pub fn add_file_link_by_url(
        &self,
        site_id: &str,
        url: &str,
        component: &str,
        component_id: Option<&str>,
    ) -> Result<()> {
        self.add_file_link(site_id, &file_id_from_url(url), component, component_id)
    }

    pub fn add_file_links(&self, site_id: &str, file_id: &str, links: &[ComponentLink]) -> Result<()> {
        self.site(site_id)?.links.add_links(file_id, links)
    }

    pub fn get_file_links(&self, site_id: &str, file_id: &str) -> Result<Vec<ComponentLink>> {
        self.site(site_id)?.links.get_links_for_file(file_id)
    }

    /// Pooled files linked to a component
    pub fn get_files_by_component(
        &self,
        site_id: &str,
        component: &str,
        component_id: Option<&str>,
    ) -> Result<Vec<FileEntry>> {
        let site = self.site(site_id)?;
        let mut files = Vec::new();
        for file_id in site.links.get_file_ids_for_component(component, component_id)? {
            if let Some(entry) = site.files.get(&file_id)? {
                files.push(entry);
            }
        }
        Ok(files)
    }
}
