//! Packages: the file set of one component instance, downloaded or
//! prefetched as a unit, with a persisted status that rolls back on failure.

use super::engine::{FileOptions, Filepool};
use super::events::FilepoolEvent;
use super::file_id::{extension_from_url, file_id_from_url, package_id};
use super::http_client::{ProgressCallback, TransferProgress};
use super::status::{determine_packages_status, is_outdated, revision_from_files, PackageStatus};
use crate::error::{FilepoolError, Result};
use crate::file::naming::{check_relative_path, guess_filename_from_url};
use crate::store::now_millis;
use crate::store::packages::PackageEntry;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

/// One file of a package
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageFile {
    pub url: String,
    /// Path inside the package directory
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub timemodified: i64,
    #[serde(default)]
    pub revision: i64,
}

impl PackageFile {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Self::default()
        }
    }

    /// Path inside a package directory; guessed from the URL when unset
    fn relative_path(&self) -> String {
        if let Some(path) = &self.path {
            return path.trim_start_matches('/').to_string();
        }
        let name = guess_filename_from_url(&self.url);
        match extension_from_url(&self.url) {
            Some(ext) => format!("{}.{}", name, ext),
            None => name,
        }
    }
}

/// Everything needed to download a package
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackageRequest {
    pub component: String,
    #[serde(default)]
    pub component_id: Option<String>,
    pub files: Vec<PackageFile>,
    /// Opaque payload stored with the downloaded status
    #[serde(default)]
    pub extra: Option<String>,
    /// Site-relative directory receiving the files instead of the pool folder
    #[serde(default)]
    pub dir_path: Option<String>,
}

impl PackageRequest {
    pub fn new(component: impl Into<String>, component_id: Option<&str>) -> Self {
        Self {
            component: component.into(),
            component_id: component_id.map(str::to_string),
            ..Self::default()
        }
    }

    pub fn with_files(mut self, files: Vec<PackageFile>) -> Self {
        self.files = files;
        self
    }

    pub fn id(&self) -> String {
        package_id(&self.component, self.component_id.as_deref())
    }

    fn destination(&self, file: &PackageFile) -> Option<String> {
        match &self.dir_path {
            Some(dir) => Some(format!(
                "{}/{}",
                dir.trim_end_matches('/'),
                file.relative_path()
            )),
            None => file.path.clone(),
        }
    }
}

/// Cumulative progress of a package download
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PackageProgress {
    pub files_done: usize,
    pub total_files: usize,
    /// Bytes received across all files
    pub loaded: u64,
}

pub type PackageProgressCallback = Arc<dyn Fn(PackageProgress) + Send + Sync>;

/// Bytes still to fetch for a set of files
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DownloadSize {
    pub size: u64,
    /// False when the server did not report the size of some file
    pub total: bool,
}

impl Filepool {
    /// Download every file of a package now
    pub async fn download_package(
        &self,
        site_id: &str,
        request: &PackageRequest,
        progress: Option<PackageProgressCallback>,
    ) -> Result<()> {
        self.download_or_prefetch_package(site_id, request, false, progress)
            .await
    }

    /// Queue every file of a package and wait until the queue delivered them
    pub async fn prefetch_package(
        &self,
        site_id: &str,
        request: &PackageRequest,
        progress: Option<PackageProgressCallback>,
    ) -> Result<()> {
        self.download_or_prefetch_package(site_id, request, true, progress)
            .await
    }

    async fn download_or_prefetch_package(
        &self,
        site_id: &str,
        request: &PackageRequest,
        prefetch: bool,
        progress: Option<PackageProgressCallback>,
    ) -> Result<()> {
        if request.component.is_empty() {
            return Err(FilepoolError::InvalidPackage(
                "component must not be empty".to_string(),
            ));
        }
        if let Some(file) = request.files.iter().find(|f| f.url.is_empty()) {
            return Err(FilepoolError::InvalidPackage(format!(
                "file without URL ({:?})",
                file.path
            )));
        }
        for path in request.files.iter().filter_map(|f| request.destination(f)) {
            check_relative_path(&path)?;
        }

        let key = format!("{}:{}", site_id, request.id());
        let pool = self.clone();
        let site_id = site_id.to_string();
        let request = request.clone();
        self.inner
            .package_flights
            .run(&key, move || async move {
                pool.run_package(&site_id, &request, prefetch, progress)
                    .await
            })
            .await
    }

    async fn run_package(
        &self,
        site_id: &str,
        request: &PackageRequest,
        prefetch: bool,
        progress: Option<PackageProgressCallback>,
    ) -> Result<()> {
        let component = request.component.as_str();
        let component_id = request.component_id.as_deref();
        self.store_package_status(site_id, PackageStatus::Downloading, component, component_id, None)?;

        tracing::info!(
            "{} package {}/{:?} ({} files)",
            if prefetch { "Prefetching" } else { "Downloading" },
            component,
            component_id,
            request.files.len()
        );

        let revision = revision_from_files(request.files.iter().map(|f| &f.revision));
        let total_files = request.files.len();
        let files_done = Arc::new(AtomicUsize::new(0));
        let loaded = Arc::new(AtomicU64::new(0));

        let transfers: Vec<_> = request.files.iter().map(|file| {
            let options = FileOptions {
                component: Some(component.to_string()),
                component_id: component_id.map(str::to_string),
                revision,
                timemodified: file.timemodified,
                path: request.destination(file),
                ..FileOptions::default()
            };
            let file_progress = progress.as_ref().map(|callback| {
                let callback = callback.clone();
                let last = Arc::new(AtomicU64::new(0));
                let loaded = loaded.clone();
                let files_done = files_done.clone();
                Arc::new(move |p: TransferProgress| {
                    let delta = p.loaded.saturating_sub(last.swap(p.loaded, Ordering::SeqCst));
                    let sum = loaded.fetch_add(delta, Ordering::SeqCst) + delta;
                    callback(PackageProgress {
                        files_done: files_done.load(Ordering::SeqCst),
                        total_files,
                        loaded: sum,
                    });
                }) as ProgressCallback
            });
            let files_done = files_done.clone();
            let loaded = loaded.clone();
            let progress = progress.clone();

            async move {
                let result = if prefetch {
                    match self.add_to_queue_by_url(site_id, &file.url, &options) {
                        Ok(handle) => handle.wait().await,
                        Err(e) => Err(e),
                    }
                } else {
                    self.download_url(site_id, &file.url, &options, file_progress)
                        .await
                        .map(|_| ())
                };
                if result.is_ok() {
                    let done = files_done.fetch_add(1, Ordering::SeqCst) + 1;
                    if let Some(callback) = &progress {
                        callback(PackageProgress {
                            files_done: done,
                            total_files,
                            loaded: loaded.load(Ordering::SeqCst),
                        });
                    }
                }
                result
            }
        }).collect();

        let results = join_all(transfers).await;
        match results.into_iter().find_map(Result::err) {
            None => {
                self.store_package_status(
                    site_id,
                    PackageStatus::Downloaded,
                    component,
                    component_id,
                    request.extra.as_deref(),
                )?;
                Ok(())
            }
            Some(error) => {
                tracing::warn!(
                    "Package {}/{:?} failed, restoring previous status: {}",
                    component,
                    component_id,
                    error
                );
                if let Err(rollback) = self.set_package_previous_status(site_id, component, component_id) {
                    tracing::error!("Failed to restore package status: {}", rollback);
                }
                Err(error)
            }
        }
    }

    /// Persist a package status transition.
    ///
    /// Entering `Downloading` stamps a new download time and keeps the old
    /// one as the previous download time. The old status becomes `previous`
    /// and `extra` is kept unless a new one is given. Writing the status a
    /// package already has is a no-op.
    pub fn store_package_status(
        &self,
        site_id: &str,
        status: PackageStatus,
        component: &str,
        component_id: Option<&str>,
        extra: Option<&str>,
    ) -> Result<PackageEntry> {
        let site = self.site(site_id)?;
        let id = package_id(component, component_id);
        let existing = site.packages.get(&id)?;

        if let Some(current) = &existing {
            if current.status == status {
                tracing::trace!("Package {} already {}", id, status);
                return Ok(current.clone());
            }
        }

        let (download_time, previous_download_time) = match (&existing, status) {
            (_, PackageStatus::Downloading) => (
                now_millis(),
                existing.as_ref().map(|e| e.download_time).unwrap_or(0),
            ),
            (Some(e), _) => (e.download_time, e.previous_download_time),
            (None, _) => (0, 0),
        };

        let entry = PackageEntry {
            id,
            component: component.to_string(),
            component_id: component_id.map(str::to_string),
            status,
            previous: existing.as_ref().map(|e| e.status),
            updated: now_millis(),
            download_time,
            previous_download_time,
            extra: extra
                .map(str::to_string)
                .or_else(|| existing.as_ref().and_then(|e| e.extra.clone())),
        };
        site.packages.put(&entry)?;

        tracing::info!(
            "Package {}/{:?} is now {} (was {:?})",
            component,
            component_id,
            status,
            entry.previous
        );
        self.emit(FilepoolEvent::PackageStatusChanged {
            site_id: site_id.to_string(),
            component: component.to_string(),
            component_id: component_id.map(str::to_string),
            status,
        });
        Ok(entry)
    }

    /// Roll a package back to its status and download time before the
    /// latest transition.
    pub fn set_package_previous_status(
        &self,
        site_id: &str,
        component: &str,
        component_id: Option<&str>,
    ) -> Result<PackageStatus> {
        let site = self.site(site_id)?;
        let id = package_id(component, component_id);
        let Some(mut entry) = site.packages.get(&id)? else {
            return Err(FilepoolError::InvalidPackage(format!(
                "no status stored for {}/{:?}",
                component, component_id
            )));
        };

        let restored = match entry.previous {
            Some(PackageStatus::Downloading) | None => PackageStatus::NotDownloaded,
            Some(previous) => previous,
        };
        entry.status = restored;
        entry.updated = now_millis();
        entry.download_time = entry.previous_download_time;
        site.packages.put(&entry)?;

        tracing::info!("Package {}/{:?} restored to {}", component, component_id, restored);
        self.emit(FilepoolEvent::PackageStatusChanged {
            site_id: site_id.to_string(),
            component: component.to_string(),
            component_id: component_id.map(str::to_string),
            status: restored,
        });
        Ok(restored)
    }

    pub fn get_package_entry(
        &self,
        site_id: &str,
        component: &str,
        component_id: Option<&str>,
    ) -> Result<Option<PackageEntry>> {
        self.site(site_id)?
            .packages
            .get(&package_id(component, component_id))
    }

    /// Status of a package; unknown packages are not downloaded
    pub fn get_package_status(
        &self,
        site_id: &str,
        component: &str,
        component_id: Option<&str>,
    ) -> Result<PackageStatus> {
        Ok(self
            .get_package_entry(site_id, component, component_id)?
            .map(|e| e.status)
            .unwrap_or(PackageStatus::NotDownloaded))
    }

    pub fn get_package_extra(
        &self,
        site_id: &str,
        component: &str,
        component_id: Option<&str>,
    ) -> Result<Option<String>> {
        Ok(self
            .get_package_entry(site_id, component, component_id)?
            .and_then(|e| e.extra))
    }

    /// Epoch milliseconds of the last completed download, 0 when never
    pub fn get_package_download_time(
        &self,
        site_id: &str,
        component: &str,
        component_id: Option<&str>,
    ) -> Result<i64> {
        Ok(self
            .get_package_entry(site_id, component, component_id)?
            .map(|e| match e.status {
                PackageStatus::Downloading => e.previous_download_time,
                _ => e.download_time,
            })
            .unwrap_or(0))
    }

    /// Single status summarising several packages
    pub fn get_packages_status(
        &self,
        site_id: &str,
        packages: &[(&str, Option<&str>)],
    ) -> Result<PackageStatus> {
        let statuses = packages
            .iter()
            .map(|(component, component_id)| {
                self.get_package_status(site_id, component, *component_id)
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(determine_packages_status(statuses))
    }

    /// Mark a downloaded package outdated. Returns whether it changed.
    pub fn set_package_status_outdated_if_downloaded(
        &self,
        site_id: &str,
        component: &str,
        component_id: Option<&str>,
    ) -> Result<bool> {
        if self.get_package_status(site_id, component, component_id)? != PackageStatus::Downloaded {
            return Ok(false);
        }
        self.store_package_status(site_id, PackageStatus::Outdated, component, component_id, None)?;
        Ok(true)
    }

    /// Whether a download of the package is in flight in this process
    pub fn is_package_downloading(
        &self,
        site_id: &str,
        component: &str,
        component_id: Option<&str>,
    ) -> bool {
        let key = format!("{}:{}", site_id, package_id(component, component_id));
        self.inner.package_flights.contains(&key)
    }

    /// Packages left `Downloading` by an interrupted run go back to their
    /// previous status. Returns how many were restored.
    pub fn restore_package_status(&self, site_id: &str) -> Result<usize> {
        let site = self.site(site_id)?;
        let mut restored = 0;
        for entry in site.packages.get_by_status(PackageStatus::Downloading)? {
            let component_id = entry.component_id.as_deref();
            if self.is_package_downloading(site_id, &entry.component, component_id) {
                continue;
            }
            self.set_package_previous_status(site_id, &entry.component, component_id)?;
            restored += 1;
        }
        if restored > 0 {
            tracing::info!("Restored {} interrupted packages in site {}", restored, site_id);
        }
        Ok(restored)
    }

    /// Forget every package status of a site
    pub fn clear_all_packages_status(&self, site_id: &str) -> Result<usize> {
        let site = self.site(site_id)?;
        let entries = site.packages.get_all()?;
        site.packages.clear()?;
        for entry in &entries {
            self.emit(FilepoolEvent::PackageStatusChanged {
                site_id: site_id.to_string(),
                component: entry.component.clone(),
                component_id: entry.component_id.clone(),
                status: PackageStatus::NotDownloaded,
            });
        }
        tracing::info!("Cleared {} package statuses in site {}", entries.len(), site_id);
        Ok(entries.len())
    }

    /// Mark the package's files stale and the package outdated
    pub fn invalidate_package(
        &self,
        site_id: &str,
        component: &str,
        component_id: Option<&str>,
    ) -> Result<()> {
        self.invalidate_files_by_component(site_id, component, component_id, false)?;
        self.set_package_status_outdated_if_downloaded(site_id, component, component_id)?;
        Ok(())
    }

    /// Estimate what downloading `files` would transfer.
    ///
    /// Files with a current local copy count as zero; the rest are sized
    /// with a HEAD request.
    pub async fn get_files_download_size(
        &self,
        site_id: &str,
        files: &[PackageFile],
    ) -> Result<DownloadSize> {
        if !self.inner.network.is_online() {
            return Err(FilepoolError::Offline);
        }
        let site = self.site(site_id)?;
        let mut estimate = DownloadSize {
            size: 0,
            total: true,
        };

        for file in files {
            if let Some(entry) = site.files.get(&file_id_from_url(&file.url))? {
                if !is_outdated(&entry, file.revision, file.timemodified)
                    && self.local_path(site_id, &entry).await.is_ok()
                {
                    continue;
                }
            }

            let remote = self.fix_url(site_id, &file.url)?;
            match self.inner.fetcher.head(&remote).await {
                Ok(info) => match info.content_length {
                    Some(length) => estimate.size += length,
                    None => estimate.total = false,
                },
                Err(e) => {
                    tracing::debug!("No size for {}: {}", file.url, e);
                    estimate.total = false;
                }
            }
        }
        Ok(estimate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relative_path_guess() {
        let file = PackageFile::new("https://lms.test/pluginfile.php/1/mod_book/chapter/2/intro.html");
        assert_eq!(file.relative_path(), "intro.html");

        let explicit = PackageFile {
            path: Some("/images/a.png".into()),
            ..PackageFile::new("https://lms.test/x")
        };
        assert_eq!(explicit.relative_path(), "images/a.png");
    }

    #[test]
    fn test_destination_with_dir() {
        let request = PackageRequest {
            dir_path: Some("mod_book/12/".into()),
            ..PackageRequest::new("mod_book", Some("12"))
        };
        let file = PackageFile {
            path: Some("index.html".into()),
            ..PackageFile::new("https://lms.test/index.html")
        };
        assert_eq!(
            request.destination(&file).as_deref(),
            Some("mod_book/12/index.html")
        );

        let pooled = PackageRequest::new("mod_book", Some("12"));
        assert_eq!(pooled.destination(&PackageFile::new("https://lms.test/a.pdf")), None);
    }

    #[test]
    fn test_request_id_matches_package_id() {
        let request = PackageRequest::new("mod_page", Some("3"));
        assert_eq!(request.id(), package_id("mod_page", Some("3")));
    }
}
