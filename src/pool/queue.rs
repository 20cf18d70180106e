//! Persistent download queue: enqueue/merge, one-at-a-time processing and
//! the Running/Paused loop.

use super::engine::{FileOptions, Filepool};
use super::events::FilepoolEvent;
use super::file_id::file_id_from_url;
use super::http_client::{ProgressCallback, TransferProgress};
use super::package::PackageFile;
use super::status::is_outdated;
use super::transfer::FailureDisposition;
use crate::error::{FilepoolError, Result};
use crate::file::naming::{check_relative_path, check_site_id};
use crate::store::now_millis;
use crate::store::queue::{clamp_priority, QueueEntry, QueueKey};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueState {
    Running,
    Paused,
}

impl std::fmt::Display for QueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => f.write_str("running"),
            Self::Paused => f.write_str("paused"),
        }
    }
}

/// Why the queue cannot make progress right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PauseReason {
    FilesystemUnavailable,
    Offline,
    /// Online, but the queue is restricted to wifi
    NotOnWifi,
}

/// What one `process_next` call did
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// Nothing queued
    Empty,
    Paused(PauseReason),
    /// The item was transferred and removed from the queue
    Downloaded(QueueKey),
    /// A current local copy already existed; the item was removed
    AlreadyCurrent(QueueKey),
    /// Permanent failure; the item was removed and its waiters rejected
    Dropped { key: QueueKey, error: FilepoolError },
    /// Transient failure; the item stays queued and its waiters keep waiting
    Retained { key: QueueKey, error: FilepoolError },
}

/// Pending completion senders, per queued file
#[derive(Default)]
pub(crate) struct Waiters {
    pending: Mutex<HashMap<QueueKey, Vec<oneshot::Sender<Result<()>>>>>,
}

impl Waiters {
    fn register(&self, key: QueueKey) -> oneshot::Receiver<Result<()>> {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(key)
            .or_default()
            .push(tx);
        rx
    }

    fn settle(&self, key: &QueueKey, result: Result<()>) -> usize {
        let senders = self
            .pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(key)
            .unwrap_or_default();
        let count = senders.len();
        for tx in senders {
            // Receiver may have stopped waiting
            let _ = tx.send(result.clone());
        }
        count
    }
}

/// Completion of a queued file
pub struct QueueHandle {
    key: QueueKey,
    rx: oneshot::Receiver<Result<()>>,
}

impl QueueHandle {
    pub fn key(&self) -> &QueueKey {
        &self.key
    }

    /// Wait until the file is downloaded or dropped from the queue
    pub async fn wait(self) -> Result<()> {
        self.rx.await.unwrap_or(Err(FilepoolError::QueueClosed))
    }
}

/// Background tasks driving the queue
pub struct QueueWorker {
    pool: Filepool,
    processor: JoinHandle<()>,
    connectivity: JoinHandle<()>,
}

impl QueueWorker {
    /// Stop processing. Items stay queued for the next start.
    pub fn stop(self) {
        self.processor.abort();
        self.connectivity.abort();
        self.pool.inner.queue_started.store(false, Ordering::SeqCst);
        self.pool.set_queue_state(QueueState::Paused);
    }
}

fn disposition(error: &FilepoolError) -> FailureDisposition {
    match error {
        FilepoolError::Transfer(e) => e.disposition(),
        FilepoolError::Offline | FilepoolError::FilesystemUnavailable => {
            FailureDisposition::Retain
        }
        _ => FailureDisposition::Drop,
    }
}

fn options_for(item: &QueueEntry) -> FileOptions {
    FileOptions {
        revision: item.revision,
        timemodified: item.timemodified,
        path: item.path.clone(),
        priority: Some(item.priority),
        is_external_file: item.is_external_file,
        repository_type: item.repository_type.clone(),
        ..FileOptions::default()
    }
}

impl Filepool {
    /// Queue a file for download.
    ///
    /// A second request for a file already queued is merged into the
    /// existing entry. The handle resolves when the file is downloaded.
    pub fn add_to_queue_by_url(
        &self,
        site_id: &str,
        url: &str,
        options: &FileOptions,
    ) -> Result<QueueHandle> {
        if !self.inner.fs.is_available() {
            return Err(FilepoolError::FilesystemUnavailable);
        }
        self.fix_url(site_id, url)?;
        check_site_id(site_id)?;
        if let Some(path) = &options.path {
            check_relative_path(path)?;
        }

        let priority = clamp_priority(
            options
                .priority
                .unwrap_or(self.inner.queue_config.default_priority),
        );
        let entry = QueueEntry {
            site_id: site_id.to_string(),
            file_id: file_id_from_url(url),
            url: url.to_string(),
            priority,
            revision: options.revision,
            timemodified: options.timemodified,
            path: options.path.clone(),
            is_external_file: options.is_external_file,
            repository_type: options.repository_type.clone(),
            links: options.links(),
            added: now_millis(),
        };

        let (stored, existed) = self.inner.queue.upsert(&entry)?;
        let key = stored.key();
        if existed {
            tracing::debug!(
                "Merged request for {} into queued entry (priority {})",
                key,
                stored.priority
            );
        } else {
            tracing::info!("Queued {} with priority {}", key, stored.priority);
        }

        let rx = self.inner.waiters.register(key.clone());
        self.check_queue_processing();
        Ok(QueueHandle { key, rx })
    }

    /// Queue several files for one component
    pub fn add_files_to_queue(
        &self,
        site_id: &str,
        files: &[PackageFile],
        component: Option<&str>,
        component_id: Option<&str>,
    ) -> Result<Vec<QueueHandle>> {
        files
            .iter()
            .map(|file| {
                let options = FileOptions {
                    component: component.map(str::to_string),
                    component_id: component_id.map(str::to_string),
                    revision: file.revision,
                    timemodified: file.timemodified,
                    path: file.path.clone(),
                    ..FileOptions::default()
                };
                self.add_to_queue_by_url(site_id, &file.url, &options)
            })
            .collect()
    }

    /// Queued items in the order they will be processed
    pub fn get_queue_entries(&self) -> Result<Vec<QueueEntry>> {
        self.inner.queue.get_all()
    }

    pub fn queue_state(&self) -> QueueState {
        *self
            .inner
            .queue_state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub(crate) fn set_queue_state(&self, state: QueueState) {
        let changed = {
            let mut current = self
                .inner
                .queue_state
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let changed = *current != state;
            *current = state;
            changed
        };
        if changed {
            tracing::debug!("Queue is now {}", state);
            self.emit(FilepoolEvent::QueueStateChanged(state));
        }
    }

    /// Resolve or reject everyone waiting on a queued file
    pub(crate) fn settle_waiters(&self, key: &QueueKey, result: Result<()>) {
        let count = self.inner.waiters.settle(key, result);
        if count > 0 {
            tracing::trace!("Settled {} waiters for {}", count, key);
        }
    }

    fn wifi_required(&self) -> bool {
        self.inner.queue_config.wifi_only && !self.inner.network.is_wifi()
    }

    /// Wake the loop when resources allow processing
    pub fn check_queue_processing(&self) {
        if !self.inner.fs.is_available() || !self.inner.network.is_online() || self.wifi_required()
        {
            tracing::trace!("Queue stays paused: resources unavailable");
            return;
        }
        self.inner.queue_wake.notify_one();
    }

    fn queue_progress(&self, key: &QueueKey) -> ProgressCallback {
        let pool = self.clone();
        let key = key.clone();
        Arc::new(move |progress: TransferProgress| {
            pool.emit(FilepoolEvent::QueueProgress {
                site_id: key.site_id.clone(),
                file_id: key.file_id.clone(),
                loaded: progress.loaded,
                total: progress.total,
            });
        })
    }

    /// Take the highest-priority item and settle it.
    pub async fn process_next(&self) -> Result<ProcessOutcome> {
        if !self.inner.fs.is_available() {
            return Ok(ProcessOutcome::Paused(PauseReason::FilesystemUnavailable));
        }
        if !self.inner.network.is_online() {
            return Ok(ProcessOutcome::Paused(PauseReason::Offline));
        }
        if self.wifi_required() {
            return Ok(ProcessOutcome::Paused(PauseReason::NotOnWifi));
        }
        let Some(item) = self.inner.queue.peek_next()? else {
            return Ok(ProcessOutcome::Empty);
        };

        let key = item.key();
        let site = self.site(&item.site_id)?;

        if !item.is_external_file {
            if let Some(existing) = site.files.get(&item.file_id)? {
                if !is_outdated(&existing, item.revision, item.timemodified)
                    && matches!(
                        self.current_copy(&item.site_id, existing, item.path.as_deref())
                            .await,
                        Ok(Some(_))
                    )
                {
                    tracing::debug!("{} is already current, skipping download", key);
                    site.links.add_links(&item.file_id, &item.links)?;
                    self.inner.queue.remove(&key)?;
                    self.settle_waiters(&key, Ok(()));
                    self.emit(FilepoolEvent::FileDownloaded {
                        site_id: item.site_id.clone(),
                        file_id: item.file_id.clone(),
                    });
                    return Ok(ProcessOutcome::AlreadyCurrent(key));
                }
            }
        }

        self.emit(FilepoolEvent::FileDownloading {
            site_id: item.site_id.clone(),
            file_id: item.file_id.clone(),
        });

        let progress = self.queue_progress(&key);
        let result = self
            .download_for_pool(&item.site_id, &item.url, &options_for(&item), Some(progress))
            .await;

        match result {
            Ok(_) => {
                // Links merged in while the transfer ran are applied too
                let links = match self.inner.queue.get(&key)? {
                    Some(latest) => latest.links,
                    None => item.links.clone(),
                };
                site.links.add_links(&item.file_id, &links)?;
                self.inner.queue.remove(&key)?;
                self.settle_waiters(&key, Ok(()));
                self.emit(FilepoolEvent::FileDownloaded {
                    site_id: item.site_id.clone(),
                    file_id: item.file_id.clone(),
                });
                Ok(ProcessOutcome::Downloaded(key))
            }
            Err(error) => match disposition(&error) {
                FailureDisposition::Drop => {
                    tracing::warn!("Dropping {} from the queue: {}", key, error);
                    self.inner.queue.remove(&key)?;
                    self.settle_waiters(&key, Err(error.clone()));
                    self.emit(FilepoolEvent::FileDownloadFailed {
                        site_id: item.site_id.clone(),
                        file_id: item.file_id.clone(),
                        error: error.clone(),
                        dropped: true,
                    });
                    Ok(ProcessOutcome::Dropped { key, error })
                }
                FailureDisposition::Retain => {
                    tracing::warn!("Keeping {} queued after transient failure: {}", key, error);
                    self.emit(FilepoolEvent::FileDownloadFailed {
                        site_id: item.site_id.clone(),
                        file_id: item.file_id.clone(),
                        error: error.clone(),
                        dropped: false,
                    });
                    Ok(ProcessOutcome::Retained { key, error })
                }
            },
        }
    }

    /// Start the processing loop and the connectivity listener.
    ///
    /// Returns `None` when the loop is already running.
    pub fn start_queue(&self) -> Option<QueueWorker> {
        if self
            .inner
            .queue_started
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return None;
        }

        let processor = tokio::spawn(self.clone().run_queue());

        let pool = self.clone();
        let mut online = self.inner.network.subscribe();
        let connectivity = tokio::spawn(async move {
            while online.changed().await.is_ok() {
                let is_online = *online.borrow_and_update();
                if is_online {
                    tracing::info!("Connectivity restored, resuming queue");
                    pool.check_queue_processing();
                }
            }
        });

        tracing::info!("Queue processing started");
        Some(QueueWorker {
            pool: self.clone(),
            processor,
            connectivity,
        })
    }

    async fn run_queue(self) {
        let interval = self.inner.queue_config.process_interval();
        self.set_queue_state(QueueState::Running);
        loop {
            match self.process_next().await {
                Ok(ProcessOutcome::Empty) => {
                    tracing::debug!("Queue empty");
                    self.pause_until_woken().await;
                }
                Ok(ProcessOutcome::Paused(reason)) => {
                    tracing::info!("Queue paused: {:?}", reason);
                    self.pause_until_woken().await;
                }
                Ok(_) => tokio::time::sleep(interval).await,
                Err(e) => {
                    tracing::error!("Queue processing failed: {}", e);
                    tokio::time::sleep(interval).await;
                }
            }
        }
    }

    async fn pause_until_woken(&self) {
        self.set_queue_state(QueueState::Paused);
        self.inner.queue_wake.notified().await;
        self.set_queue_state(QueueState::Running);
    }
}
