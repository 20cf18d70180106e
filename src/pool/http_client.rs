use super::transfer::TransferError;
use crate::app::config::NetworkConfig;
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::header::{HeaderMap, CONTENT_LENGTH, CONTENT_TYPE};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};

/// Bytes transferred so far for one file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProgress {
    pub loaded: u64,
    pub total: Option<u64>,
}

/// Progress callback for transfers
pub type ProgressCallback = Arc<dyn Fn(TransferProgress) + Send + Sync>;

/// Result of a completed transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadedFile {
    pub path: PathBuf,
    pub size: u64,
    pub content_type: Option<String>,
}

/// Metadata answered by a HEAD request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFileInfo {
    pub content_length: Option<u64>,
    pub content_type: Option<String>,
}

/// Performs the network side of a download
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    /// Fetch `url` into `dest`, replacing any existing file only on success.
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: Option<ProgressCallback>,
    ) -> Result<DownloadedFile, TransferError>;

    async fn head(&self, url: &str) -> Result<RemoteFileInfo, TransferError>;
}

fn parse_length(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
}

fn parse_content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Sibling path the body is streamed into before the final rename
fn partial_path(dest: &Path) -> PathBuf {
    let mut name = dest.file_name().map(OsString::from).unwrap_or_default();
    name.push(".part");
    dest.with_file_name(name)
}

/// reqwest-backed fetcher
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: &NetworkConfig) -> Result<Self, TransferError> {
        let client = reqwest::Client::builder()
            .user_agent(config.user_agent.as_str())
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .connect_timeout(std::time::Duration::from_secs(config.connect_timeout_secs))
            .pool_max_idle_per_host(10)
            .build()
            .map_err(|e| TransferError::from_reqwest(&e))?;

        Ok(Self { client })
    }

    async fn stream_to_file(
        &self,
        response: reqwest::Response,
        part: &Path,
        progress: Option<&ProgressCallback>,
    ) -> Result<u64, TransferError> {
        let total = parse_length(response.headers());
        let file = File::create(part)
            .await
            .map_err(|e| TransferError::from_io(&e))?;
        let mut file = BufWriter::with_capacity(64 * 1024, file);

        let mut stream = response.bytes_stream();
        let mut loaded = 0u64;
        let mut last_update = std::time::Instant::now();
        let mut last_bytes = 0u64;

        const MIN_PROGRESS_BYTES: u64 = 256 * 1024;
        const MIN_PROGRESS_INTERVAL: std::time::Duration = std::time::Duration::from_millis(250);

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| TransferError::Aborted(e.to_string()))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| TransferError::from_io(&e))?;
            loaded += chunk.len() as u64;

            if let Some(callback) = progress {
                let now = std::time::Instant::now();
                if loaded - last_bytes >= MIN_PROGRESS_BYTES
                    || now.duration_since(last_update) >= MIN_PROGRESS_INTERVAL
                {
                    callback(TransferProgress { loaded, total });
                    last_bytes = loaded;
                    last_update = now;
                }
            }
        }

        file.flush().await.map_err(|e| TransferError::from_io(&e))?;

        if let Some(expected) = total {
            if loaded < expected {
                return Err(TransferError::Aborted(format!(
                    "received {} of {} bytes",
                    loaded, expected
                )));
            }
        }
        if let Some(callback) = progress {
            callback(TransferProgress { loaded, total });
        }
        Ok(loaded)
    }
}

#[async_trait]
impl RemoteFetcher for HttpFetcher {
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: Option<ProgressCallback>,
    ) -> Result<DownloadedFile, TransferError> {
        tracing::trace!("Starting download: url={}, dest={:?}", url, dest);

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| TransferError::from_reqwest(&e))?;
        let status = response.status().as_u16();
        tracing::trace!("Received response with status: {}", status);
        if !response.status().is_success() {
            return Err(TransferError::from_status(status));
        }
        let content_type = parse_content_type(response.headers());

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| TransferError::from_io(&e))?;
        }
        let part = partial_path(dest);
        let size = match self.stream_to_file(response, &part, progress.as_ref()).await {
            Ok(size) => size,
            Err(e) => {
                let _ = tokio::fs::remove_file(&part).await;
                return Err(e);
            }
        };
        tokio::fs::rename(&part, dest)
            .await
            .map_err(|e| TransferError::from_io(&e))?;

        Ok(DownloadedFile {
            path: dest.to_path_buf(),
            size,
            content_type,
        })
    }

    async fn head(&self, url: &str) -> Result<RemoteFileInfo, TransferError> {
        let response = self
            .client
            .head(url)
            .send()
            .await
            .map_err(|e| TransferError::from_reqwest(&e))?;
        if !response.status().is_success() {
            return Err(TransferError::from_status(response.status().as_u16()));
        }
        Ok(RemoteFileInfo {
            content_length: parse_length(response.headers()),
            content_type: parse_content_type(response.headers()),
        })
    }
}
