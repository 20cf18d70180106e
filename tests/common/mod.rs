#![allow(dead_code)]

use async_trait::async_trait;
use filepool::app::config::{Config, NetworkConfig, QueueConfig, StorageConfig};
use filepool::pool::fs::LocalFileSystem;
use filepool::pool::http_client::{
    DownloadedFile, ProgressCallback, RemoteFetcher, RemoteFileInfo, TransferProgress,
};
use filepool::pool::network::NetworkMonitor;
use filepool::pool::transfer::TransferError;
use filepool::pool::Filepool;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

pub const SITE: &str = "site-a";

/// Plugin-file URL of a module resource
pub fn resource_url(name: &str) -> String {
    format!(
        "https://lms.test/pluginfile.php/27/mod_resource/content/1/{}",
        name
    )
}

/// Setup a mock server for a specific file path with custom content
pub async fn setup_mock_file_server(file_path: &str, content: Vec<u8>) -> (MockServer, String) {
    let server = MockServer::start().await;
    let uri = server.uri();

    let content_length = content.len();

    Mock::given(method("HEAD"))
        .and(path(file_path))
        .respond_with(
            ResponseTemplate::new(200)
                .append_header("Content-Length", content_length.to_string().as_str()),
        )
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path(file_path))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(content))
        .mount(&server)
        .await;

    (server, uri)
}

/// Fetcher answering from a script instead of the network.
///
/// Every URL succeeds with `body` unless a failure was scripted for it.
pub struct ScriptedFetcher {
    body: Vec<u8>,
    delay: Duration,
    calls: AtomicUsize,
    requested: Mutex<Vec<String>>,
    failures: Mutex<HashMap<String, TransferError>>,
}

impl ScriptedFetcher {
    pub fn new() -> Self {
        Self {
            body: b"file content".to_vec(),
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            requested: Mutex::new(Vec::new()),
            failures: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_body(mut self, body: &[u8]) -> Self {
        self.body = body.to_vec();
        self
    }

    /// Make every transfer of `url` fail with `error` until cleared
    pub fn fail(&self, url: &str, error: TransferError) {
        self.failures.lock().unwrap().insert(url.to_string(), error);
    }

    pub fn clear_failure(&self, url: &str) {
        self.failures.lock().unwrap().remove(url);
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// URLs in the order they were requested
    pub fn requested(&self) -> Vec<String> {
        self.requested.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteFetcher for ScriptedFetcher {
    async fn download(
        &self,
        url: &str,
        dest: &Path,
        progress: Option<ProgressCallback>,
    ) -> Result<DownloadedFile, TransferError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requested.lock().unwrap().push(url.to_string());
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let failure = self.failures.lock().unwrap().get(url).cloned();
        if let Some(error) = failure {
            return Err(error);
        }

        tokio::fs::write(dest, &self.body)
            .await
            .map_err(|e| TransferError::from_io(&e))?;
        let size = self.body.len() as u64;
        if let Some(callback) = progress {
            callback(TransferProgress {
                loaded: size,
                total: Some(size),
            });
        }
        Ok(DownloadedFile {
            path: dest.to_path_buf(),
            size,
            content_type: None,
        })
    }

    async fn head(&self, _url: &str) -> Result<RemoteFileInfo, TransferError> {
        Ok(RemoteFileInfo {
            content_length: Some(self.body.len() as u64),
            content_type: None,
        })
    }
}

/// Engine wired to in-memory databases, a temp directory and test adapters
pub struct TestPool {
    pub pool: Filepool,
    pub fetcher: Arc<ScriptedFetcher>,
    pub fs: Arc<LocalFileSystem>,
    pub network: Arc<NetworkMonitor>,
    pub dir: TempDir,
}

pub fn test_config(dir: &Path) -> Config {
    Config {
        storage: StorageConfig {
            data_dir: dir.to_path_buf(),
            in_memory: true,
        },
        queue: QueueConfig {
            process_interval_ms: 10,
            default_priority: 0,
            wifi_only: false,
        },
        network: NetworkConfig::default(),
    }
}

pub fn test_pool() -> TestPool {
    test_pool_with(ScriptedFetcher::new())
}

pub fn test_pool_with(fetcher: ScriptedFetcher) -> TestPool {
    test_pool_configured(fetcher, |_| {})
}

/// Like `test_pool_with`, with a chance to adjust the config first
pub fn test_pool_configured(
    fetcher: ScriptedFetcher,
    configure: impl FnOnce(&mut Config),
) -> TestPool {
    let dir = TempDir::new().expect("temp dir");
    let fetcher = Arc::new(fetcher);
    let fs = Arc::new(LocalFileSystem::new(dir.path().join("sites")));
    let network = Arc::new(NetworkMonitor::new(true));
    let mut config = test_config(dir.path());
    configure(&mut config);
    let pool = Filepool::new(
        &config,
        fetcher.clone(),
        fs.clone(),
        network.clone(),
    )
    .expect("pool");

    TestPool {
        pool,
        fetcher,
        fs,
        network,
        dir,
    }
}

/// Local filesystem path behind a `file://` URL
pub fn path_of(file_url: &str) -> std::path::PathBuf {
    url::Url::parse(file_url)
        .expect("file url")
        .to_file_path()
        .expect("local path")
}
