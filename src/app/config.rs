use crate::store::queue::{MAX_PRIORITY, MIN_PRIORITY};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Complete configuration (saved to config/settings.toml)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub network: NetworkConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Holds app.db and the per-site directories
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Keep every database in memory (nothing survives the process)
    #[serde(default)]
    pub in_memory: bool,
}

fn default_data_dir() -> PathBuf {
    crate::util::paths::resolve_default_data_directory()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            in_memory: false,
        }
    }
}

impl StorageConfig {
    /// Device-global database holding the download queue
    pub fn app_db_path(&self) -> PathBuf {
        self.data_dir.join("app.db")
    }

    /// Root of the per-site directories
    pub fn sites_dir(&self) -> PathBuf {
        self.data_dir.join("sites")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Pause between two queue iterations
    #[serde(default = "default_process_interval_ms")]
    pub process_interval_ms: u64,
    #[serde(default)]
    pub default_priority: i64,
    /// Only process the queue while on wifi
    #[serde(default)]
    pub wifi_only: bool,
}

fn default_process_interval_ms() -> u64 {
    500
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            process_interval_ms: default_process_interval_ms(),
            default_priority: 0,
            wifi_only: false,
        }
    }
}

impl QueueConfig {
    pub fn process_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.process_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
}

fn default_user_agent() -> String {
    format!("filepool/{}", env!("CARGO_PKG_VERSION"))
}

fn default_timeout_secs() -> u64 {
    300
}

fn default_connect_timeout_secs() -> u64 {
    30
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            queue: QueueConfig::default(),
            network: NetworkConfig::default(),
        }
    }
}

impl Config {
    /// Load settings.toml from the config directory, defaults when absent
    pub fn load() -> anyhow::Result<Self> {
        let config_path = crate::util::paths::get_app_config_path()?;
        Self::load_from(&config_path)
    }

    pub fn load_from(config_path: &std::path::Path) -> anyhow::Result<Self> {
        use anyhow::Context;

        let config = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)
                .context(format!("Failed to read {:?}", config_path))?;
            let mut config: Config = toml::from_str(&content)
                .context(format!("Failed to parse {:?}", config_path))?;
            config.storage.data_dir =
                crate::util::paths::resolve_relative_to_config(&config.storage.data_dir);
            config
        } else {
            tracing::info!("Config not found at {:?}, using defaults", config_path);
            Config::default()
        };

        if let Err(errors) = config.validate() {
            return Err(anyhow::anyhow!(
                "Invalid configuration: {}",
                errors.join(", ")
            ));
        }
        Ok(config)
    }

    /// Save to settings.toml in the config directory
    pub fn save(&self) -> anyhow::Result<()> {
        let config_path = crate::util::paths::get_app_config_path()?;
        self.save_to(&config_path)
    }

    pub fn save_to(&self, config_path: &std::path::Path) -> anyhow::Result<()> {
        use anyhow::Context;

        if let Err(errors) = self.validate() {
            return Err(anyhow::anyhow!(
                "Cannot save invalid config: {}",
                errors.join(", ")
            ));
        }

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;

        // Atomic write using temp file + rename
        let temp_path = config_path.with_extension("toml.tmp");
        std::fs::write(&temp_path, &content).context("Failed to write temp config file")?;
        std::fs::rename(&temp_path, config_path).context("Failed to rename temp config file")?;

        tracing::info!("Saved config to {:?}", config_path);
        Ok(())
    }

    /// Collect every validation problem instead of stopping at the first
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !(MIN_PRIORITY..=MAX_PRIORITY).contains(&self.queue.default_priority) {
            errors.push(format!(
                "queue.default_priority must be between {} and {}",
                MIN_PRIORITY, MAX_PRIORITY
            ));
        }
        if self.network.user_agent.trim().is_empty() {
            errors.push("network.user_agent must not be empty".to_string());
        }
        if self.network.timeout_secs == 0 {
            errors.push("network.timeout_secs must be positive".to_string());
        }
        if !self.storage.in_memory && self.storage.data_dir.as_os_str().is_empty() {
            errors.push("storage.data_dir must not be empty".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
