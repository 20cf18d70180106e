use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use std::sync::RwLock;

const CONFIG_DIR_ENV: &str = "FILEPOOL_CONFIG_DIR";
const DATA_DIR_ENV: &str = "FILEPOOL_DATA_DIR";

// Global config directory override (for --config flag and tests)
static CONFIG_DIR_OVERRIDE: RwLock<Option<PathBuf>> = RwLock::new(None);

/// Set config directory override (used by --config flag and tests)
pub fn set_config_dir_override(path: Option<PathBuf>) {
    let mut override_path = CONFIG_DIR_OVERRIDE
        .write()
        .unwrap_or_else(|poisoned| poisoned.into_inner());
    *override_path = path;
}

/// Get current config directory override
pub fn get_config_dir_override() -> Option<PathBuf> {
    CONFIG_DIR_OVERRIDE
        .read()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .clone()
}

/// Find config directory by searching in priority order:
/// 1. Override from --config flag or set_config_dir_override() (highest priority)
/// 2. Environment variable FILEPOOL_CONFIG_DIR
/// 3. User config directory (`~/.config/filepool/` on Unix, `%APPDATA%\filepool\` on Windows)
/// 4. Current working directory (`./config/`)
///
/// If no config directory is found, creates one in the user config directory.
pub fn find_config_directory() -> Result<PathBuf> {
    if let Some(override_path) = get_config_dir_override() {
        tracing::debug!("Using config directory override: {:?}", override_path);
        return Ok(override_path);
    }

    let candidates = [
        std::env::var_os(CONFIG_DIR_ENV).map(PathBuf::from),
        get_user_config_dir().ok(),
        std::env::current_dir().ok().map(|cwd| cwd.join("config")),
    ];
    if let Some(found) = candidates.into_iter().flatten().find(|dir| dir.is_dir()) {
        tracing::debug!("Found config directory at: {:?}", found);
        return Ok(found);
    }

    let user_config = get_user_config_dir()?;
    std::fs::create_dir_all(&user_config).context("Failed to create user config directory")?;
    tracing::info!("Created config directory at: {:?}", user_config);
    Ok(user_config)
}

/// Get platform-specific user config directory
/// - Windows: `%APPDATA%\filepool`
/// - Unix: `~/.config/filepool`
fn get_user_config_dir() -> Result<PathBuf> {
    let base_dir = dirs::config_dir()
        .ok_or_else(|| anyhow::anyhow!("Could not determine user config directory"))?;
    Ok(base_dir.join("filepool"))
}

/// Get absolute path to settings.toml
pub fn get_app_config_path() -> Result<PathBuf> {
    let config_dir = find_config_directory()?;
    Ok(config_dir.join("settings.toml"))
}

/// Resolve the default data directory at runtime.
///
/// `FILEPOOL_DATA_DIR` when set, otherwise `<data_dir>/filepool` where
/// `<data_dir>` is `$XDG_DATA_HOME` or `~/.local/share` on Linux,
/// `~/Library/Application Support` on macOS and `%APPDATA%` on Windows.
/// Falls back to relative "./data".
pub fn resolve_default_data_directory() -> PathBuf {
    if let Some(env_dir) = std::env::var_os(DATA_DIR_ENV) {
        return PathBuf::from(env_dir);
    }
    match dirs::data_dir() {
        Some(data_dir) => data_dir.join("filepool"),
        None => PathBuf::from("data"),
    }
}

/// Resolve a relative path against the config directory.
///
/// If the path is already absolute, it is returned as-is.
/// Falls back to the original path if the config directory cannot be determined.
pub fn resolve_relative_to_config(path: &Path) -> PathBuf {
    if path.is_absolute() {
        return path.to_path_buf();
    }
    match find_config_directory() {
        Ok(config_dir) => config_dir.join(path),
        Err(_) => path.to_path_buf(),
    }
}

/// Get absolute path to application-wide logs directory
pub fn get_logs_dir() -> Result<PathBuf> {
    let config_dir = find_config_directory()?;
    Ok(config_dir.join(".logs"))
}
