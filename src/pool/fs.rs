//! Local storage adapter
//!
//! Files of a site live under `<root>/<site_id>/`; pooled files default to
//! `<root>/<site_id>/filepool/<file_id>.<ext>`.

use crate::error::{FilepoolError, Result};
use crate::file::naming::{check_relative_path, check_site_id};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

/// Directory under a site holding pooled files
pub const POOL_FOLDER: &str = "filepool";

/// Default path of a pooled file, relative to its site directory
pub fn default_file_path(file_id: &str, extension: Option<&str>) -> String {
    match extension {
        Some(ext) if !ext.is_empty() => format!("{}/{}.{}", POOL_FOLDER, file_id, ext),
        _ => format!("{}/{}", POOL_FOLDER, file_id),
    }
}

#[async_trait]
pub trait FileSystem: Send + Sync {
    /// False when storage cannot be used at all (unmounted, not yet ready)
    fn is_available(&self) -> bool;

    /// Absolute directory of a site
    fn site_dir(&self, site_id: &str) -> PathBuf;

    /// Resolve a site-relative path to an absolute one inside the site
    /// directory. `InvalidPath` for anything that would land elsewhere.
    fn resolve(&self, site_id: &str, relative: &str) -> Result<PathBuf> {
        check_site_id(site_id)?;
        check_relative_path(relative)?;
        Ok(self.site_dir(site_id).join(relative))
    }

    /// The path if a regular file exists there, `LocalFileMissing` otherwise
    async fn get_file(&self, path: &Path) -> Result<PathBuf>;

    async fn get_file_size(&self, path: &Path) -> Result<u64>;

    async fn create_dir(&self, path: &Path) -> Result<()>;

    async fn move_file(&self, from: &Path, to: &Path) -> Result<()>;

    /// Delete a file. Returns false when there was nothing to delete.
    async fn remove_file(&self, path: &Path) -> Result<bool>;
}

fn missing(path: &Path) -> FilepoolError {
    FilepoolError::LocalFileMissing(path.to_string_lossy().into_owned())
}

/// tokio::fs-backed storage rooted at a directory
pub struct LocalFileSystem {
    root: PathBuf,
    available: AtomicBool,
}

impl LocalFileSystem {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            available: AtomicBool::new(true),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Toggle availability, e.g. while external storage is unmounted
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }
}

#[async_trait]
impl FileSystem for LocalFileSystem {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn site_dir(&self, site_id: &str) -> PathBuf {
        self.root.join(site_id)
    }

    async fn get_file(&self, path: &Path) -> Result<PathBuf> {
        match tokio::fs::metadata(path).await {
            Ok(meta) if meta.is_file() => Ok(path.to_path_buf()),
            Ok(_) => Err(missing(path)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(missing(path)),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_file_size(&self, path: &Path) -> Result<u64> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(missing(path)),
            Err(e) => Err(e.into()),
        }
    }

    async fn create_dir(&self, path: &Path) -> Result<()> {
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn move_file(&self, from: &Path, to: &Path) -> Result<()> {
        if let Some(parent) = to.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::rename(from, to).await?;
        Ok(())
    }

    async fn remove_file(&self, path: &Path) -> Result<bool> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_file_path() {
        assert_eq!(default_file_path("a_1", Some("pdf")), "filepool/a_1.pdf");
        assert_eq!(default_file_path("a_1", None), "filepool/a_1");
        assert_eq!(default_file_path("a_1", Some("")), "filepool/a_1");
    }

    #[tokio::test]
    async fn test_resolve_and_get_file() {
        let dir = TempDir::new().unwrap();
        let fs = LocalFileSystem::new(dir.path());
        let path = fs.resolve("site1", "filepool/a.txt").unwrap();
        assert_eq!(path, dir.path().join("site1").join("filepool/a.txt"));

        assert!(matches!(
            fs.get_file(&path).await,
            Err(FilepoolError::LocalFileMissing(_))
        ));

        fs.create_dir(path.parent().unwrap()).await.unwrap();
        std::fs::write(&path, b"abc").unwrap();
        assert_eq!(fs.get_file(&path).await.unwrap(), path);
        assert_eq!(fs.get_file_size(&path).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_directory_is_not_a_file() {
        let dir = TempDir::new().unwrap();
        let fs = LocalFileSystem::new(dir.path());
        assert!(fs.get_file(dir.path()).await.is_err());
    }

    #[tokio::test]
    async fn test_move_and_remove() {
        let dir = TempDir::new().unwrap();
        let fs = LocalFileSystem::new(dir.path());
        let from = dir.path().join("a.txt");
        let to = dir.path().join("nested").join("b.txt");
        std::fs::write(&from, b"x").unwrap();

        fs.move_file(&from, &to).await.unwrap();
        assert!(!from.exists());
        assert!(to.exists());

        assert!(fs.remove_file(&to).await.unwrap());
        assert!(!fs.remove_file(&to).await.unwrap());
    }

    #[test]
    fn test_resolve_stays_inside_site() {
        let fs = LocalFileSystem::new("/data/sites");
        for relative in ["../other/a.txt", "filepool/../../a.txt", "/etc/passwd", ""] {
            assert!(
                matches!(fs.resolve("site1", relative), Err(FilepoolError::InvalidPath(_))),
                "{:?} resolved",
                relative
            );
        }
        for site in ["..", "a/b", ""] {
            assert!(matches!(
                fs.resolve(site, "filepool/a.txt"),
                Err(FilepoolError::InvalidPath(_))
            ));
        }
    }

    #[test]
    fn test_availability_toggle() {
        let fs = LocalFileSystem::new("/tmp/unused");
        assert!(fs.is_available());
        fs.set_available(false);
        assert!(!fs.is_available());
    }
}
