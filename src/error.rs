use crate::pool::transfer::TransferError;
use thiserror::Error;

/// Errors produced by the filepool engine and its stores.
///
/// The enum is `Clone` so a single failure can be handed to every caller
/// awaiting the same in-flight download or package.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FilepoolError {
    /// The URL cannot be turned into something the pool is allowed to fetch
    #[error("File cannot be downloaded: {0}")]
    NotDownloadable(String),

    /// Local storage is not usable right now
    #[error("Local file system is not available")]
    FilesystemUnavailable,

    /// The device has no connectivity
    #[error("Device is offline")]
    Offline,

    /// The remote transfer failed
    #[error(transparent)]
    Transfer(#[from] TransferError),

    /// The platform refused a write because storage is full
    #[error("Not enough storage space to save the file")]
    QuotaExceeded,

    /// No entry for this file in the pool
    #[error("File {0} is not in the pool")]
    NotInPool(String),

    /// The pool has an entry but the file is gone from disk
    #[error("File {0} not found on disk")]
    LocalFileMissing(String),

    /// A site id or destination path would land outside the site directory
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// A package download was requested with an unusable file list
    #[error("Invalid package: {0}")]
    InvalidPackage(String),

    /// The engine went away before the queued file finished
    #[error("Download queue closed before the file was processed")]
    QueueClosed,

    /// Database failure
    #[error("Database error: {0}")]
    Store(String),

    /// Local I/O failure
    #[error("I/O error: {0}")]
    Io(String),

    /// Encoding or decoding of stored data failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Result type for filepool operations
pub type Result<T> = std::result::Result<T, FilepoolError>;

impl FilepoolError {
    /// True when the failure was caused by lack of storage space.
    pub fn is_quota_exceeded(&self) -> bool {
        matches!(
            self,
            Self::QuotaExceeded | Self::Transfer(TransferError::QuotaExceeded)
        )
    }
}

impl From<rusqlite::Error> for FilepoolError {
    fn from(e: rusqlite::Error) -> Self {
        Self::Store(e.to_string())
    }
}

impl From<std::io::Error> for FilepoolError {
    fn from(e: std::io::Error) -> Self {
        if is_storage_full(&e) {
            Self::QuotaExceeded
        } else {
            Self::Io(e.to_string())
        }
    }
}

impl From<serde_json::Error> for FilepoolError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

/// ENOSPC / EDQUOT, plus the portable kind where the platform reports it.
pub(crate) fn is_storage_full(e: &std::io::Error) -> bool {
    e.kind() == std::io::ErrorKind::StorageFull || matches!(e.raw_os_error(), Some(28) | Some(122))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_storage_full_maps_to_quota() {
        let err: FilepoolError = std::io::Error::from_raw_os_error(28).into();
        assert_eq!(err, FilepoolError::QuotaExceeded);
        assert!(err.is_quota_exceeded());
    }

    #[test]
    fn test_other_io_error_is_generic() {
        let err: FilepoolError =
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied").into();
        assert!(matches!(err, FilepoolError::Io(_)));
        assert!(!err.is_quota_exceeded());
    }

    #[test]
    fn test_transfer_quota_is_quota() {
        let err = FilepoolError::Transfer(TransferError::QuotaExceeded);
        assert!(err.is_quota_exceeded());
    }
}
