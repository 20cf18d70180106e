use anyhow::Result;
use filetime::{set_file_mtime, FileTime};
use std::path::Path;

/// Stamp a downloaded file with the server-reported modification time.
///
/// `timemodified` is epoch seconds; zero means the server did not say.
pub fn apply_timemodified(path: &Path, timemodified: i64) -> Result<()> {
    if timemodified > 0 {
        set_file_mtime(path, FileTime::from_unix_time(timemodified, 0))?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_apply_timemodified_sets_mtime() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f.txt");
        std::fs::write(&path, b"x").unwrap();

        apply_timemodified(&path, 1_600_000_000).unwrap();

        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(FileTime::from_last_modification_time(&meta).unix_seconds(), 1_600_000_000);
    }

    #[test]
    fn test_apply_zero_is_noop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing.txt");
        // Missing file is fine when nothing is applied
        assert!(apply_timemodified(&path, 0).is_ok());
    }
}
