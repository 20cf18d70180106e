//! Staleness policy and package status aggregation

use crate::store::files::FileEntry;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Download status of a package (a group of files owned by one component)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PackageStatus {
    NotDownloadable,
    NotDownloaded,
    Downloading,
    Downloaded,
    Outdated,
}

impl PackageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotDownloadable => "not-downloadable",
            Self::NotDownloaded => "not-downloaded",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::Outdated => "outdated",
        }
    }
}

impl fmt::Display for PackageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PackageStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "not-downloadable" => Self::NotDownloadable,
            "not-downloaded" => Self::NotDownloaded,
            "downloading" => Self::Downloading,
            "downloaded" => Self::Downloaded,
            "outdated" => Self::Outdated,
            other => return Err(format!("Unknown package status: {}", other)),
        })
    }
}

/// State of a single file as seen by a caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FileState {
    NotDownloaded,
    Downloading,
    Downloaded,
    Outdated,
}

impl fmt::Display for FileState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotDownloaded => "not-downloaded",
            Self::Downloading => "downloading",
            Self::Downloaded => "downloaded",
            Self::Outdated => "outdated",
        };
        f.write_str(s)
    }
}

/// Whether the cached copy must be refreshed before it can be trusted.
pub fn is_outdated(entry: &FileEntry, revision: i64, timemodified: i64) -> bool {
    entry.stale || revision > entry.revision || timemodified > entry.timemodified
}

/// Entries whose staleness can never be detected from revision data.
pub fn is_update_unknown(entry: &FileEntry) -> bool {
    entry.is_external_file || (entry.revision < 1 && entry.timemodified == 0)
}

/// Combine two package statuses.
///
/// Precedence: not-downloaded, downloading, outdated, downloaded, not-downloadable.
pub fn determine_package_status(
    current: Option<PackageStatus>,
    next: PackageStatus,
) -> PackageStatus {
    use PackageStatus::*;

    let Some(current) = current else {
        return next;
    };
    let either = |s: PackageStatus| current == s || next == s;
    if either(NotDownloaded) {
        NotDownloaded
    } else if either(Downloading) {
        Downloading
    } else if either(Outdated) {
        Outdated
    } else if either(Downloaded) {
        Downloaded
    } else {
        NotDownloadable
    }
}

/// Aggregate many package statuses into one dashboard status.
pub fn determine_packages_status<I>(statuses: I) -> PackageStatus
where
    I: IntoIterator<Item = PackageStatus>,
{
    statuses
        .into_iter()
        .fold(None, |acc, s| Some(determine_package_status(acc, s)))
        .unwrap_or(PackageStatus::NotDownloadable)
}

/// Highest revision among a file list
pub fn revision_from_files<'a, I>(revisions: I) -> i64
where
    I: IntoIterator<Item = &'a i64>,
{
    revisions.into_iter().copied().max().unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use PackageStatus::*;

    fn entry(revision: i64, timemodified: i64, stale: bool) -> FileEntry {
        FileEntry {
            revision,
            timemodified,
            stale,
            ..FileEntry::new("f_1", "https://lms.test/f")
        }
    }

    #[test]
    fn test_stale_always_outdated() {
        let e = entry(5, 100, true);
        assert!(is_outdated(&e, 0, 0));
        assert!(is_outdated(&e, 5, 100));
        assert!(is_outdated(&e, 1, 1));
    }

    #[test]
    fn test_newer_revision_or_time_outdated() {
        let e = entry(5, 100, false);
        assert!(is_outdated(&e, 6, 0));
        assert!(is_outdated(&e, 0, 101));
    }

    #[test]
    fn test_equal_or_older_is_current() {
        let e = entry(5, 100, false);
        assert!(!is_outdated(&e, 5, 100));
        assert!(!is_outdated(&e, 4, 99));
        assert!(!is_outdated(&e, 0, 0));
    }

    #[test]
    fn test_update_unknown() {
        assert!(is_update_unknown(&entry(0, 0, false)));
        assert!(!is_update_unknown(&entry(1, 0, false)));
        assert!(!is_update_unknown(&entry(0, 10, false)));

        let mut external = entry(3, 10, false);
        external.is_external_file = true;
        assert!(is_update_unknown(&external));
    }

    #[test]
    fn test_aggregate_outdated_wins_over_downloaded() {
        assert_eq!(determine_packages_status([Downloaded, Outdated, Downloaded]), Outdated);
    }

    #[test]
    fn test_aggregate_not_downloaded_wins() {
        assert_eq!(
            determine_packages_status([NotDownloaded, Downloading, Downloaded]),
            NotDownloaded
        );
    }

    #[test]
    fn test_aggregate_downloading_over_outdated() {
        assert_eq!(determine_packages_status([Outdated, Downloading]), Downloading);
    }

    #[test]
    fn test_aggregate_downloaded_and_not_downloadable() {
        assert_eq!(determine_packages_status([NotDownloadable, Downloaded]), Downloaded);
        assert_eq!(
            determine_packages_status([NotDownloadable, NotDownloadable]),
            NotDownloadable
        );
        assert_eq!(determine_packages_status(Vec::new()), NotDownloadable);
    }

    #[test]
    fn test_status_string_roundtrip() {
        for s in [NotDownloadable, NotDownloaded, Downloading, Downloaded, Outdated] {
            assert_eq!(s.as_str().parse::<PackageStatus>().unwrap(), s);
        }
        assert!("bogus".parse::<PackageStatus>().is_err());
    }

    #[test]
    fn test_revision_from_files() {
        assert_eq!(revision_from_files(&[3, 9, 1]), 9);
        assert_eq!(revision_from_files(&Vec::<i64>::new()), 0);
    }
}
