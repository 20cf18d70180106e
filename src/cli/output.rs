use crate::pool::queue::ProcessOutcome;
use crate::store::files::FileEntry;
use crate::store::packages::PackageEntry;
use crate::store::queue::QueueEntry;
use chrono::{Local, TimeZone};

/// Format bytes into human-readable string (KB, MB, GB)
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Epoch milliseconds as local time, "-" for zero
pub fn format_millis(millis: i64) -> String {
    if millis <= 0 {
        return "-".to_string();
    }
    match Local.timestamp_millis_opt(millis).single() {
        Some(time) => time.format("%Y-%m-%d %H:%M:%S").to_string(),
        None => millis.to_string(),
    }
}

/// One queue entry per line, or a JSON array
pub fn format_queue_entries(entries: &[QueueEntry], json: bool) -> String {
    if json {
        return serde_json::to_string_pretty(entries).unwrap_or_else(|_| "[]".to_string());
    }
    if entries.is_empty() {
        return "Queue is empty.".to_string();
    }

    entries
        .iter()
        .map(|entry| {
            format!(
                "[{:3}] {} {} ({} links, added {})",
                entry.priority,
                entry.key(),
                entry.url,
                entry.links.len(),
                format_millis(entry.added)
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Detailed view of a pooled file
pub fn format_file_entry(entry: &FileEntry) -> String {
    let mut output = String::new();
    output.push_str(&format!("File ID: {}\n", entry.file_id));
    output.push_str(&format!("URL: {}\n", entry.url));
    output.push_str(&format!("Path: {}\n", entry.path));
    output.push_str(&format!("Revision: {}\n", entry.revision));
    output.push_str(&format!("Time modified: {}\n", entry.timemodified));
    output.push_str(&format!("Downloaded: {}\n", format_millis(entry.download_time)));
    if entry.stale {
        output.push_str("Stale: yes\n");
    }
    if entry.is_external_file {
        output.push_str(&format!(
            "External: {}\n",
            entry.repository_type.as_deref().unwrap_or("unknown repository")
        ));
    }
    output
}

/// Detailed view of a package status
pub fn format_package_entry(entry: &PackageEntry, json: bool) -> String {
    if json {
        return serde_json::to_string_pretty(entry).unwrap_or_else(|_| "{}".to_string());
    }
    let mut output = String::new();
    output.push_str(&format!(
        "Package: {} {}\n",
        entry.component,
        entry.component_id.as_deref().unwrap_or("")
    ));
    output.push_str(&format!("Status: {}\n", entry.status));
    if let Some(previous) = entry.previous {
        output.push_str(&format!("Previous: {}\n", previous));
    }
    output.push_str(&format!("Downloaded: {}\n", format_millis(entry.download_time)));
    if let Some(extra) = &entry.extra {
        output.push_str(&format!("Extra: {}\n", extra));
    }
    output
}

/// One line describing a processed queue item
pub fn format_outcome(outcome: &ProcessOutcome) -> String {
    match outcome {
        ProcessOutcome::Empty => "Queue is empty".to_string(),
        ProcessOutcome::Paused(reason) => format!("Queue paused: {:?}", reason),
        ProcessOutcome::Downloaded(key) => format!("✓ {}", key),
        ProcessOutcome::AlreadyCurrent(key) => format!("= {} (already current)", key),
        ProcessOutcome::Dropped { key, error } => format!("✗ {} dropped: {}", key, error),
        ProcessOutcome::Retained { key, error } => format!("… {} will be retried: {}", key, error),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::queue::QueueKey;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.00 MB");
    }

    #[test]
    fn test_format_millis_zero() {
        assert_eq!(format_millis(0), "-");
    }

    #[test]
    fn test_empty_queue() {
        assert_eq!(format_queue_entries(&[], false), "Queue is empty.");
        assert_eq!(format_queue_entries(&[], true), "[]");
    }

    #[test]
    fn test_format_outcome() {
        let key = QueueKey::new("s", "f_1");
        assert_eq!(format_outcome(&ProcessOutcome::Downloaded(key.clone())), "✓ s/f_1");
        assert!(format_outcome(&ProcessOutcome::AlreadyCurrent(key)).contains("already current"));
    }
}
