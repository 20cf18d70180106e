//! Filename helpers for pooled files

use crate::error::{FilepoolError, Result};
use std::path::{Component, Path};

const INVALID_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*', '#', '%'];
const RESERVED_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL",
    "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8", "COM9",
    "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

/// Longest extension we accept from a URL
const MAX_EXTENSION_LEN: usize = 5;

/// Make a name safe to use as a single path component.
pub fn sanitize_filename(name: &str) -> String {
    let mut result: String = name
        .chars()
        .map(|c| {
            if INVALID_CHARS.contains(&c) || c.is_control() || c.is_whitespace() {
                '_'
            } else {
                c
            }
        })
        .collect();

    let upper = result.to_uppercase();
    let base = upper.split('.').next().unwrap_or("");
    if RESERVED_NAMES.contains(&base) {
        result = format!("_{}", result);
    }

    result = result.trim_end_matches(['.', '_']).to_string();
    result
}

/// Last path segment of a URL, without query string or fragment.
fn last_segment(url: &str) -> &str {
    let without_query = url.split(['?', '#']).next().unwrap_or("");
    let without_scheme = without_query
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(without_query);
    // A bare host has no file segment
    match without_scheme.split_once('/') {
        Some((_, path)) => path.rsplit('/').next().unwrap_or(""),
        None => "",
    }
}

/// Extension of the file a URL points at, lowercased.
///
/// Only short alphanumeric suffixes count; `index.php` style endpoints
/// therefore still report `php`.
pub fn guess_extension_from_url(url: &str) -> Option<String> {
    let segment = last_segment(url);
    let (stem, ext) = segment.rsplit_once('.')?;
    if stem.is_empty()
        || ext.is_empty()
        || ext.len() > MAX_EXTENSION_LEN
        || !ext.chars().all(|c| c.is_ascii_alphanumeric())
    {
        return None;
    }
    Some(ext.to_ascii_lowercase())
}

/// Human-readable name for the file behind a URL, extension removed.
///
/// Falls back to `file` when the URL has no usable segment.
pub fn guess_filename_from_url(url: &str) -> String {
    let segment = last_segment(url);
    let stem = match guess_extension_from_url(url) {
        Some(ext) => &segment[..segment.len() - ext.len() - 1],
        None => segment,
    };
    let name = sanitize_filename(stem);
    if name.is_empty() {
        "file".to_string()
    } else {
        name
    }
}

/// A site id must name exactly one directory under the storage root.
pub fn check_site_id(site_id: &str) -> Result<()> {
    if site_id.is_empty() || site_id == "." || site_id == ".." || site_id.contains(['/', '\\']) {
        return Err(FilepoolError::InvalidPath(format!("site id {:?}", site_id)));
    }
    Ok(())
}

/// Reject site-relative paths that are empty, absolute or climb out with `..`.
pub fn check_relative_path(relative: &str) -> Result<()> {
    let escapes = Path::new(relative)
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || !Path::new(relative).components().any(|c| matches!(c, Component::Normal(_))) {
        return Err(FilepoolError::InvalidPath(relative.to_string()));
    }
    Ok(())
}
