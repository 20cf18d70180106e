//! File identifier derivation
//!
//! A file id must survive token rotation, forced-download flags and
//! revision bumps, but change whenever the file's actual location does.
//!
//! ```ignore
//! use filepool::pool::file_id::file_id_from_url;
//!
//! let a = file_id_from_url("https://lms.test/webservice/pluginfile.php/5/mod_resource/content/3/notes.pdf?token=abc");
//! let b = file_id_from_url("https://lms.test/webservice/pluginfile.php/5/mod_resource/content/9/notes.pdf?token=xyz&forcedownload=1");
//! assert_eq!(a, b); // "notes_<md5>"
//! ```

use crate::error::{FilepoolError, Result};
use crate::file::naming::{guess_extension_from_url, guess_filename_from_url};
use regex::Regex;
use std::sync::LazyLock;

/// Alternate secure-download form carrying the token in the path
static TOKEN_PLUGINFILE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"/tokenpluginfile\.php/[^/]+/").expect("Invalid regex pattern")
});

/// Revision segment of activity module content files
static MODULE_REVISION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(/pluginfile\.php/[^/]+/mod_[A-Za-z0-9_]+/content/)\d+/")
        .expect("Invalid regex pattern")
});

/// Query attributes that never change which file is served
static IGNORED_ATTRIBUTES: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"[?&]token=[A-Za-z0-9]*",
        r"[?&]forcedownload=[0-1]",
        r"[?&]preview=[A-Za-z0-9]+",
        r"[?&]offline=[0-1]",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("Invalid regex pattern"))
    .collect()
});

static NUMERIC_ENTITY: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"&#(x[0-9A-Fa-f]+|[0-9]+);").expect("Invalid regex pattern")
});

static HASH_SUFFIX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_[a-f0-9]{32}$").expect("Invalid regex pattern"));

const WEBSERVICE_PLUGINFILE: &str = "/webservice/pluginfile.php";

/// Lowercase hex MD5 of a string
pub fn md5_hex(value: &str) -> String {
    format!("{:x}", md5::compute(value.as_bytes()))
}

/// True for URLs served by the plugin-file endpoints.
pub fn is_plugin_file_url(url: &str) -> bool {
    url.contains("/pluginfile.php") || url.contains("/tokenpluginfile.php")
}

/// Decode the handful of HTML entities that show up in rendered links.
pub fn decode_html(text: &str) -> String {
    let named = text
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&nbsp;", "\u{a0}");
    let numeric = NUMERIC_ENTITY.replace_all(&named, |caps: &regex::Captures| {
        let raw = &caps[1];
        let code = match raw.strip_prefix('x') {
            Some(hex) => u32::from_str_radix(hex, 16).ok(),
            None => raw.parse::<u32>().ok(),
        };
        code.and_then(char::from_u32)
            .map(String::from)
            .unwrap_or_else(|| caps[0].to_string())
    });
    // Last, so "&amp;lt;" decodes to "&lt;" and not "<"
    numeric.replace("&amp;", "&")
}

/// Replace the revision of module content URLs with a fixed `0`.
pub fn remove_revision_from_url(url: &str) -> String {
    if !is_plugin_file_url(url) {
        return url.to_string();
    }
    MODULE_REVISION.replace(url, "${1}0/").into_owned()
}

/// Canonical form of a URL used for identity.
pub fn normalize_url(url: &str) -> String {
    let url = TOKEN_PLUGINFILE.replace(url, format!("{}/", WEBSERVICE_PLUGINFILE));
    let url = remove_revision_from_url(&url);
    let decoded = match urlencoding::decode(&url) {
        Ok(d) => d.into_owned(),
        Err(_) => url.clone(),
    };
    let mut url = decode_html(&decoded);

    if url.contains(WEBSERVICE_PLUGINFILE) {
        for regex in IGNORED_ATTRIBUTES.iter() {
            url = regex.replace_all(&url, "").into_owned();
        }
        // Removing the first attribute can leave "path&rest"
        if !url.contains('?') {
            if let Some(pos) = url.find('&') {
                url.replace_range(pos..pos + 1, "?");
            }
        }
    }
    url
}

/// Append the URL hash to a filename unless it already carries this URL's.
///
/// A `_<md5>` suffix only counts when it is the hash of `url` once that
/// suffix is taken out of it; any other file keeps its own hash appended.
pub fn add_hash_to_filename(filename: &str, url: &str) -> String {
    if let Some(found) = HASH_SUFFIX.find(filename) {
        let suffix = found.as_str();
        let without = match url.rfind(suffix) {
            Some(pos) => format!("{}{}", &url[..pos], &url[pos + suffix.len()..]),
            None => url.to_string(),
        };
        if suffix[1..] == md5_hex(&without) {
            return filename.to_string();
        }
    }
    format!("{}_{}", filename, md5_hex(url))
}

/// Stable identifier of the file behind `url`.
pub fn file_id_from_url(url: &str) -> String {
    let cleaned = normalize_url(url);
    let filename = guess_filename_from_url(&cleaned);
    add_hash_to_filename(&filename, &cleaned)
}

/// Extension to give the pooled copy of `url`, if any.
pub fn extension_from_url(url: &str) -> Option<String> {
    guess_extension_from_url(&normalize_url(url))
}

/// Key deduplicating physical transfers of `url` into `path`.
pub fn download_key(url: &str, path: &str) -> String {
    md5_hex(&format!("{}###{}", url, path))
}

/// Identifier of the package owned by a component instance.
pub fn package_id(component: &str, component_id: Option<&str>) -> String {
    md5_hex(&format!("{}#{}", component, component_id.unwrap_or("")))
}

/// Turn a caller URL into one the fetcher may request.
///
/// Only http(s) is fetchable. Plugin files are routed through the
/// web-service endpoint and get the site token when one is known.
pub fn fix_plugin_file_url(url: &str, token: Option<&str>) -> Result<String> {
    let mut parsed = url::Url::parse(url)
        .map_err(|e| FilepoolError::NotDownloadable(format!("{}: {}", url, e)))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(FilepoolError::NotDownloadable(format!(
            "unsupported scheme '{}' in {}",
            parsed.scheme(),
            url
        )));
    }
    if !is_plugin_file_url(url) {
        return Ok(parsed.into());
    }

    let Some(token) = token else {
        return Ok(parsed.into());
    };

    let path = parsed.path().to_string();
    if let Some(rest) = TOKEN_PLUGINFILE.find(&path) {
        let tail = &path[rest.end()..];
        parsed.set_path(&format!("{}/{}", WEBSERVICE_PLUGINFILE, tail));
    } else if !path.contains(WEBSERVICE_PLUGINFILE) {
        parsed.set_path(&path.replacen("/pluginfile.php", WEBSERVICE_PLUGINFILE, 1));
    }

    let has_token = parsed.query_pairs().any(|(k, _)| k == "token");
    if !has_token {
        parsed.query_pairs_mut().append_pair("token", token);
    }
    Ok(parsed.into())
}
