//! Transfer outcome classification
//!
//! The fetch adapter reports failures as a closed set of variants so the
//! queue can decide between dropping and retaining an entry without
//! inspecting status codes itself.

use thiserror::Error;

/// What the queue should do with an entry after a failed transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Remove the entry and reject everyone waiting on it
    Drop,
    /// Keep the entry for the next processing pass
    Retain,
}

/// Failure of a single remote transfer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    /// Remote file does not exist (404, 410)
    #[error("Remote file not found (HTTP {status})")]
    NotFound { status: u16 },

    /// URL could not be parsed or requested
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    /// Connection refused or the server answered with an error status
    #[error("{}", connection_message(*status, message))]
    Connection { status: Option<u16>, message: String },

    /// Transfer interrupted mid-flight (timeout, reset, truncated body)
    #[error("Transfer aborted: {0}")]
    Aborted(String),

    /// Server answered 304
    #[error("Remote file not modified")]
    NotModified,

    /// Storage quota hit while writing the body
    #[error("Not enough storage space to save the file")]
    QuotaExceeded,

    /// Local write failure during the transfer
    #[error("Failed to write downloaded file: {0}")]
    Io(String),
}

fn connection_message(status: Option<u16>, message: &str) -> String {
    match status {
        Some(code) => format!("HTTP {} - {}", code, describe_status(code)),
        None => format!("Connection failed: {}", message),
    }
}

/// Short human description for common statuses
pub fn describe_status(status: u16) -> &'static str {
    match status {
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        410 => "Gone",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        s if (400..500).contains(&s) => "Client Error",
        s if s >= 500 => "Server Error",
        _ => "HTTP Error",
    }
}

impl TransferError {
    /// Classify a non-success HTTP status
    pub fn from_status(status: u16) -> Self {
        match status {
            304 => Self::NotModified,
            404 | 410 => Self::NotFound { status },
            _ => Self::Connection {
                status: Some(status),
                message: describe_status(status).to_string(),
            },
        }
    }

    /// Classify a local I/O failure hit while writing the body
    pub fn from_io(e: &std::io::Error) -> Self {
        if crate::error::is_storage_full(e) {
            Self::QuotaExceeded
        } else {
            Self::Io(e.to_string())
        }
    }

    /// Classify a reqwest failure
    pub fn from_reqwest(e: &reqwest::Error) -> Self {
        if let Some(status) = e.status() {
            return Self::from_status(status.as_u16());
        }
        if e.is_builder() {
            Self::InvalidUrl(e.to_string())
        } else if e.is_timeout() || e.is_body() || e.is_decode() {
            Self::Aborted(e.to_string())
        } else {
            Self::Connection {
                status: None,
                message: e.to_string(),
            }
        }
    }

    /// Only interrupted transfers are worth another pass.
    pub fn disposition(&self) -> FailureDisposition {
        match self {
            Self::Aborted(_) => FailureDisposition::Retain,
            _ => FailureDisposition::Drop,
        }
    }
}
