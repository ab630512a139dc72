//! Error taxonomy shared by every layer of the pipeline.
//!
//! Each [`VaultError`] variant carries a machine-readable [`code`](VaultError::code),
//! an HTTP-style [`status`](VaultError::status), and a caller-safe
//! [`public_message`](VaultError::public_message). Internal details (absolute
//! paths, upstream bodies) stay in the `Display` form, which is only logged.
//!
//! | Code | Status | Raised by |
//! |------|--------|-----------|
//! | `invalid_input` | 400 | query / request validation, id decoding |
//! | `invalid_path` | 400 | root not absolute |
//! | `path_traversal` | 400 | path guard |
//! | `no_suitable_files` | 400 | explicit selection empty after filtering |
//! | `not_found` | 404 | missing root or document |
//! | `permission_denied` | 403 | unreadable root or document |
//! | `too_large` | 413 | document over the hard ceiling |
//! | `unauthorized` | 401 | model service rejected the credential |
//! | `rate_limited` | 429 | upstream throttling after retries |
//! | `timeout` | 408 | pipeline deadline exceeded |
//! | `cancelled` | 499 | caller went away |
//! | `upstream_failure` | 502 | vector search or model call failed |
//! | `configuration_missing` | 500 | required credential absent |
//! | `unknown` | 500 | anything else |

use lazy_static::lazy_static;
use regex::Regex;
use std::io;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Result alias used across the library.
pub type Result<T> = std::result::Result<T, VaultError>;

/// Every failure the retrieval and completion pipeline can report.
///
/// `Clone` so a single failure can be handed to every caller sharing a
/// deduplicated in-flight request.
#[derive(Debug, Clone, Error)]
pub enum VaultError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("path traversal rejected: {0}")]
    PathTraversal(String),

    #[error("no suitable files found for context")]
    NoSuitableFiles,

    #[error("not found: {0}")]
    NotFound(String),

    #[error("permission denied: {0}")]
    PermissionDenied(String),

    #[error("file too large: {size} bytes exceeds limit of {limit} bytes")]
    TooLarge { size: u64, limit: u64 },

    #[error("configuration missing: {0}")]
    ConfigurationMissing(String),

    #[error("upstream rejected credentials (HTTP {status})")]
    Unauthorized { status: u16 },

    #[error("upstream rate limited: {0}")]
    RateLimited(String),

    #[error("upstream failure: {message}")]
    UpstreamFailure {
        status: Option<u16>,
        message: String,
    },

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("cancelled by caller")]
    Cancelled,

    #[error("{0}")]
    Unknown(String),
}

impl VaultError {
    /// Classify an I/O error. `what` names the object being touched and ends
    /// up only in the internal (logged) message.
    pub fn from_io(err: &io::Error, what: impl AsRef<str>) -> Self {
        let what = what.as_ref();
        match err.kind() {
            io::ErrorKind::NotFound => VaultError::NotFound(what.to_string()),
            io::ErrorKind::PermissionDenied => VaultError::PermissionDenied(what.to_string()),
            _ => VaultError::Unknown(format!("{}: {}", what, err)),
        }
    }

    pub fn upstream(status: Option<u16>, message: impl Into<String>) -> Self {
        VaultError::UpstreamFailure {
            status,
            message: message.into(),
        }
    }

    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            VaultError::InvalidInput(_) => "invalid_input",
            VaultError::InvalidPath(_) => "invalid_path",
            VaultError::PathTraversal(_) => "path_traversal",
            VaultError::NoSuitableFiles => "no_suitable_files",
            VaultError::NotFound(_) => "not_found",
            VaultError::PermissionDenied(_) => "permission_denied",
            VaultError::TooLarge { .. } => "too_large",
            VaultError::ConfigurationMissing(_) => "configuration_missing",
            VaultError::Unauthorized { .. } => "unauthorized",
            VaultError::RateLimited(_) => "rate_limited",
            VaultError::UpstreamFailure { .. } => "upstream_failure",
            VaultError::Timeout(_) => "timeout",
            VaultError::Cancelled => "cancelled",
            VaultError::Unknown(_) => "unknown",
        }
    }

    /// HTTP-style status code.
    pub fn status(&self) -> u16 {
        match self {
            VaultError::InvalidInput(_)
            | VaultError::InvalidPath(_)
            | VaultError::PathTraversal(_)
            | VaultError::NoSuitableFiles => 400,
            VaultError::Unauthorized { .. } => 401,
            VaultError::PermissionDenied(_) => 403,
            VaultError::NotFound(_) => 404,
            VaultError::Timeout(_) => 408,
            VaultError::TooLarge { .. } => 413,
            VaultError::RateLimited(_) => 429,
            VaultError::Cancelled => 499,
            VaultError::UpstreamFailure { .. } => 502,
            VaultError::ConfigurationMissing(_) | VaultError::Unknown(_) => 500,
        }
    }

    /// Human-readable message safe to return to a caller.
    ///
    /// Only validation messages carry their detail, and even those are
    /// scrubbed of absolute paths.
    pub fn public_message(&self) -> String {
        match self {
            VaultError::InvalidInput(detail) => sanitize_message(detail, None),
            VaultError::InvalidPath(_) => "Invalid vault path".to_string(),
            VaultError::PathTraversal(_) => "Path escapes the vault root".to_string(),
            VaultError::NoSuitableFiles => "No suitable files found for context".to_string(),
            VaultError::NotFound(_) => "The requested document or vault was not found".to_string(),
            VaultError::PermissionDenied(_) => {
                "The requested document or vault is not readable".to_string()
            }
            VaultError::TooLarge { limit, .. } => {
                format!("The document exceeds the {} byte read limit", limit)
            }
            VaultError::ConfigurationMissing(_) => {
                "A required service credential is not configured".to_string()
            }
            VaultError::Unauthorized { .. } => {
                "The model service rejected the configured credential".to_string()
            }
            VaultError::RateLimited(_) => {
                "The model service is rate limiting requests; try again soon".to_string()
            }
            VaultError::UpstreamFailure { .. } => {
                "The model service failed to answer; try again".to_string()
            }
            VaultError::Timeout(d) => format!("The request timed out after {}s", d.as_secs()),
            VaultError::Cancelled => "The request was cancelled".to_string(),
            VaultError::Unknown(_) => "An unexpected error occurred".to_string(),
        }
    }
}

lazy_static! {
    static ref UNIX_ABSOLUTE: Regex = Regex::new(r#"(^|[\s'"(=])/[^\s'"]+"#).unwrap();
    static ref WINDOWS_ABSOLUTE: Regex = Regex::new(r#"[A-Za-z]:\\[^\s'"]+"#).unwrap();
}

/// Remove internal filesystem paths from a message.
///
/// `internal_root` is replaced by `[vault]` first; any remaining absolute
/// Unix or Windows path becomes `[path]`. Relative vault paths are kept.
pub fn sanitize_message(message: &str, internal_root: Option<&Path>) -> String {
    let mut out = message.to_string();
    if let Some(root) = internal_root {
        let root = root.to_string_lossy();
        if !root.is_empty() {
            out = out.replace(root.as_ref(), "[vault]");
        }
    }
    let out = UNIX_ABSOLUTE.replace_all(&out, "${1}[path]");
    WINDOWS_ABSOLUTE.replace_all(&out, "[path]").into_owned()
}
