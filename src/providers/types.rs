//! Shared types for storage backends
//!
//! File entries, quota information, the error taxonomy surfaced to callers and
//! the response shape returned by backend reads.

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io;
use thiserror::Error;

use crate::byte_stream::UpstreamBody;

/// Backend family, used to pick a transfer strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    WebDav,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Local => write!(f, "Local"),
            BackendKind::WebDav => write!(f, "WebDAV"),
        }
    }
}

/// A file or directory as seen through any backend.
///
/// `path` is slash-separated, backend-relative and always starts with `/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileEntry {
    pub name: String,
    pub path: String,
    pub is_directory: bool,
    /// Size in bytes (0 for directories)
    pub size: u64,
    /// Last modification time, RFC 3339 UTC
    pub mtime: Option<String>,
    /// Visible children, directories only, best effort
    pub child_count: Option<u64>,
    pub mime_type: String,
}

impl FileEntry {
    pub fn directory(name: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            is_directory: true,
            size: 0,
            mtime: None,
            child_count: None,
            mime_type: DIRECTORY_MIME.to_string(),
        }
    }

    pub fn file(name: impl Into<String>, path: impl Into<String>, size: u64) -> Self {
        let name = name.into();
        let mime_type = guess_mime(&name);
        Self {
            name,
            path: path.into(),
            is_directory: false,
            size,
            mtime: None,
            child_count: None,
            mime_type,
        }
    }
}

pub const DIRECTORY_MIME: &str = "inode/directory";

/// MIME type from the file extension, `application/octet-stream` when unknown
pub fn guess_mime(name: &str) -> String {
    mime_guess::from_path(name)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

/// Storage quota information
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageInfo {
    /// Bytes used
    pub used: u64,
    /// Total bytes available
    pub total: u64,
    /// Bytes free
    pub free: u64,
}

/// Result of a backend read: status, relayable headers and a body that is
/// consumed lazily.
pub struct ReadResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: UpstreamBody,
}

impl fmt::Debug for ReadResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

/// Storage backend errors
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("A drive for this server and username already exists")]
    DuplicateAccount,

    #[error("A drive named '{0}' already exists")]
    DuplicateName(String),

    #[error("Upstream returned {status}: {message}")]
    UpstreamError {
        status: u16,
        message: String,
        headers: HeaderMap,
        body: Bytes,
    },

    #[error("Network timeout")]
    NetworkTimeout,

    #[error("Transfer cancelled")]
    Cancelled,

    #[error("Path not found: {0}")]
    NotFound(String),

    #[error("Storage full")]
    StorageFull,

    #[error("Requested range not satisfiable (size {size})")]
    RangeNotSatisfiable { size: u64 },

    #[error("Invalid path: {0}")]
    InvalidPath(String),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("Encryption error: {0}")]
    Encryption(String),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),
}

impl ProviderError {
    /// Classify an I/O error against the path it happened on
    pub fn from_io(err: io::Error, path: &str) -> Self {
        match err.kind() {
            io::ErrorKind::NotFound => ProviderError::NotFound(path.to_string()),
            io::ErrorKind::PermissionDenied => ProviderError::AccessDenied(path.to_string()),
            io::ErrorKind::TimedOut => ProviderError::NetworkTimeout,
            _ if err.raw_os_error() == Some(libc::ENOSPC) => ProviderError::StorageFull,
            _ => ProviderError::IoError(err),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderError::AccessDenied(_) => ErrorKind::AccessDenied,
            ProviderError::DuplicateAccount => ErrorKind::DuplicateAccount,
            ProviderError::DuplicateName(_) => ErrorKind::DuplicateName,
            ProviderError::UpstreamError { .. } => ErrorKind::UpstreamError,
            ProviderError::NetworkTimeout => ErrorKind::NetworkTimeout,
            ProviderError::Cancelled => ErrorKind::Cancelled,
            ProviderError::NotFound(_) => ErrorKind::NotFound,
            ProviderError::StorageFull => ErrorKind::StorageFull,
            ProviderError::RangeNotSatisfiable { .. } => ErrorKind::RangeNotSatisfiable,
            ProviderError::InvalidPath(_) | ProviderError::InvalidConfig(_) => ErrorKind::Invalid,
            ProviderError::NetworkError(_) => ErrorKind::Network,
            ProviderError::ParseError(_) => ErrorKind::Parse,
            ProviderError::Encryption(_) => ErrorKind::Encryption,
            ProviderError::IoError(_) => ErrorKind::Io,
        }
    }

    /// HTTP status this error maps to when relayed to a byte-range client
    pub fn http_status(&self) -> StatusCode {
        match self {
            ProviderError::UpstreamError { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            ProviderError::AccessDenied(_) => StatusCode::FORBIDDEN,
            ProviderError::NotFound(_) => StatusCode::NOT_FOUND,
            ProviderError::RangeNotSatisfiable { .. } => StatusCode::RANGE_NOT_SATISFIABLE,
            ProviderError::InvalidPath(_) => StatusCode::BAD_REQUEST,
            ProviderError::StorageFull => StatusCode::INSUFFICIENT_STORAGE,
            ProviderError::NetworkTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProviderError::NetworkError(_) | ProviderError::ParseError(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Coarse error category delivered to the UI
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    AccessDenied,
    DuplicateAccount,
    DuplicateName,
    UpstreamError,
    NetworkTimeout,
    Cancelled,
    NotFound,
    StorageFull,
    RangeNotSatisfiable,
    Invalid,
    Network,
    Parse,
    Encryption,
    Io,
    /// A directory was kept because entries below it were not transferred
    Incomplete,
}

/// Structured, serializable form of a per-item failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drive_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl ErrorInfo {
    pub fn new(err: &ProviderError, drive_id: Option<&str>, path: Option<&str>) -> Self {
        let status = match err {
            ProviderError::UpstreamError { status, .. } => Some(*status),
            ProviderError::RangeNotSatisfiable { .. } => Some(416),
            _ => None,
        };
        Self {
            kind: err.kind(),
            message: err.to_string(),
            drive_id: drive_id.map(str::to_string),
            path: path.map(str::to_string),
            status,
        }
    }

    pub fn incomplete(drive_id: &str, path: &str, failed: usize) -> Self {
        Self {
            kind: ErrorKind::Incomplete,
            message: format!("{} entries below {} were not transferred", failed, path),
            drive_id: Some(drive_id.to_string()),
            path: Some(path.to_string()),
            status: None,
        }
    }
}

// ─── Path helpers ───────────────────────────────────────────────────────────

/// Normalize a backend path: leading `/`, no trailing `/`, no empty or `.` segments.
/// `..` segments are kept verbatim so backends can reject them.
pub fn normalize_path(path: &str) -> String {
    let parts: Vec<&str> = path
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect();
    format!("/{}", parts.join("/"))
}

/// Join a directory path and a child name
pub fn join_path(dir: &str, name: &str) -> String {
    let dir = normalize_path(dir);
    let name = name.trim_matches('/');
    if dir == "/" {
        format!("/{}", name)
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Last segment of a path, empty for the root
pub fn base_name(path: &str) -> String {
    normalize_path(path)
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// Parent directory of a path, `/` for top-level entries and the root
pub fn parent_path(path: &str) -> String {
    let path = normalize_path(path);
    match path.rfind('/') {
        Some(0) | None => "/".to_string(),
        Some(i) => path[..i].to_string(),
    }
}

/// Reject names that would escape their directory or create nested paths
pub fn validate_entry_name(name: &str) -> Result<(), ProviderError> {
    if name.is_empty()
        || name == "."
        || name == ".."
        || name.contains('/')
        || name.contains('\\')
        || name.contains('\0')
    {
        return Err(ProviderError::InvalidPath(format!("Invalid name: {:?}", name)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(""), "/");
        assert_eq!(normalize_path("/"), "/");
        assert_eq!(normalize_path("docs//a/./b/"), "/docs/a/b");
        assert_eq!(normalize_path("/a/../b"), "/a/../b");
    }

    #[test]
    fn test_join_and_split() {
        assert_eq!(join_path("/", "a.txt"), "/a.txt");
        assert_eq!(join_path("/docs/", "a.txt"), "/docs/a.txt");
        assert_eq!(base_name("/docs/a.txt"), "a.txt");
        assert_eq!(base_name("/"), "");
        assert_eq!(parent_path("/docs/a.txt"), "/docs");
        assert_eq!(parent_path("/a.txt"), "/");
        assert_eq!(parent_path("/"), "/");
    }

    #[test]
    fn test_validate_entry_name() {
        assert!(validate_entry_name("report.pdf").is_ok());
        assert!(validate_entry_name("..").is_err());
        assert!(validate_entry_name("a/b").is_err());
        assert!(validate_entry_name("").is_err());
    }

    #[test]
    fn test_file_entry_mime() {
        let entry = FileEntry::file("movie.mp4", "/movie.mp4", 10);
        assert_eq!(entry.mime_type, "video/mp4");
        let entry = FileEntry::file("blob", "/blob", 10);
        assert_eq!(entry.mime_type, "application/octet-stream");
        assert_eq!(FileEntry::directory("d", "/d").mime_type, DIRECTORY_MIME);
    }

    #[test]
    fn test_io_error_classification() {
        let err = ProviderError::from_io(io::Error::from(io::ErrorKind::NotFound), "/x");
        assert!(matches!(err, ProviderError::NotFound(p) if p == "/x"));
        let err = ProviderError::from_io(io::Error::from_raw_os_error(libc::ENOSPC), "/x");
        assert!(matches!(err, ProviderError::StorageFull));
        let err = ProviderError::from_io(io::Error::from(io::ErrorKind::PermissionDenied), "/x");
        assert_eq!(err.http_status(), StatusCode::FORBIDDEN);
    }

    #[test]
    fn test_error_info_serialization() {
        let err = ProviderError::UpstreamError {
            status: 502,
            message: "bad gateway".into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
        };
        let info = ErrorInfo::new(&err, Some("d1"), Some("/a"));
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["kind"], "upstream_error");
        assert_eq!(json["status"], 502);
        assert_eq!(json["drive_id"], "d1");
    }
}
