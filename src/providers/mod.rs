//! Storage Backends Module
//!
//! This module provides a unified abstraction layer over the storage backends a
//! drive can point at. All backends implement the `StorageBackend` trait, so the
//! transfer pipeline and range proxy work with any pair of them.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │            StorageBackend Trait             │
//! │   list, stat, mkdir, read, write, etc.      │
//! └─────────────────────────────────────────────┘
//!                      │
//!            ┌─────────┴─────────┐
//!            ▼                   ▼
//!        ┌───────┐          ┌────────┐
//!        │ Local │          │ WebDAV │
//!        └───────┘          └────────┘
//! ```

pub mod local;
pub mod multistatus;
pub mod types;
pub mod webdav;

pub use local::LocalBackend;
pub use types::*;
pub use webdav::{WebDavBackend, WebDavConfig};

use async_trait::async_trait;
use std::sync::Arc;

use crate::byte_stream::ByteStream;
use crate::config::EngineConfig;
use crate::drive_registry::{DriveKind, ResolvedDrive};

/// Unified storage backend trait
///
/// Paths are backend-relative and slash-separated. Implementations are shared
/// behind `Arc` across concurrent requests, so every method takes `&self`.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Backend family, used to pick a transfer strategy
    fn kind(&self) -> BackendKind;

    /// Filesystem fast paths, available on the local backend only
    fn as_local(&self) -> Option<&LocalBackend> {
        None
    }

    /// List the visible children of a directory
    async fn list(&self, path: &str) -> Result<Vec<FileEntry>, ProviderError>;

    /// Metadata for a single path
    async fn stat(&self, path: &str) -> Result<FileEntry, ProviderError>;

    /// Create a directory and any missing parents. Existing directories are not an error.
    async fn mkdir(&self, path: &str) -> Result<(), ProviderError>;

    /// Delete files or whole directory trees
    async fn delete(&self, paths: &[String]) -> Result<(), ProviderError>;

    /// Rename in place, returning the new path
    async fn rename(&self, path: &str, new_name: &str) -> Result<String, ProviderError>;

    /// Move entries into `dest_dir`, overwriting on name collision
    async fn move_items(&self, paths: &[String], dest_dir: &str) -> Result<(), ProviderError>;

    /// Open a file for reading, honoring an optional `Range` header value
    async fn read(&self, path: &str, range: Option<&str>) -> Result<ReadResponse, ProviderError>;

    /// Stream `body` into `path`, replacing any existing file
    async fn write(&self, path: &str, body: ByteStream, size_hint: Option<u64>) -> Result<(), ProviderError>;

    /// Quota, `None` when the backend does not report it
    async fn storage_info(&self) -> Result<Option<StorageInfo>, ProviderError>;

    /// Case-insensitive name search below `path`, at most `limit` results
    async fn search(&self, path: &str, pattern: &str, limit: usize) -> Result<Vec<FileEntry>, ProviderError>;

    /// Cheap round trip proving the backend is reachable and authorized
    async fn check_connection(&self) -> Result<(), ProviderError>;
}

/// Backend factory for resolved drives
pub struct ProviderFactory;

impl ProviderFactory {
    /// Open the backend a drive points at
    pub fn open(drive: &ResolvedDrive, config: &EngineConfig) -> Result<Arc<dyn StorageBackend>, ProviderError> {
        match &drive.kind {
            DriveKind::Local => Ok(Arc::new(LocalBackend::new(&config.sandbox_root)?)),
            DriveKind::WebDav { url, username } => {
                let backend = WebDavBackend::new(WebDavConfig {
                    url: url.clone(),
                    username: username.clone(),
                    password: drive.secret.clone(),
                    timeout: config.http_timeout(),
                    accept_invalid_certs: config.accept_invalid_certs,
                })?;
                Ok(Arc::new(backend))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::drive_registry::LOCAL_DRIVE_ID;
    use secrecy::SecretString;

    #[test]
    fn test_factory_selects_backend_by_kind() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::with_dirs(dir.path().join("sandbox"), dir.path());

        let local = ResolvedDrive {
            id: LOCAL_DRIVE_ID.to_string(),
            name: "Local".to_string(),
            kind: DriveKind::Local,
            secret: SecretString::from(String::new()),
        };
        let backend = ProviderFactory::open(&local, &config).unwrap();
        assert_eq!(backend.kind(), BackendKind::Local);
        assert!(backend.as_local().is_some());

        let remote = ResolvedDrive {
            id: "r1".to_string(),
            name: "Remote".to_string(),
            kind: DriveKind::WebDav {
                url: "https://dav.example.com/files/".to_string(),
                username: "alice".to_string(),
            },
            secret: SecretString::from("pw".to_string()),
        };
        let backend = ProviderFactory::open(&remote, &config).unwrap();
        assert_eq!(backend.kind(), BackendKind::WebDav);
        assert!(backend.as_local().is_none());
    }

    #[test]
    fn test_factory_rejects_bad_url() {
        let dir = tempfile::tempdir().unwrap();
        let config = EngineConfig::with_dirs(dir.path().join("sandbox"), dir.path());
        let remote = ResolvedDrive {
            id: "r1".to_string(),
            name: "Remote".to_string(),
            kind: DriveKind::WebDav {
                url: "not a url".to_string(),
                username: "alice".to_string(),
            },
            secret: SecretString::from(String::new()),
        };
        assert!(matches!(
            ProviderFactory::open(&remote, &config),
            Err(ProviderError::InvalidConfig(_))
        ));
    }
}
