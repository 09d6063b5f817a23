// DriveBridge Drive Registry
// Persistent list of configured drives (drives.json) with encrypted secrets,
// uniqueness rules and best-effort quota attachment.

use futures_util::future::join_all;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::EngineConfig;
use crate::credential_store::{ensure_secure_permissions, CredentialCodec};
use crate::providers::{ProviderError, ProviderFactory, StorageInfo};

pub const DRIVES_FILENAME: &str = "drives.json";
pub const LOCAL_DRIVE_ID: &str = "local";
const LOCAL_DRIVE_NAME: &str = "Local";

/// What a drive points at
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DriveKind {
    Local,
    #[serde(rename = "webdav")]
    WebDav { url: String, username: String },
}

impl DriveKind {
    /// `(url without trailing slash, username)` identity of a remote account
    fn account_key(&self) -> Option<(&str, &str)> {
        match self {
            DriveKind::Local => None,
            DriveKind::WebDav { url, username } => Some((url.trim_end_matches('/'), username.as_str())),
        }
    }
}

/// On-disk form of a drive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriveRecord {
    pub id: String,
    pub name: String,
    pub kind: DriveKind,
    /// base64(nonce || ciphertext); never set for the local drive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    /// Last quota fetched, reported when a fresh fetch fails
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_known_quota: Option<StorageInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl DriveRecord {
    fn local() -> Self {
        Self {
            id: LOCAL_DRIVE_ID.to_string(),
            name: LOCAL_DRIVE_NAME.to_string(),
            kind: DriveKind::Local,
            secret: None,
            last_known_quota: None,
            created_at: None,
        }
    }

    fn view(&self, quota: Option<StorageInfo>) -> DriveView {
        DriveView {
            id: self.id.clone(),
            name: self.name.clone(),
            kind: self.kind.clone(),
            quota,
            removable: self.id != LOCAL_DRIVE_ID,
        }
    }
}

/// Credential-free drive description returned to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriveView {
    pub id: String,
    pub name: String,
    pub kind: DriveKind,
    pub quota: Option<StorageInfo>,
    pub removable: bool,
}

/// A drive with its secret decrypted, ready to open a backend
#[derive(Debug, Clone)]
pub struct ResolvedDrive {
    pub id: String,
    pub name: String,
    pub kind: DriveKind,
    pub secret: SecretString,
}

/// Parameters for a new WebDAV drive
#[derive(Debug, Clone)]
pub struct NewDrive {
    pub name: String,
    pub url: String,
    pub username: String,
    pub secret: SecretString,
}

impl NewDrive {
    fn resolved(&self, id: &str) -> ResolvedDrive {
        ResolvedDrive {
            id: id.to_string(),
            name: self.name.trim().to_string(),
            kind: DriveKind::WebDav {
                url: self.url.trim().to_string(),
                username: self.username.trim().to_string(),
            },
            secret: self.secret.clone(),
        }
    }
}

/// Drive registry backed by `drives.json`.
///
/// Reads take the shared lock; every mutation holds the exclusive lock while
/// the whole list is written to a temp file and renamed over the store.
pub struct DriveRegistry {
    path: PathBuf,
    codec: CredentialCodec,
    config: Arc<EngineConfig>,
    drives: RwLock<Vec<DriveRecord>>,
}

impl DriveRegistry {
    /// Load the registry, creating the store with just the local drive if missing
    pub fn open(config: Arc<EngineConfig>, codec: CredentialCodec) -> Result<Self, ProviderError> {
        let path = config.drives_path();
        let mut drives: Vec<DriveRecord> = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content)
                .map_err(|e| ProviderError::ParseError(format!("{}: {}", path.display(), e)))?
        } else {
            Vec::new()
        };

        // Exactly one local drive, always first
        drives.retain(|d| d.id != LOCAL_DRIVE_ID && d.kind != DriveKind::Local);
        drives.insert(0, DriveRecord::local());

        if !path.exists() {
            write_store(&path, &drives)?;
        }
        Ok(Self {
            path,
            codec,
            config,
            drives: RwLock::new(drives),
        })
    }

    /// All drives with quota attached best effort
    pub async fn list(&self) -> Vec<DriveView> {
        let records = self.drives.read().await.clone();
        let lookups = records.iter().map(|record| self.fetch_quota(record));
        let quotas = join_all(lookups).await;

        let mut refreshed = Vec::new();
        let views = records
            .iter()
            .zip(quotas)
            .map(|(record, fetched)| match fetched {
                Some(quota) => {
                    if record.last_known_quota != Some(quota) {
                        refreshed.push((record.id.clone(), quota));
                    }
                    record.view(Some(quota))
                }
                None => record.view(record.last_known_quota),
            })
            .collect();

        if !refreshed.is_empty() {
            let mut drives = self.drives.write().await;
            for (id, quota) in refreshed {
                if let Some(record) = drives.iter_mut().find(|d| d.id == id) {
                    record.last_known_quota = Some(quota);
                }
            }
            if let Err(e) = self.persist(&drives) {
                warn!("Failed to persist quota hints: {}", e);
            }
        }
        views
    }

    async fn fetch_quota(&self, record: &DriveRecord) -> Option<StorageInfo> {
        let resolved = match self.resolve(record) {
            Ok(r) => r,
            Err(e) => {
                warn!(drive_id = %record.id, "Cannot resolve drive for quota lookup: {}", e);
                return None;
            }
        };
        let backend = ProviderFactory::open(&resolved, &self.config).ok()?;
        match tokio::time::timeout(self.config.quota_timeout(), backend.storage_info()).await {
            Ok(Ok(quota)) => quota,
            Ok(Err(e)) => {
                debug!(drive_id = %record.id, "Quota lookup failed: {}", e);
                None
            }
            Err(_) => {
                debug!(drive_id = %record.id, "Quota lookup timed out");
                None
            }
        }
    }

    fn resolve(&self, record: &DriveRecord) -> Result<ResolvedDrive, ProviderError> {
        let secret = match &record.secret {
            Some(stored) => self.codec.decrypt(stored)?,
            None => SecretString::from(String::new()),
        };
        Ok(ResolvedDrive {
            id: record.id.clone(),
            name: record.name.clone(),
            kind: record.kind.clone(),
            secret,
        })
    }

    /// Resolve a drive by id; unknown ids fall back to the local drive
    pub async fn get(&self, id: &str) -> Result<ResolvedDrive, ProviderError> {
        let drives = self.drives.read().await;
        let record = drives
            .iter()
            .find(|d| d.id == id)
            .or_else(|| drives.iter().find(|d| d.id == LOCAL_DRIVE_ID))
            .cloned()
            .unwrap_or_else(DriveRecord::local);
        drop(drives);
        self.resolve(&record)
    }

    /// Add a WebDAV drive
    pub async fn add(&self, new: NewDrive) -> Result<DriveView, ProviderError> {
        let name = validate_name(&new.name)?;
        let resolved = new.resolved("");
        let key = resolved.kind.account_key();
        if new.url.trim().is_empty() || new.username.trim().is_empty() {
            return Err(ProviderError::InvalidConfig("URL and username are required".into()));
        }

        let mut drives = self.drives.write().await;
        if drives.iter().any(|d| d.kind.account_key().is_some() && d.kind.account_key() == key) {
            return Err(ProviderError::DuplicateAccount);
        }
        if drives.iter().any(|d| d.name == name) {
            return Err(ProviderError::DuplicateName(name));
        }

        let secret = self.codec.encrypt(&new.secret)?;
        let record = DriveRecord {
            id: uuid::Uuid::new_v4().to_string(),
            name,
            kind: resolved.kind,
            secret: Some(secret),
            last_known_quota: None,
            created_at: Some(chrono::Utc::now().to_rfc3339()),
        };

        let mut updated = drives.clone();
        updated.push(record.clone());
        self.persist(&updated)?;
        *drives = updated;

        info!(drive_id = %record.id, "Added drive '{}'", record.name);
        Ok(record.view(None))
    }

    /// Rename a drive
    pub async fn rename(&self, id: &str, name: &str) -> Result<DriveView, ProviderError> {
        let name = validate_name(name)?;
        let mut drives = self.drives.write().await;
        if drives.iter().any(|d| d.id != id && d.name == name) {
            return Err(ProviderError::DuplicateName(name));
        }

        let mut updated = drives.clone();
        let record = updated
            .iter_mut()
            .find(|d| d.id == id)
            .ok_or_else(|| ProviderError::NotFound(format!("drive {}", id)))?;
        record.name = name;
        let view = record.view(record.last_known_quota);

        self.persist(&updated)?;
        *drives = updated;
        info!(drive_id = %id, "Renamed drive to '{}'", view.name);
        Ok(view)
    }

    /// Remove a drive; the local drive cannot be removed
    pub async fn remove(&self, id: &str) -> Result<(), ProviderError> {
        if id == LOCAL_DRIVE_ID {
            return Err(ProviderError::AccessDenied("the local drive cannot be removed".into()));
        }
        let mut drives = self.drives.write().await;
        if !drives.iter().any(|d| d.id == id) {
            return Err(ProviderError::NotFound(format!("drive {}", id)));
        }

        let updated: Vec<DriveRecord> = drives.iter().filter(|d| d.id != id).cloned().collect();
        self.persist(&updated)?;
        *drives = updated;
        info!(drive_id = %id, "Removed drive");
        Ok(())
    }

    /// Check an unsaved drive config with a depth-0 PROPFIND
    pub async fn test_connection(&self, new: &NewDrive) -> Result<(), ProviderError> {
        let resolved = new.resolved("test");
        let backend = ProviderFactory::open(&resolved, &self.config)?;
        match tokio::time::timeout(self.config.quota_timeout(), backend.check_connection()).await {
            Ok(result) => result,
            Err(_) => Err(ProviderError::NetworkTimeout),
        }
    }

    fn persist(&self, drives: &[DriveRecord]) -> Result<(), ProviderError> {
        write_store(&self.path, drives)
    }
}

/// Write the whole list atomically (temp file + rename), 0600 on Unix
fn write_store(path: &Path, drives: &[DriveRecord]) -> Result<(), ProviderError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(drives)
        .map_err(|e| ProviderError::ParseError(e.to_string()))?;

    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, json)?;
    ensure_secure_permissions(&tmp_path)?;
    fs::rename(&tmp_path, path)?;
    debug!("Drive list saved ({} drives)", drives.len());
    Ok(())
}

fn validate_name(name: &str) -> Result<String, ProviderError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ProviderError::InvalidConfig("Drive name cannot be empty".into()));
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credential_store::SecretKey;
    use crate::test_support::TestDavServer;

    fn registry_in(dir: &std::path::Path) -> DriveRegistry {
        let config = EngineConfig::with_dirs(dir.join("sandbox"), dir.join("config"));
        let codec = CredentialCodec::new(Arc::new(SecretKey::generate()));
        DriveRegistry::open(Arc::new(config), codec).unwrap()
    }

    fn new_drive(name: &str, url: &str, user: &str) -> NewDrive {
        NewDrive {
            name: name.to_string(),
            url: url.to_string(),
            username: user.to_string(),
            secret: SecretString::from("hunter2".to_string()),
        }
    }

    #[tokio::test]
    async fn test_fresh_registry_has_only_local() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(dir.path());
        let drives = registry.list().await;
        assert_eq!(drives.len(), 1);
        assert_eq!(drives[0].id, LOCAL_DRIVE_ID);
        assert_eq!(drives[0].kind, DriveKind::Local);
        assert!(!drives[0].removable);
        assert!(dir.path().join("config").join(DRIVES_FILENAME).exists());
    }

    #[tokio::test]
    async fn test_duplicate_account_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(dir.path());
        registry
            .add(new_drive("Work", "https://dav.example.com/files/", "alice"))
            .await
            .unwrap();

        let err = registry
            .add(new_drive("Work 2", "https://dav.example.com/files", "alice"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::DuplicateAccount));

        let err = registry
            .add(new_drive("Work", "https://other.example.com", "bob"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::DuplicateName(_)));

        let remote: Vec<_> = registry
            .drives
            .read()
            .await
            .iter()
            .filter(|d| d.id != LOCAL_DRIVE_ID)
            .cloned()
            .collect();
        assert_eq!(remote.len(), 1);
    }

    #[tokio::test]
    async fn test_secret_encrypted_at_rest_and_resolved() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(dir.path());
        let view = registry
            .add(new_drive("Work", "https://dav.example.com", "alice"))
            .await
            .unwrap();

        let raw = fs::read_to_string(dir.path().join("config").join(DRIVES_FILENAME)).unwrap();
        assert!(!raw.contains("hunter2"));
        assert!(!serde_json::to_string(&view).unwrap().contains("hunter2"));

        let resolved = registry.get(&view.id).await.unwrap();
        use secrecy::ExposeSecret;
        assert_eq!(resolved.secret.expose_secret(), "hunter2");
        assert!(!format!("{:?}", resolved).contains("hunter2"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_store_permissions() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(dir.path());
        registry
            .add(new_drive("Work", "https://dav.example.com", "alice"))
            .await
            .unwrap();
        let meta = fs::metadata(dir.path().join("config").join(DRIVES_FILENAME)).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[tokio::test]
    async fn test_unknown_id_falls_back_to_local() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(dir.path());
        let resolved = registry.get("does-not-exist").await.unwrap();
        assert_eq!(resolved.id, LOCAL_DRIVE_ID);
        assert_eq!(resolved.kind, DriveKind::Local);
    }

    #[tokio::test]
    async fn test_rename_and_remove() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(dir.path());
        let a = registry.add(new_drive("A", "https://a.example.com", "u")).await.unwrap();
        registry.add(new_drive("B", "https://b.example.com", "u")).await.unwrap();

        assert!(matches!(
            registry.rename(&a.id, "B").await,
            Err(ProviderError::DuplicateName(_))
        ));
        assert_eq!(registry.rename(&a.id, "A").await.unwrap().name, "A");
        assert_eq!(registry.rename(&a.id, " Renamed ").await.unwrap().name, "Renamed");
        assert!(matches!(
            registry.rename("missing", "X").await,
            Err(ProviderError::NotFound(_))
        ));

        assert!(matches!(
            registry.remove(LOCAL_DRIVE_ID).await,
            Err(ProviderError::AccessDenied(_))
        ));
        assert!(matches!(
            registry.remove("missing").await,
            Err(ProviderError::NotFound(_))
        ));
        registry.remove(&a.id).await.unwrap();
        assert_eq!(registry.drives.read().await.len(), 2);
    }

    #[tokio::test]
    async fn test_state_survives_reopen_with_same_key() {
        let dir = tempfile::tempdir().unwrap();
        let config = Arc::new(EngineConfig::with_dirs(dir.path().join("sandbox"), dir.path().join("config")));
        let key = Arc::new(SecretKey::generate());

        let registry = DriveRegistry::open(config.clone(), CredentialCodec::new(key.clone())).unwrap();
        let view = registry.add(new_drive("Work", "https://dav.example.com", "alice")).await.unwrap();
        drop(registry);

        let reopened = DriveRegistry::open(config, CredentialCodec::new(key)).unwrap();
        let resolved = reopened.get(&view.id).await.unwrap();
        assert_eq!(resolved.name, "Work");
        assert_eq!(reopened.drives.read().await.len(), 2);
    }

    #[tokio::test]
    async fn test_unreachable_remote_does_not_fail_listing() {
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(dir.path());
        registry
            .add(new_drive("Down", "http://127.0.0.1:9/dav", "alice"))
            .await
            .unwrap();

        let drives = registry.list().await;
        assert_eq!(drives.len(), 2);
        let down = drives.iter().find(|d| d.name == "Down").unwrap();
        assert_eq!(down.quota, None);
    }

    #[tokio::test]
    async fn test_connection_against_server() {
        let server = TestDavServer::start().await;
        let dir = tempfile::tempdir().unwrap();
        let registry = registry_in(dir.path());
        registry
            .test_connection(&new_drive("T", &server.url(), "alice"))
            .await
            .unwrap();
        assert!(registry
            .test_connection(&new_drive("T", "http://127.0.0.1:9/", "alice"))
            .await
            .is_err());
    }
}
