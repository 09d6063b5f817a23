// DriveBridge - Drive Abstraction & Transfer Engine
// One operation surface over a local sandbox and remote WebDAV drives

pub mod byte_stream;
pub mod cancel;
pub mod config;
pub mod credential_store;
pub mod crypto;
pub mod drive_registry;
pub mod http_range;
pub mod logging;
pub mod providers;
pub mod range_proxy;
pub mod range_server;
pub mod stream_pipeline;
pub mod transfer;

#[cfg(test)]
mod test_support;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

pub use cancel::TaskId;
pub use config::EngineConfig;
pub use drive_registry::{DriveKind, DriveView, NewDrive, LOCAL_DRIVE_ID};
pub use providers::{ErrorInfo, ErrorKind, FileEntry, ProviderError, StorageInfo};
pub use range_proxy::RangeResponse;
pub use range_server::LocalRangeServerHandle;
pub use transfer::{TransferEvent, TransferHandle, TransferMode, TransferProgress, TransferReport, TransferState};

use cancel::CancellationRegistry;
use credential_store::{CredentialCodec, SecretKey};
use drive_registry::DriveRegistry;
use providers::{normalize_path, ProviderFactory, StorageBackend};
use range_proxy::RangeProxy;
use range_server::LocalRangeServer;
use transfer::{TransferOrchestrator, TransferPlan, TransferSource};

/// Largest number of hits a search returns
pub const SEARCH_LIMIT: usize = 500;

/// Drive id reported for host files passed to `upload`
pub const HOST_DRIVE_ID: &str = "host";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirectoryListing {
    pub path: String,
    pub files: Vec<FileEntry>,
}

/// Copy or move `items` from one drive into `dest_path` on another (or the same) drive
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferRequest {
    pub items: Vec<String>,
    pub source_drive_id: String,
    pub dest_drive_id: String,
    pub dest_path: String,
    pub mode: TransferMode,
}

/// The engine: drive registry, backends, transfers and range serving
pub struct DriveEngine {
    config: Arc<EngineConfig>,
    registry: DriveRegistry,
    cancels: Arc<CancellationRegistry>,
    orchestrator: TransferOrchestrator,
}

impl DriveEngine {
    /// Load (or create) the secret key and drive list under `config.config_dir`,
    /// creating the sandbox root if it is missing
    pub fn open(config: EngineConfig) -> Result<Self, ProviderError> {
        let config = Arc::new(config.validate());
        std::fs::create_dir_all(&config.sandbox_root).map_err(|e| ProviderError::from_io(e, "/"))?;
        let key = Arc::new(SecretKey::load_or_create(&config.key_path())?);
        let registry = DriveRegistry::open(Arc::clone(&config), CredentialCodec::new(key))?;
        let cancels = CancellationRegistry::new();
        let orchestrator = TransferOrchestrator::new(Arc::clone(&config), Arc::clone(&cancels));

        info!("Engine opened: sandbox {:?}, config {:?}", config.sandbox_root, config.config_dir);
        Ok(Self {
            config,
            registry,
            cancels,
            orchestrator,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    async fn backend(&self, drive_id: &str) -> Result<Arc<dyn StorageBackend>, ProviderError> {
        let drive = self.registry.get(drive_id).await?;
        ProviderFactory::open(&drive, &self.config)
    }

    // ============ File operations ============

    pub async fn list_directory(&self, path: &str, drive_id: &str) -> Result<DirectoryListing, ProviderError> {
        let backend = self.backend(drive_id).await?;
        let files = backend.list(path).await?;
        Ok(DirectoryListing {
            path: normalize_path(path),
            files,
        })
    }

    pub async fn create_directory(&self, path: &str, drive_id: &str) -> Result<(), ProviderError> {
        self.backend(drive_id).await?.mkdir(path).await
    }

    pub async fn delete_items(&self, paths: &[String], drive_id: &str) -> Result<(), ProviderError> {
        self.backend(drive_id).await?.delete(paths).await
    }

    /// Rename in place; returns the new path
    pub async fn rename_item(&self, path: &str, new_name: &str, drive_id: &str) -> Result<String, ProviderError> {
        self.backend(drive_id).await?.rename(path, new_name).await
    }

    /// Move within one drive
    pub async fn move_items(&self, paths: &[String], dest_dir: &str, drive_id: &str) -> Result<(), ProviderError> {
        self.backend(drive_id).await?.move_items(paths, dest_dir).await
    }

    /// Case-insensitive name search below `path`, at most [`SEARCH_LIMIT`] hits
    pub async fn search(&self, path: &str, pattern: &str, drive_id: &str) -> Result<Vec<FileEntry>, ProviderError> {
        self.backend(drive_id).await?.search(path, pattern, SEARCH_LIMIT).await
    }

    /// Raw bytes of a file honoring an HTTP `Range` header. Backend failures
    /// come back as error-shaped responses; only an unopenable drive is an `Err`.
    pub async fn read_raw(
        &self,
        path: &str,
        drive_id: &str,
        range: Option<&str>,
    ) -> Result<RangeResponse, ProviderError> {
        let backend = self.backend(drive_id).await?;
        Ok(RangeProxy::fetch(backend.as_ref(), path, range).await)
    }

    // ============ Transfers ============

    pub async fn transfer(&self, request: TransferRequest) -> Result<TransferHandle, ProviderError> {
        if request.items.is_empty() {
            return Err(ProviderError::InvalidPath("No items to transfer".to_string()));
        }
        let source = self.registry.get(&request.source_drive_id).await?;
        let dest = self.registry.get(&request.dest_drive_id).await?;
        let source_backend = ProviderFactory::open(&source, &self.config)?;
        let dest_backend = ProviderFactory::open(&dest, &self.config)?;

        let sources = request
            .items
            .iter()
            .map(|path| TransferSource {
                backend: Arc::clone(&source_backend),
                path: normalize_path(path),
            })
            .collect();

        Ok(self.orchestrator.start(TransferPlan {
            sources,
            same_drive: source.id == dest.id,
            source_drive_id: source.id,
            dest: dest_backend,
            dest_drive_id: dest.id,
            dest_dir: normalize_path(&request.dest_path),
            mode: request.mode,
        }))
    }

    /// Copy host files or folders (outside the sandbox) into `dest_path` on a drive
    pub async fn upload(
        &self,
        dest_path: &str,
        files: Vec<PathBuf>,
        drive_id: &str,
    ) -> Result<TransferHandle, ProviderError> {
        if files.is_empty() {
            return Err(ProviderError::InvalidPath("No files to upload".to_string()));
        }
        let dest = self.registry.get(drive_id).await?;
        let dest_backend = ProviderFactory::open(&dest, &self.config)?;

        let mut sources = Vec::with_capacity(files.len());
        for file in &files {
            let (Some(parent), Some(name)) = (file.parent(), file.file_name()) else {
                return Err(ProviderError::InvalidPath(file.display().to_string()));
            };
            let parent = if parent.as_os_str().is_empty() {
                std::path::Path::new(".")
            } else {
                parent
            };
            if !parent.is_dir() {
                return Err(ProviderError::NotFound(parent.display().to_string()));
            }
            // Each host file is read through a backend rooted at its own folder
            sources.push(TransferSource {
                backend: Arc::new(providers::LocalBackend::new(parent)?),
                path: format!("/{}", name.to_string_lossy()),
            });
        }

        Ok(self.orchestrator.start(TransferPlan {
            sources,
            source_drive_id: HOST_DRIVE_ID.to_string(),
            dest: dest_backend,
            dest_drive_id: dest.id,
            dest_dir: normalize_path(dest_path),
            mode: TransferMode::Copy,
            same_drive: false,
        }))
    }

    /// Flag a running request. False when it is unknown or already finished.
    pub fn cancel(&self, task_id: TaskId) -> bool {
        let found = self.cancels.cancel(task_id);
        if !found {
            warn!(task_id = %task_id, "Cancel requested for unknown transfer");
        }
        found
    }

    // ============ Drives ============

    pub async fn list_drives(&self) -> Vec<DriveView> {
        self.registry.list().await
    }

    pub async fn add_drive(&self, drive: NewDrive) -> Result<DriveView, ProviderError> {
        self.registry.add(drive).await
    }

    pub async fn rename_drive(&self, id: &str, name: &str) -> Result<DriveView, ProviderError> {
        self.registry.rename(id, name).await
    }

    pub async fn remove_drive(&self, id: &str) -> Result<(), ProviderError> {
        self.registry.remove(id).await
    }

    /// Try an unsaved drive configuration
    pub async fn test_connection(&self, drive: &NewDrive) -> Result<(), ProviderError> {
        self.registry.test_connection(drive).await
    }

    // ============ Range server ============

    pub async fn start_range_server(&self) -> Result<LocalRangeServerHandle, ProviderError> {
        LocalRangeServer::start(&self.config).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_stream::collect;
    use crate::test_support::TestDavServer;
    use secrecy::SecretString;

    fn engine_in(dir: &std::path::Path) -> DriveEngine {
        let mut config = EngineConfig::with_dirs(dir.join("sandbox"), dir.join("config"));
        config.chunk_size = 16 * 1024;
        DriveEngine::open(config).unwrap()
    }

    fn sample(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    async fn add_dav(engine: &DriveEngine, server: &TestDavServer) -> DriveView {
        engine
            .add_drive(NewDrive {
                name: "Office".to_string(),
                url: server.url(),
                username: "alice".to_string(),
                secret: SecretString::from("hunter2".to_string()),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_open_creates_key_and_store() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(dir.path());
        assert!(dir.path().join("config/secret.key").exists());
        assert!(dir.path().join("config/drives.json").exists());
        assert!(dir.path().join("sandbox").is_dir());

        let drives = engine.list_drives().await;
        assert_eq!(drives.len(), 1);
        assert_eq!(drives[0].id, LOCAL_DRIVE_ID);
        assert!(!drives[0].removable);
    }

    #[tokio::test]
    async fn test_local_file_operations() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(dir.path());

        engine.create_directory("/docs/2024", LOCAL_DRIVE_ID).await.unwrap();
        std::fs::write(dir.path().join("sandbox/docs/report.txt"), b"q3").unwrap();

        let listing = engine.list_directory("docs/", LOCAL_DRIVE_ID).await.unwrap();
        assert_eq!(listing.path, "/docs");
        assert_eq!(listing.files.len(), 2);

        let renamed = engine
            .rename_item("/docs/report.txt", "final.txt", LOCAL_DRIVE_ID)
            .await
            .unwrap();
        assert_eq!(renamed, "/docs/final.txt");

        engine
            .move_items(&["/docs/final.txt".to_string()], "/docs/2024", LOCAL_DRIVE_ID)
            .await
            .unwrap();
        assert!(dir.path().join("sandbox/docs/2024/final.txt").exists());

        let hits = engine.search("/", "FINAL", LOCAL_DRIVE_ID).await.unwrap();
        assert_eq!(hits.len(), 1);

        engine.delete_items(&["/docs".to_string()], LOCAL_DRIVE_ID).await.unwrap();
        assert!(!dir.path().join("sandbox/docs").exists());

        let escape = engine.list_directory("/../..", LOCAL_DRIVE_ID).await;
        assert!(matches!(escape, Err(ProviderError::AccessDenied(_))));
    }

    #[tokio::test]
    async fn test_transfer_between_drives_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let server = TestDavServer::start().await;
        let engine = engine_in(dir.path());
        let remote = add_dav(&engine, &server).await;

        std::fs::create_dir_all(dir.path().join("sandbox/music")).unwrap();
        std::fs::write(dir.path().join("sandbox/music/song.mp3"), sample(50_000)).unwrap();

        let handle = engine
            .transfer(TransferRequest {
                items: vec!["/music".to_string()],
                source_drive_id: LOCAL_DRIVE_ID.to_string(),
                dest_drive_id: remote.id.clone(),
                dest_path: "/backup".to_string(),
                mode: TransferMode::Copy,
            })
            .await
            .unwrap();
        let report = handle.wait().await.unwrap();
        assert!(report.is_success(), "{:?}", report.tasks);
        assert_eq!(report.count(TransferState::Done), 2);
        assert!(dir.path().join("sandbox/music/song.mp3").exists());

        let resp = engine
            .read_raw("/backup/music/song.mp3", &remote.id, Some("bytes=100-199"))
            .await
            .unwrap();
        assert_eq!(resp.status, http::StatusCode::PARTIAL_CONTENT);
        assert_eq!(resp.headers["content-range"], "bytes 100-199/50000");
        assert_eq!(collect(resp.body).await.unwrap(), &sample(50_000)[100..200]);
    }

    #[tokio::test]
    async fn test_upload_host_files() {
        let dir = tempfile::tempdir().unwrap();
        let host = tempfile::tempdir().unwrap();
        let engine = engine_in(dir.path());
        std::fs::write(host.path().join("a.bin"), sample(1000)).unwrap();
        std::fs::write(host.path().join("b.bin"), sample(10)).unwrap();

        let handle = engine
            .upload(
                "/inbox",
                vec![host.path().join("a.bin"), host.path().join("b.bin")],
                LOCAL_DRIVE_ID,
            )
            .await
            .unwrap();
        let report = handle.wait().await.unwrap();
        assert!(report.is_success(), "{:?}", report.tasks);
        assert_eq!(report.tasks[0].0.source_drive_id, HOST_DRIVE_ID);
        assert_eq!(std::fs::read(dir.path().join("sandbox/inbox/a.bin")).unwrap(), sample(1000));
        assert!(host.path().join("a.bin").exists());
    }

    #[tokio::test]
    async fn test_upload_missing_host_file_fails_alone() {
        let dir = tempfile::tempdir().unwrap();
        let host = tempfile::tempdir().unwrap();
        let engine = engine_in(dir.path());
        std::fs::write(host.path().join("ok.txt"), b"ok").unwrap();

        let handle = engine
            .upload(
                "/",
                vec![host.path().join("gone.txt"), host.path().join("ok.txt")],
                LOCAL_DRIVE_ID,
            )
            .await
            .unwrap();
        let report = handle.wait().await.unwrap();
        assert_eq!(report.count(TransferState::Error), 1);
        assert_eq!(report.count(TransferState::Done), 1);
        assert!(dir.path().join("sandbox/ok.txt").exists());
    }

    #[tokio::test]
    async fn test_empty_requests_rejected_and_unknown_cancel() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(dir.path());
        let result = engine
            .transfer(TransferRequest {
                items: Vec::new(),
                source_drive_id: LOCAL_DRIVE_ID.to_string(),
                dest_drive_id: LOCAL_DRIVE_ID.to_string(),
                dest_path: "/".to_string(),
                mode: TransferMode::Move,
            })
            .await;
        assert!(matches!(result, Err(ProviderError::InvalidPath(_))));
        assert!(!engine.cancel(TaskId::new()));
    }

    #[tokio::test]
    async fn test_drive_views_carry_no_secret() {
        let dir = tempfile::tempdir().unwrap();
        let server = TestDavServer::start().await;
        let engine = engine_in(dir.path());
        let view = add_dav(&engine, &server).await;

        let json = serde_json::to_string(&engine.list_drives().await).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(json.contains(&view.id));

        let renamed = engine.rename_drive(&view.id, "Home").await.unwrap();
        assert_eq!(renamed.name, "Home");
        engine.remove_drive(&view.id).await.unwrap();
        assert_eq!(engine.list_drives().await.len(), 1);
    }

    #[tokio::test]
    async fn test_range_server_from_engine() {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_in(dir.path());
        std::fs::write(dir.path().join("sandbox/clip.mp4"), sample(1000)).unwrap();

        let server = engine.start_range_server().await.unwrap();
        assert!(server.addr().ip().is_loopback());
        let resp = reqwest::Client::new()
            .get(server.url_for("/clip.mp4"))
            .header("Range", "bytes=-10")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 206);
        assert_eq!(resp.bytes().await.unwrap().as_ref(), &sample(1000)[990..]);
        server.shutdown().await;
    }
}
