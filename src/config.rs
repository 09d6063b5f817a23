// DriveBridge Engine Configuration
// Persistent engine settings stored as JSON next to the drive list

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const APP_DIR: &str = "drivebridge";
const CONFIG_FILENAME: &str = "config.json";

pub const DEFAULT_CHUNK_SIZE: usize = 256 * 1024;
const MIN_CHUNK_SIZE: usize = 4 * 1024;
const MAX_CHUNK_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Root of the local drive; every local path resolves inside it
    pub sandbox_root: PathBuf,
    /// Where `drives.json` and `secret.key` live
    pub config_dir: PathBuf,
    /// Upload cache subtree served by the range server's PUT
    pub cache_dir: PathBuf,
    /// Largest slice held in memory by the transfer pipeline
    pub chunk_size: usize,
    /// Progress sampling interval
    pub progress_interval_ms: u64,
    /// Budget for a remote quota lookup before the drive list gives up on it
    pub quota_timeout_ms: u64,
    /// Connect/read timeout for WebDAV requests
    pub http_timeout_secs: u64,
    /// Concurrent connections served by the local range server
    pub range_server_workers: usize,
    /// Accept self-signed WebDAV certificates
    pub accept_invalid_certs: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let config_dir = default_config_dir();
        let sandbox_root = dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("DriveBridge");
        let cache_dir = sandbox_root.join(".cache");

        Self {
            sandbox_root,
            config_dir,
            cache_dir,
            chunk_size: DEFAULT_CHUNK_SIZE,
            progress_interval_ms: 500,
            quota_timeout_ms: 2000,
            http_timeout_secs: 30,
            range_server_workers: 16,
            accept_invalid_certs: false,
        }
    }
}

impl EngineConfig {
    /// Configuration rooted in explicit directories, used by embedders and tests
    pub fn with_dirs(sandbox_root: impl Into<PathBuf>, config_dir: impl Into<PathBuf>) -> Self {
        let sandbox_root = sandbox_root.into();
        Self {
            cache_dir: sandbox_root.join(".cache"),
            sandbox_root,
            config_dir: config_dir.into(),
            ..Self::default()
        }
    }

    /// Clamp values into safe ranges
    pub fn validate(mut self) -> Self {
        self.chunk_size = self.chunk_size.clamp(MIN_CHUNK_SIZE, MAX_CHUNK_SIZE);
        self.progress_interval_ms = self.progress_interval_ms.clamp(50, 10_000);
        self.quota_timeout_ms = self.quota_timeout_ms.clamp(100, 30_000);
        self.http_timeout_secs = self.http_timeout_secs.clamp(1, 600);
        self.range_server_workers = self.range_server_workers.clamp(1, 256);
        self
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn quota_timeout(&self) -> Duration {
        Duration::from_millis(self.quota_timeout_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    pub fn drives_path(&self) -> PathBuf {
        self.config_dir.join(crate::drive_registry::DRIVES_FILENAME)
    }

    pub fn key_path(&self) -> PathBuf {
        self.config_dir.join(crate::credential_store::KEY_FILENAME)
    }
}

/// `<config_dir>/drivebridge`
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")))
        .join(APP_DIR)
}

/// Load configuration from `dir/config.json`, falling back to defaults
pub fn load_config(dir: &Path) -> EngineConfig {
    let config_path = dir.join(CONFIG_FILENAME);

    if config_path.exists() {
        match fs::read_to_string(&config_path) {
            Ok(content) => match serde_json::from_str::<EngineConfig>(&content) {
                Ok(config) => return config.validate(),
                Err(e) => {
                    tracing::warn!("Failed to parse engine config: {}", e);
                }
            },
            Err(e) => {
                tracing::warn!("Failed to read engine config: {}", e);
            }
        }
    }

    EngineConfig {
        config_dir: dir.to_path_buf(),
        ..EngineConfig::default()
    }
}

/// Save configuration to `config.config_dir/config.json` (temp file + rename)
pub fn save_config(config: &EngineConfig) -> Result<(), ConfigError> {
    fs::create_dir_all(&config.config_dir)?;
    let path = config.config_dir.join(CONFIG_FILENAME);
    let content = serde_json::to_string_pretty(config)?;

    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, content)?;
    fs::rename(&tmp_path, &path)?;

    tracing::info!("Engine config saved to {:?}", path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = EngineConfig::default();
        assert_eq!(config.chunk_size, 256 * 1024);
        assert_eq!(config.quota_timeout(), Duration::from_secs(2));
        assert!(config.cache_dir.starts_with(&config.sandbox_root));
    }

    #[test]
    fn test_validate_clamps() {
        let config = EngineConfig {
            chunk_size: 1,
            range_server_workers: 0,
            ..Default::default()
        }
        .validate();
        assert_eq!(config.chunk_size, MIN_CHUNK_SIZE);
        assert_eq!(config.range_server_workers, 1);
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = EngineConfig::with_dirs(dir.path().join("sandbox"), dir.path());
        config.chunk_size = 64 * 1024;
        save_config(&config).unwrap();

        let loaded = load_config(dir.path());
        assert_eq!(loaded.chunk_size, 64 * 1024);
        assert_eq!(loaded.sandbox_root, dir.path().join("sandbox"));
        assert!(!dir.path().join("config.json.tmp").exists());
    }

    #[test]
    fn test_partial_file_uses_defaults_for_missing_fields() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILENAME), r#"{"quota_timeout_ms": 750}"#).unwrap();
        let loaded = load_config(dir.path());
        assert_eq!(loaded.quota_timeout_ms, 750);
        assert_eq!(loaded.chunk_size, DEFAULT_CHUNK_SIZE);
    }

    #[test]
    fn test_unparsable_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(CONFIG_FILENAME), "{not json").unwrap();
        let loaded = load_config(dir.path());
        assert_eq!(loaded.config_dir, dir.path());
        assert_eq!(loaded.chunk_size, DEFAULT_CHUNK_SIZE);
    }
}
