// DriveBridge Credential Codec
// Process-wide AES-256-GCM key (init once, never rotated) + reversible secret encoding
// Stored form: base64(nonce[12] || ciphertext || tag[16])

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use secrecy::{ExposeSecret, SecretBox, SecretString};
use std::fmt;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

use crate::crypto::{self, KEY_LEN, NONCE_LEN};
use crate::providers::ProviderError;

pub const KEY_FILENAME: &str = "secret.key";

// ============ Error Types ============

#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    #[error("Invalid key file: {0}")]
    InvalidKey(String),
    #[error("Encryption error: {0}")]
    Encryption(String),
    #[error("Stored secret is malformed: {0}")]
    Malformed(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CredentialError> for ProviderError {
    fn from(err: CredentialError) -> Self {
        match err {
            CredentialError::Io(e) => ProviderError::IoError(e),
            other => ProviderError::Encryption(other.to_string()),
        }
    }
}

// ============ Secret Key ============

/// The symmetric key protecting saved drive secrets.
///
/// Created once per process with [`SecretKey::load_or_create`] and shared by
/// reference. The bytes are zeroized on drop and never printed.
pub struct SecretKey {
    bytes: SecretBox<[u8; KEY_LEN]>,
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey([REDACTED])")
    }
}

impl SecretKey {
    /// Fresh random key, not persisted
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&crypto::random_bytes(KEY_LEN));
        Self { bytes: SecretBox::new(Box::new(key)) }
    }

    /// Load the key at `path`, generating and persisting it (mode 0600) if absent.
    ///
    /// Creation uses `create_new`, so two processes racing on first start end
    /// up reading the same key.
    pub fn load_or_create(path: &Path) -> Result<Self, CredentialError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent)?;
                ensure_secure_permissions(parent)?;
            }
        }

        let key = Self::generate();
        let mut options = OpenOptions::new();
        options.write(true).create_new(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }

        match options.open(path) {
            Ok(mut file) => {
                file.write_all(BASE64.encode(key.bytes.expose_secret()).as_bytes())?;
                file.sync_all()?;
                info!("Generated new secret key at {:?}", path);
                Ok(key)
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Self::load(path),
            Err(e) => Err(e.into()),
        }
    }

    fn load(path: &Path) -> Result<Self, CredentialError> {
        let encoded = std::fs::read_to_string(path)?;
        let raw = BASE64
            .decode(encoded.trim())
            .map_err(|e| CredentialError::InvalidKey(e.to_string()))?;
        if raw.len() != KEY_LEN {
            return Err(CredentialError::InvalidKey(format!(
                "expected {} bytes, found {}",
                KEY_LEN,
                raw.len()
            )));
        }
        let mut key = [0u8; KEY_LEN];
        key.copy_from_slice(&raw);
        Ok(Self { bytes: SecretBox::new(Box::new(key)) })
    }

    fn expose(&self) -> &[u8; KEY_LEN] {
        self.bytes.expose_secret()
    }
}

// ============ Codec ============

/// Encrypts drive secrets for storage and decrypts them on demand
#[derive(Debug, Clone)]
pub struct CredentialCodec {
    key: Arc<SecretKey>,
}

impl CredentialCodec {
    pub fn new(key: Arc<SecretKey>) -> Self {
        Self { key }
    }

    /// Encrypt a secret into its stored form
    pub fn encrypt(&self, secret: &SecretString) -> Result<String, CredentialError> {
        let nonce = crypto::random_bytes(NONCE_LEN);
        let ciphertext = crypto::encrypt_aes_gcm(
            self.key.expose(),
            &nonce,
            secret.expose_secret().as_bytes(),
        )
        .map_err(CredentialError::Encryption)?;

        let mut packed = nonce;
        packed.extend_from_slice(&ciphertext);
        Ok(BASE64.encode(packed))
    }

    /// Decrypt a stored secret. Fails on a wrong key or tampered data.
    pub fn decrypt(&self, stored: &str) -> Result<SecretString, CredentialError> {
        let packed = BASE64
            .decode(stored.trim())
            .map_err(|e| CredentialError::Malformed(e.to_string()))?;
        if packed.len() <= NONCE_LEN {
            return Err(CredentialError::Malformed("ciphertext too short".into()));
        }
        let (nonce, ciphertext) = packed.split_at(NONCE_LEN);
        let plain = crypto::decrypt_aes_gcm(self.key.expose(), nonce, ciphertext)
            .map_err(CredentialError::Encryption)?;
        let plain = String::from_utf8(plain)
            .map_err(|_| CredentialError::Malformed("secret is not UTF-8".into()))?;
        Ok(SecretString::from(plain))
    }
}

// ============ Permission Hardening ============

/// Ensure secure file/directory permissions (0o600 files, 0o700 dirs on Unix)
pub fn ensure_secure_permissions(path: &Path) -> Result<(), CredentialError> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mode = if path.is_dir() { 0o700 } else { 0o600 };
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    {
        let _ = path;
    }
    Ok(())
}
