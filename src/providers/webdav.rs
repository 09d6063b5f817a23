//! WebDAV Storage Backend
//!
//! Implementation of the StorageBackend trait for WebDAV servers (Nextcloud,
//! ownCloud, Synology, Apache mod_dav, ...).
//!
//! WebDAV extends HTTP with PROPFIND, MKCOL and MOVE; reads and writes are
//! plain GET/PUT with streaming bodies so nothing is buffered whole.

use async_trait::async_trait;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE, RANGE};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use std::borrow::Cow;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::multistatus::{parse_multistatus, DavResponse};
use super::{
    base_name, guess_mime, join_path, normalize_path, parent_path, validate_entry_name,
    BackendKind, FileEntry, ProviderError, ReadResponse, StorageBackend, StorageInfo,
    DIRECTORY_MIME,
};
use crate::byte_stream::{ByteStream, UpstreamBody};

/// Custom HTTP methods for WebDAV
mod webdav_methods {
    use reqwest::Method;

    pub fn propfind() -> Method {
        Method::from_bytes(b"PROPFIND").unwrap_or(Method::GET)
    }

    pub fn mkcol() -> Method {
        Method::from_bytes(b"MKCOL").unwrap_or(Method::PUT)
    }

    pub fn move_method() -> Method {
        Method::from_bytes(b"MOVE").unwrap_or(Method::POST)
    }
}

const PROPFIND_ENTRIES: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:">
    <d:prop>
        <d:resourcetype/>
        <d:getcontentlength/>
        <d:getlastmodified/>
        <d:getcontenttype/>
        <d:getetag/>
    </d:prop>
</d:propfind>"#;

const PROPFIND_QUOTA: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:">
    <d:prop>
        <d:quota-available-bytes/>
        <d:quota-used-bytes/>
    </d:prop>
</d:propfind>"#;

/// WebDAV-specific configuration
#[derive(Debug, Clone)]
pub struct WebDavConfig {
    /// Full URL to the WebDAV root (e.g. https://cloud.example.com/remote.php/dav/files/user/)
    pub url: String,
    pub username: String,
    pub password: SecretString,
    /// Connect and read timeout
    pub timeout: Duration,
    /// Accept self-signed certificates
    pub accept_invalid_certs: bool,
}

/// WebDAV Storage Backend
pub struct WebDavBackend {
    config: WebDavConfig,
    client: Client,
    /// Decoded path component of the base URL, without trailing slash
    base_path: String,
}

impl WebDavBackend {
    pub fn new(config: WebDavConfig) -> Result<Self, ProviderError> {
        let parsed = url::Url::parse(&config.url)
            .map_err(|e| ProviderError::InvalidConfig(format!("Invalid WebDAV URL: {}", e)))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ProviderError::InvalidConfig(format!(
                "Unsupported URL scheme: {}",
                parsed.scheme()
            )));
        }
        let base_path = decode_lossy(parsed.path()).trim_end_matches('/').to_string();

        // No whole-request timeout: a large GET/PUT may legitimately run for hours
        let client = Client::builder()
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .connect_timeout(config.timeout)
            .read_timeout(config.timeout)
            .build()
            .map_err(|e| ProviderError::InvalidConfig(format!("HTTP client: {}", e)))?;

        Ok(Self { config, client, base_path })
    }

    /// Build the full URL for a backend path. Each segment is decoded then
    /// re-encoded, so already-encoded input is not double-encoded.
    fn build_url(&self, path: &str) -> String {
        let base = self.config.url.trim_end_matches('/');
        let encoded: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| urlencoding::encode(&decode_lossy(s)).into_owned())
            .collect();
        if encoded.is_empty() {
            format!("{}/", base)
        } else {
            format!("{}/{}", base, encoded.join("/"))
        }
    }

    /// Map an href from a multistatus body back to a backend path
    fn href_to_path(&self, href: &str) -> String {
        let raw_path = if href.starts_with("http://") || href.starts_with("https://") {
            url::Url::parse(href)
                .map(|u| u.path().to_string())
                .unwrap_or_else(|_| href.to_string())
        } else {
            href.to_string()
        };
        let decoded = decode_lossy(&raw_path);
        let relative = decoded
            .strip_prefix(self.base_path.as_str())
            .unwrap_or(&decoded);
        normalize_path(relative)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, self.build_url(path))
            .basic_auth(&self.config.username, Some(self.config.password.expose_secret()))
    }

    async fn propfind(&self, path: &str, depth: &str, body: &'static str) -> Result<Vec<DavResponse>, ProviderError> {
        let response = self
            .request(webdav_methods::propfind(), path)
            .header("Depth", depth)
            .header(CONTENT_TYPE, "application/xml; charset=utf-8")
            .body(body)
            .send()
            .await
            .map_err(map_send_error)?;

        match response.status() {
            StatusCode::OK | StatusCode::MULTI_STATUS => {
                let xml = response
                    .text()
                    .await
                    .map_err(|e| ProviderError::ParseError(e.to_string()))?;
                debug!("[WebDAV] PROPFIND {} depth {}: {} bytes", path, depth, xml.len());
                parse_multistatus(&xml)
            }
            _ => Err(error_from_response(response, path).await),
        }
    }

    fn entry_from_response(&self, resp: &DavResponse, path: String) -> FileEntry {
        let name = base_name(&path);
        let mut entry = if resp.is_collection {
            FileEntry::directory(name, path)
        } else {
            let mut entry = FileEntry::file(name, path, resp.content_length.unwrap_or(0));
            if let Some(ct) = resp.content_type.as_deref() {
                let essence = ct.split(';').next().unwrap_or(ct).trim();
                if !essence.is_empty() && essence != DIRECTORY_MIME {
                    entry.mime_type = essence.to_string();
                }
            }
            entry
        };
        entry.mtime = resp.last_modified.clone();
        entry
    }

    async fn mkcol(&self, path: &str) -> Result<(), ProviderError> {
        let response = self
            .request(webdav_methods::mkcol(), path)
            .send()
            .await
            .map_err(map_send_error)?;

        match response.status() {
            StatusCode::CREATED | StatusCode::OK => Ok(()),
            // RFC 4918: 405 on MKCOL means the resource already exists
            StatusCode::METHOD_NOT_ALLOWED => Ok(()),
            StatusCode::CONFLICT => Err(ProviderError::NotFound(parent_path(path))),
            _ => Err(error_from_response(response, path).await),
        }
    }

    async fn move_to(&self, from: &str, to: &str) -> Result<(), ProviderError> {
        let destination = self.build_url(to);
        let response = self
            .request(webdav_methods::move_method(), from)
            .header("Destination", destination)
            .header("Overwrite", "T")
            .send()
            .await
            .map_err(map_send_error)?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT => {
                info!("[WebDAV] Moved {} -> {}", from, to);
                Ok(())
            }
            _ => Err(error_from_response(response, from).await),
        }
    }
}

fn decode_lossy(s: &str) -> Cow<'_, str> {
    urlencoding::decode(s).unwrap_or(Cow::Borrowed(s))
}

fn map_send_error(e: reqwest::Error) -> ProviderError {
    if e.is_timeout() {
        ProviderError::NetworkTimeout
    } else {
        ProviderError::NetworkError(e.without_url().to_string())
    }
}

/// Turn a non-success response into the error taxonomy, keeping the status,
/// headers and body for callers that relay them.
async fn error_from_response(response: Response, path: &str) -> ProviderError {
    let status = response.status();
    let headers = response.headers().clone();
    let body = response.bytes().await.unwrap_or_default();
    warn!("[WebDAV] {} failed with {}", path, status);

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            ProviderError::AccessDenied(format!("{} ({})", path, status))
        }
        StatusCode::NOT_FOUND => ProviderError::NotFound(path.to_string()),
        StatusCode::INSUFFICIENT_STORAGE => ProviderError::StorageFull,
        _ => {
            let snippet: String = String::from_utf8_lossy(&body).chars().take(200).collect();
            let message = if snippet.trim().is_empty() {
                status.canonical_reason().unwrap_or("error").to_string()
            } else {
                snippet.trim().to_string()
            };
            ProviderError::UpstreamError {
                status: status.as_u16(),
                message,
                headers,
                body,
            }
        }
    }
}

#[async_trait]
impl StorageBackend for WebDavBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::WebDav
    }

    async fn list(&self, path: &str) -> Result<Vec<FileEntry>, ProviderError> {
        let target = normalize_path(path);
        let responses = self.propfind(&target, "1", PROPFIND_ENTRIES).await?;

        let mut entries = Vec::new();
        for resp in &responses {
            let entry_path = self.href_to_path(&resp.href);
            // The collection reports itself alongside its children
            if entry_path == target {
                continue;
            }
            let name = base_name(&entry_path);
            if name.is_empty() || name.starts_with('.') {
                continue;
            }
            entries.push(self.entry_from_response(resp, entry_path));
        }
        debug!("[WebDAV] Listed {} entries in {}", entries.len(), target);
        Ok(entries)
    }

    async fn stat(&self, path: &str) -> Result<FileEntry, ProviderError> {
        let target = normalize_path(path);
        let responses = self.propfind(&target, "0", PROPFIND_ENTRIES).await?;
        let resp = responses
            .first()
            .ok_or_else(|| ProviderError::ParseError(format!("Empty PROPFIND response for {}", target)))?;
        Ok(self.entry_from_response(resp, target))
    }

    async fn mkdir(&self, path: &str) -> Result<(), ProviderError> {
        let target = normalize_path(path);
        if target == "/" {
            return Ok(());
        }
        match self.mkcol(&target).await {
            Err(ProviderError::NotFound(_)) => {
                // Parent chain missing: create it top-down
                let mut current = String::from("/");
                for segment in target.split('/').filter(|s| !s.is_empty()) {
                    current = join_path(&current, segment);
                    self.mkcol(&current).await?;
                }
                Ok(())
            }
            other => other,
        }
    }

    async fn delete(&self, paths: &[String]) -> Result<(), ProviderError> {
        for path in paths {
            let target = normalize_path(path);
            if target == "/" {
                return Err(ProviderError::AccessDenied(target));
            }
            let response = self
                .request(Method::DELETE, &target)
                .send()
                .await
                .map_err(map_send_error)?;
            match response.status() {
                StatusCode::OK | StatusCode::NO_CONTENT | StatusCode::ACCEPTED => {
                    info!("[WebDAV] Deleted {}", target);
                }
                _ => return Err(error_from_response(response, &target).await),
            }
        }
        Ok(())
    }

    async fn rename(&self, path: &str, new_name: &str) -> Result<String, ProviderError> {
        validate_entry_name(new_name)?;
        let from = normalize_path(path);
        let to = join_path(&parent_path(&from), new_name);
        self.move_to(&from, &to).await?;
        Ok(to)
    }

    async fn move_items(&self, paths: &[String], dest_dir: &str) -> Result<(), ProviderError> {
        for path in paths {
            let from = normalize_path(path);
            let name = base_name(&from);
            validate_entry_name(&name)?;
            self.move_to(&from, &join_path(dest_dir, &name)).await?;
        }
        Ok(())
    }

    async fn read(&self, path: &str, range: Option<&str>) -> Result<ReadResponse, ProviderError> {
        let target = normalize_path(path);
        let mut request = self.request(Method::GET, &target);
        if let Some(range) = range {
            request = request.header(RANGE, range);
        }
        let response = request.send().await.map_err(map_send_error)?;

        let status = response.status();
        if status.is_success() {
            Ok(ReadResponse {
                status,
                headers: response.headers().clone(),
                body: UpstreamBody::from_response(response),
            })
        } else {
            Err(error_from_response(response, &target).await)
        }
    }

    async fn write(&self, path: &str, body: ByteStream, size_hint: Option<u64>) -> Result<(), ProviderError> {
        let target = normalize_path(path);
        let mut request = self
            .request(Method::PUT, &target)
            .header(CONTENT_TYPE, guess_mime(&target));
        if let Some(len) = size_hint {
            request = request.header(CONTENT_LENGTH, len);
        }

        let response = request
            .body(reqwest::Body::wrap_stream(body))
            .send()
            .await
            .map_err(map_send_error)?;

        match response.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::NO_CONTENT => {
                debug!("[WebDAV] Uploaded {}", target);
                Ok(())
            }
            _ => Err(error_from_response(response, &target).await),
        }
    }

    async fn storage_info(&self) -> Result<Option<StorageInfo>, ProviderError> {
        // RFC 4331 quota properties; servers that omit both report "unknown"
        let responses = self.propfind("/", "0", PROPFIND_QUOTA).await?;
        let Some(resp) = responses.first() else {
            return Ok(None);
        };
        match (resp.quota_used, resp.quota_available) {
            (None, None) => Ok(None),
            (used, free) => {
                let used = used.unwrap_or(0);
                let free = free.unwrap_or(0);
                Ok(Some(StorageInfo { used, total: used + free, free }))
            }
        }
    }

    async fn search(&self, path: &str, pattern: &str, limit: usize) -> Result<Vec<FileEntry>, ProviderError> {
        // Current directory only: a recursive PROPFIND walk is too costly on large remotes
        let needle = pattern.to_lowercase();
        let mut results: Vec<FileEntry> = self
            .list(path)
            .await?
            .into_iter()
            .filter(|e| e.name.to_lowercase().contains(&needle))
            .collect();
        results.truncate(limit);
        Ok(results)
    }

    async fn check_connection(&self) -> Result<(), ProviderError> {
        let responses = self
            .propfind("/", "0", PROPFIND_ENTRIES)
            .await?;
        info!(
            "[WebDAV] Connection OK for {} ({} props)",
            self.config.url,
            responses.len()
        );
        Ok(())
    }
}
