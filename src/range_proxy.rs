//! Byte-range relay for media playback and previews.
//!
//! A `Range` header goes to the backend verbatim; the upstream status is
//! relayed unchanged along with the headers a seeking player needs. Failures
//! become HTTP-shaped responses too, so the caller can hand them straight to
//! its client.

use http::header::{
    HeaderName, ACCEPT_RANGES, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_RANGE, CONTENT_TYPE, ETAG,
    LAST_MODIFIED,
};
use http::{HeaderMap, HeaderValue, StatusCode};
use std::fmt;
use tracing::debug;

use crate::byte_stream::{ByteStream, UpstreamBody};
use crate::http_range::unsatisfied_content_range;
use crate::providers::{guess_mime, ProviderError, StorageBackend};

/// Headers copied from a successful upstream response
const RELAYED_HEADERS: [HeaderName; 6] = [
    CONTENT_LENGTH,
    CONTENT_RANGE,
    ACCEPT_RANGES,
    LAST_MODIFIED,
    ETAG,
    CACHE_CONTROL,
];

/// Status, relayable headers and a streaming body
pub struct RangeResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: ByteStream,
}

impl fmt::Debug for RangeResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RangeResponse")
            .field("status", &self.status)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

pub struct RangeProxy;

impl RangeProxy {
    /// Read `path` from `backend` honoring `range`. Never fails: backend
    /// errors come back as error responses.
    pub async fn fetch(backend: &dyn StorageBackend, path: &str, range: Option<&str>) -> RangeResponse {
        match backend.read(path, range).await {
            Ok(upstream) => {
                let mut headers = HeaderMap::new();
                for name in RELAYED_HEADERS.iter() {
                    if let Some(value) = upstream.headers.get(name) {
                        headers.insert(name.clone(), value.clone());
                    }
                }
                let content_type = upstream
                    .headers
                    .get(CONTENT_TYPE)
                    .cloned()
                    .or_else(|| HeaderValue::from_str(&guess_mime(path)).ok());
                if let Some(value) = content_type {
                    headers.insert(CONTENT_TYPE, value);
                }
                debug!("Range {:?} on {} -> {}", range, path, upstream.status);
                RangeResponse {
                    status: upstream.status,
                    headers,
                    body: upstream.body.into_stream(),
                }
            }
            Err(err) => Self::error_response(err),
        }
    }

    /// Relay an error: upstream status, `content-range`, `content-length` and
    /// body when there was an upstream response, the mapped status otherwise.
    pub fn error_response(err: ProviderError) -> RangeResponse {
        let status = err.http_status();
        let mut headers = HeaderMap::new();

        let body = match err {
            ProviderError::UpstreamError { headers: upstream, body, .. } => {
                for name in [CONTENT_RANGE, CONTENT_LENGTH] {
                    if let Some(value) = upstream.get(&name) {
                        headers.insert(name, value.clone());
                    }
                }
                body
            }
            ProviderError::RangeNotSatisfiable { size } => {
                if let Ok(value) = HeaderValue::from_str(&unsatisfied_content_range(size)) {
                    headers.insert(CONTENT_RANGE, value);
                }
                headers.insert(CONTENT_LENGTH, HeaderValue::from(0u64));
                bytes::Bytes::new()
            }
            other => {
                let message = bytes::Bytes::from(other.to_string());
                headers.insert(CONTENT_TYPE, HeaderValue::from_static("text/plain; charset=utf-8"));
                headers.insert(CONTENT_LENGTH, HeaderValue::from(message.len() as u64));
                message
            }
        };

        RangeResponse {
            status,
            headers,
            body: UpstreamBody::from_bytes(body).into_stream(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_stream::collect;
    use crate::providers::{LocalBackend, WebDavBackend, WebDavConfig};
    use crate::test_support::TestDavServer;
    use secrecy::SecretString;
    use std::time::Duration;

    fn sample() -> Vec<u8> {
        (0..1000u32).map(|i| (i % 256) as u8).collect()
    }

    fn webdav(server: &TestDavServer) -> WebDavBackend {
        WebDavBackend::new(WebDavConfig {
            url: server.url(),
            username: "u".into(),
            password: SecretString::from("p".to_string()),
            timeout: Duration::from_secs(10),
            accept_invalid_certs: false,
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_local_partial_content() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("clip.mp4"), sample()).unwrap();
        let local = LocalBackend::new(dir.path()).unwrap();

        let resp = RangeProxy::fetch(&local, "/clip.mp4", Some("bytes=100-199")).await;
        assert_eq!(resp.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(resp.headers[CONTENT_LENGTH], "100");
        assert_eq!(resp.headers[CONTENT_RANGE], "bytes 100-199/1000");
        assert_eq!(resp.headers[CONTENT_TYPE], "video/mp4");
        assert_eq!(collect(resp.body).await.unwrap(), &sample()[100..200]);
    }

    #[tokio::test]
    async fn test_local_full_clamped_and_unsatisfiable() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.bin"), sample()).unwrap();
        let local = LocalBackend::new(dir.path()).unwrap();

        let full = RangeProxy::fetch(&local, "/a.bin", None).await;
        assert_eq!(full.status, StatusCode::OK);
        assert_eq!(full.headers[ACCEPT_RANGES], "bytes");
        assert_eq!(collect(full.body).await.unwrap().len(), 1000);

        let clamped = RangeProxy::fetch(&local, "/a.bin", Some("bytes=900-5000")).await;
        assert_eq!(clamped.headers[CONTENT_RANGE], "bytes 900-999/1000");
        assert_eq!(collect(clamped.body).await.unwrap().len(), 100);

        let suffix = RangeProxy::fetch(&local, "/a.bin", Some("bytes=-10")).await;
        assert_eq!(suffix.headers[CONTENT_RANGE], "bytes 990-999/1000");

        let past = RangeProxy::fetch(&local, "/a.bin", Some("bytes=1000-")).await;
        assert_eq!(past.status, StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(past.headers[CONTENT_RANGE], "bytes */1000");
    }

    #[tokio::test]
    async fn test_local_errors_map_to_status() {
        let dir = tempfile::tempdir().unwrap();
        let local = LocalBackend::new(dir.path()).unwrap();
        assert_eq!(
            RangeProxy::fetch(&local, "/missing.bin", None).await.status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            RangeProxy::fetch(&local, "/../etc/passwd", None).await.status,
            StatusCode::FORBIDDEN
        );
    }

    #[tokio::test]
    async fn test_webdav_range_relay() {
        let server = TestDavServer::start().await;
        std::fs::write(server.root().join("song.mp3"), sample()).unwrap();
        let remote = webdav(&server);

        let resp = RangeProxy::fetch(&remote, "/song.mp3", Some("bytes=100-199")).await;
        assert_eq!(resp.status, StatusCode::PARTIAL_CONTENT);
        assert_eq!(resp.headers[CONTENT_RANGE], "bytes 100-199/1000");
        assert_eq!(resp.headers[CONTENT_LENGTH], "100");
        assert!(resp.headers.contains_key(CONTENT_TYPE));
        assert_eq!(collect(resp.body).await.unwrap(), &sample()[100..200]);

        let missing = RangeProxy::fetch(&remote, "/nope.mp3", None).await;
        assert_eq!(missing.status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_upstream_error_is_relayed() {
        let mut upstream = HeaderMap::new();
        upstream.insert(CONTENT_RANGE, HeaderValue::from_static("bytes */42"));
        let resp = RangeProxy::error_response(ProviderError::UpstreamError {
            status: 416,
            message: "Range Not Satisfiable".into(),
            headers: upstream,
            body: bytes::Bytes::from_static(b"nope"),
        });
        assert_eq!(resp.status, StatusCode::RANGE_NOT_SATISFIABLE);
        assert_eq!(resp.headers[CONTENT_RANGE], "bytes */42");
        assert_eq!(collect(resp.body).await.unwrap(), b"nope");
    }
}
