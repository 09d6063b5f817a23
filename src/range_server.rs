//! Embedded loopback HTTP/1.1 server for local media.
//!
//! Serves sandbox files with byte ranges so a player can seek without the
//! file being loaded whole, and accepts PUT uploads into the cache subtree.
//! One request per connection (`Connection: close`).

use futures_util::StreamExt;
use http::header::{CONTENT_LENGTH, LOCATION};
use http::{HeaderMap, HeaderValue, StatusCode};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::io::ReaderStream;
use tracing::{debug, error, info, warn};

use crate::config::EngineConfig;
use crate::providers::{LocalBackend, ProviderError, StorageBackend};
use crate::range_proxy::{RangeProxy, RangeResponse};

const MAX_HEAD_BYTES: usize = 16 * 1024;
const MAX_HEADERS: usize = 100;
const ALLOWED_METHODS: &str = "GET, HEAD, PUT, OPTIONS";
/// A client that has not finished its request head by then is dropped
const HEAD_TIMEOUT: Duration = Duration::from_secs(10);

struct ServerState {
    sandbox: LocalBackend,
    cache: LocalBackend,
    /// URL prefix of the cache subtree when it lives inside the sandbox
    cache_prefix: Option<String>,
    chunk_size: usize,
}

/// Running server; dropping it without `shutdown` leaves it serving
pub struct LocalRangeServerHandle {
    addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    join: JoinHandle<()>,
}

impl LocalRangeServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// URL for a sandbox path, segments percent-encoded
    pub fn url_for(&self, path: &str) -> String {
        let encoded: Vec<String> = path
            .split('/')
            .filter(|s| !s.is_empty())
            .map(|s| urlencoding::encode(s).into_owned())
            .collect();
        format!("{}/{}", self.base_url(), encoded.join("/"))
    }

    /// Stop accepting connections and wait for the accept loop to exit
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.join).await;
    }
}

pub struct LocalRangeServer;

impl LocalRangeServer {
    /// Bind `127.0.0.1:0` and serve until shutdown
    pub async fn start(config: &EngineConfig) -> Result<LocalRangeServerHandle, ProviderError> {
        let sandbox = LocalBackend::new(&config.sandbox_root)?;
        let cache = LocalBackend::new(&config.cache_dir)?;
        let cache_prefix = cache
            .root()
            .strip_prefix(sandbox.root())
            .ok()
            .map(|rel| format!("/{}", rel.to_string_lossy().replace('\\', "/")));
        let state = Arc::new(ServerState {
            sandbox,
            cache,
            cache_prefix,
            chunk_size: config.chunk_size,
        });

        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let workers = Arc::new(Semaphore::new(config.range_server_workers.max(1)));
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        info!("Range server listening on http://{}", addr);

        let join = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, remote_addr)) => {
                                let workers = Arc::clone(&workers);
                                let state = Arc::clone(&state);
                                // Waiting for a worker slot must not stall accept or shutdown
                                tokio::spawn(async move {
                                    let Ok(_permit) = workers.acquire_owned().await else {
                                        return;
                                    };
                                    if let Err(e) = handle_connection(stream, &state).await {
                                        debug!("Connection from {} ended: {}", remote_addr, e);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Accept error: {:?}", e);
                            }
                        }
                    }
                    _ = &mut shutdown_rx => {
                        info!("Range server shutting down");
                        break;
                    }
                }
            }
        });

        Ok(LocalRangeServerHandle {
            addr,
            shutdown_tx: Some(shutdown_tx),
            join,
        })
    }
}

/// Parsed request line and headers
#[derive(Debug)]
struct RequestHead {
    method: String,
    path: String,
    headers: Vec<(String, String)>,
}

impl RequestHead {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Read the request head. `Ok(None)` means the client sent something unparsable.
async fn read_head<R>(reader: &mut R) -> std::io::Result<Option<RequestHead>>
where
    R: AsyncBufReadExt + Unpin,
{
    let mut total = 0usize;
    let mut line = String::new();

    total += reader.read_line(&mut line).await?;
    let mut parts = line.split_whitespace();
    let (Some(method), Some(target), Some(version), None) =
        (parts.next(), parts.next(), parts.next(), parts.next())
    else {
        return Ok(None);
    };
    if !version.starts_with("HTTP/1.") || !target.starts_with('/') {
        return Ok(None);
    }
    let raw_path = target.split(['?', '#']).next().unwrap_or(target);
    let Ok(path) = urlencoding::decode(raw_path) else {
        return Ok(None);
    };
    let method = method.to_string();
    let path = path.into_owned();

    let mut headers = Vec::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        total += n;
        if n == 0 || total > MAX_HEAD_BYTES || headers.len() > MAX_HEADERS {
            return Ok(None);
        }
        let trimmed = line.trim_end_matches(['\r', '\n']);
        if trimmed.is_empty() {
            break;
        }
        let Some((name, value)) = trimmed.split_once(':') else {
            return Ok(None);
        };
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(Some(RequestHead { method, path, headers }))
}

async fn handle_connection(stream: TcpStream, state: &ServerState) -> std::io::Result<()> {
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let head = match tokio::time::timeout(HEAD_TIMEOUT, read_head(&mut reader)).await {
        Ok(head) => head?,
        Err(_) => {
            debug!("Request head not received within {:?}", HEAD_TIMEOUT);
            return write_simple(&mut writer, StatusCode::REQUEST_TIMEOUT, "request head timeout").await;
        }
    };
    let Some(head) = head else {
        return write_simple(&mut writer, StatusCode::BAD_REQUEST, "malformed request").await;
    };
    debug!("{} {}", head.method, head.path);

    match head.method.as_str() {
        "GET" | "HEAD" => {
            let response = RangeProxy::fetch(&state.sandbox, &head.path, head.header("range")).await;
            write_response(&mut writer, response, head.method == "GET").await
        }
        "PUT" => handle_put(reader, &mut writer, &head, state).await,
        "OPTIONS" => {
            let mut headers = HeaderMap::new();
            headers.insert("access-control-allow-methods", HeaderValue::from_static(ALLOWED_METHODS));
            headers.insert(
                "access-control-allow-headers",
                HeaderValue::from_static("Range, Content-Type, Content-Length"),
            );
            headers.insert("access-control-max-age", HeaderValue::from_static("86400"));
            headers.insert(CONTENT_LENGTH, HeaderValue::from(0u64));
            write_head(&mut writer, StatusCode::NO_CONTENT, &headers).await
        }
        _ => {
            let mut headers = HeaderMap::new();
            headers.insert("allow", HeaderValue::from_static(ALLOWED_METHODS));
            headers.insert(CONTENT_LENGTH, HeaderValue::from(0u64));
            write_head(&mut writer, StatusCode::METHOD_NOT_ALLOWED, &headers).await
        }
    }
}

async fn handle_put<R, W>(reader: R, writer: &mut W, head: &RequestHead, state: &ServerState) -> std::io::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin,
{
    let Some(length) = head.header("content-length").and_then(|v| v.parse::<u64>().ok()) else {
        return write_simple(writer, StatusCode::BAD_REQUEST, "Content-Length required").await;
    };

    let target = match state.cache.resolve(&head.path) {
        Ok(path) => path,
        Err(e) => return write_response(writer, RangeProxy::error_response(e), true).await,
    };
    let body = Box::pin(ReaderStream::with_capacity(reader.take(length), state.chunk_size.max(1)));
    if let Err(e) = state.cache.write(&head.path, body, Some(length)).await {
        warn!("Upload to cache {} failed: {}", head.path, e);
        return write_response(writer, RangeProxy::error_response(e), true).await;
    }

    // A client that hangs up early leaves a short file
    let written = tokio::fs::metadata(&target).await.map(|m| m.len()).unwrap_or(0);
    if written != length {
        let _ = tokio::fs::remove_file(&target).await;
        return write_simple(writer, StatusCode::BAD_REQUEST, "body shorter than Content-Length").await;
    }

    info!("Cached upload {} ({} bytes)", head.path, length);
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_LENGTH, HeaderValue::from(0u64));
    if let Some(location) = cache_location(state.cache_prefix.as_deref(), &head.path) {
        if let Ok(value) = HeaderValue::from_str(&location) {
            headers.insert(LOCATION, value);
        }
    }
    write_head(writer, StatusCode::CREATED, &headers).await
}

fn cache_location(prefix: Option<&str>, path: &str) -> Option<String> {
    let prefix = prefix?;
    let joined = format!("{}/{}", prefix.trim_end_matches('/'), path.trim_start_matches('/'));
    let encoded: Vec<String> = Path::new(&joined)
        .iter()
        .filter_map(|s| s.to_str())
        .filter(|s| *s != "/" && !s.is_empty())
        .map(|s| urlencoding::encode(s).into_owned())
        .collect();
    Some(format!("/{}", encoded.join("/")))
}

async fn write_response<W>(writer: &mut W, mut response: RangeResponse, with_body: bool) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_head(writer, response.status, &response.headers).await?;
    if with_body {
        while let Some(chunk) = response.body.next().await {
            writer.write_all(&chunk?).await?;
        }
    }
    writer.flush().await
}

async fn write_simple<W>(writer: &mut W, status: StatusCode, message: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut headers = HeaderMap::new();
    headers.insert("content-type", HeaderValue::from_static("text/plain; charset=utf-8"));
    headers.insert(CONTENT_LENGTH, HeaderValue::from(message.len() as u64));
    write_head(writer, status, &headers).await?;
    writer.write_all(message.as_bytes()).await?;
    writer.flush().await
}

async fn write_head<W>(writer: &mut W, status: StatusCode, headers: &HeaderMap) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut head = format!(
        "HTTP/1.1 {} {}\r\n",
        status.as_u16(),
        status.canonical_reason().unwrap_or("")
    );
    for (name, value) in headers {
        head.push_str(name.as_str());
        head.push_str(": ");
        head.push_str(&String::from_utf8_lossy(value.as_bytes()));
        head.push_str("\r\n");
    }
    head.push_str("Access-Control-Allow-Origin: *\r\n");
    head.push_str("Access-Control-Expose-Headers: Content-Range, Content-Length, Accept-Ranges\r\n");
    head.push_str("Connection: close\r\n\r\n");
    writer.write_all(head.as_bytes()).await?;
    writer.flush().await
}
