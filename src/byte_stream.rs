// DriveBridge byte sources
// One push-based stream shape for every body that flows through the engine

use bytes::Bytes;
use futures_util::stream::{self, Stream, StreamExt};
use std::io;
use std::pin::Pin;
use tokio::io::AsyncRead;
use tokio_util::io::ReaderStream;

/// Boxed stream of byte chunks used for every transfer and range body
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send>>;

/// Body of a backend read. Local files come back as readers, HTTP bodies as
/// chunk streams; `into_stream` gives callers a single shape.
pub enum UpstreamBody {
    Reader(Pin<Box<dyn AsyncRead + Send>>),
    Stream(ByteStream),
    Empty,
}

impl UpstreamBody {
    pub fn from_reader<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        UpstreamBody::Reader(Box::pin(reader))
    }

    pub fn from_response(response: reqwest::Response) -> Self {
        UpstreamBody::Stream(Box::pin(
            response.bytes_stream().map(|chunk| chunk.map_err(io::Error::other)),
        ))
    }

    pub fn from_bytes(bytes: Bytes) -> Self {
        if bytes.is_empty() {
            UpstreamBody::Empty
        } else {
            UpstreamBody::Stream(Box::pin(stream::once(async move { Ok(bytes) })))
        }
    }

    /// Normalize into a chunk stream; reader chunks are at most `capacity` bytes
    pub fn into_stream_with_capacity(self, capacity: usize) -> ByteStream {
        match self {
            UpstreamBody::Reader(reader) => {
                Box::pin(ReaderStream::with_capacity(reader, capacity.max(1)))
            }
            UpstreamBody::Stream(s) => s,
            UpstreamBody::Empty => Box::pin(stream::empty()),
        }
    }

    pub fn into_stream(self) -> ByteStream {
        self.into_stream_with_capacity(64 * 1024)
    }
}

/// Drain a stream into memory. Only for small bodies (error pages, tests).
pub async fn collect(mut body: ByteStream) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    while let Some(chunk) = body.next().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(out)
}
