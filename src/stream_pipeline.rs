// DriveBridge Stream Pipeline
// Moves one file between any two backends without holding more than one
// chunk in memory: direct pipes where possible, a private staging file for
// WebDAV-to-WebDAV.

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{ready, Context, Poll};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

use crate::byte_stream::{ByteStream, UpstreamBody};
use crate::cancel::CancelToken;
use crate::providers::{BackendKind, ProviderError, StorageBackend};
use crate::transfer::{TransferEvent, TransferMode, TransferProgress};

// ============ Strategy ============

/// How bytes get from the source backend to the destination backend
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferStrategy {
    /// Filesystem rename or copy, no streaming
    LocalToLocal,
    /// Local read stream PUT to the server
    LocalToRemote,
    /// GET streamed into the local file
    RemoteToLocal,
    /// Download to a staging file, then upload it
    RemoteToRemote,
}

impl TransferStrategy {
    pub fn select(source: BackendKind, dest: BackendKind) -> Self {
        match (source, dest) {
            (BackendKind::Local, BackendKind::Local) => TransferStrategy::LocalToLocal,
            (BackendKind::Local, BackendKind::WebDav) => TransferStrategy::LocalToRemote,
            (BackendKind::WebDav, BackendKind::Local) => TransferStrategy::RemoteToLocal,
            (BackendKind::WebDav, BackendKind::WebDav) => TransferStrategy::RemoteToRemote,
        }
    }

    /// Bytes the meter will count for a file of `size` (staging moves every byte twice)
    pub fn metered_bytes(&self, size: u64) -> u64 {
        match self {
            TransferStrategy::RemoteToRemote => size.saturating_mul(2),
            _ => size,
        }
    }
}

// ============ Meter ============

struct MeterItem {
    index: usize,
    name: String,
    total: u64,
    started: Instant,
    last_at: Instant,
    last_bytes: u64,
}

/// Byte counter shared by the metering streams and the progress sampler
pub struct TransferMeter {
    item_count: usize,
    bytes: AtomicU64,
    peak_chunk: AtomicUsize,
    current: Mutex<Option<MeterItem>>,
}

impl TransferMeter {
    pub fn new(item_count: usize) -> Arc<Self> {
        Arc::new(Self {
            item_count,
            bytes: AtomicU64::new(0),
            peak_chunk: AtomicUsize::new(0),
            current: Mutex::new(None),
        })
    }

    /// Start metering a file; `index` is the 1-based top-level item it belongs to
    pub fn begin_item(&self, index: usize, name: &str, total: u64) {
        let now = Instant::now();
        self.bytes.store(0, Ordering::SeqCst);
        *self.lock() = Some(MeterItem {
            index,
            name: name.to_string(),
            total,
            started: now,
            last_at: now,
            last_bytes: 0,
        });
    }

    /// Final sample for the current file, then stop reporting until the next one
    pub fn end_item(&self) -> Option<TransferProgress> {
        let sample = self.sample();
        *self.lock() = None;
        sample
    }

    /// Bytes counted without a chunk (filesystem-level copies)
    pub fn add_bytes(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::SeqCst);
    }

    fn record_chunk(&self, len: usize) {
        self.bytes.fetch_add(len as u64, Ordering::SeqCst);
        self.peak_chunk.fetch_max(len, Ordering::SeqCst);
    }

    pub fn bytes_done(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    /// Largest slice any metered stream has handed out
    pub fn peak_chunk_bytes(&self) -> usize {
        self.peak_chunk.load(Ordering::SeqCst)
    }

    /// Progress since the previous sample. `None` when no file is in flight.
    ///
    /// Speed is the byte delta over the elapsed interval, falling back to the
    /// average since the file started when nothing moved.
    pub fn sample(&self) -> Option<TransferProgress> {
        let mut guard = self.lock();
        let item = guard.as_mut()?;
        let now = Instant::now();
        let bytes = self.bytes.load(Ordering::SeqCst);

        let delta = bytes.saturating_sub(item.last_bytes);
        let elapsed = now.duration_since(item.last_at).as_secs_f64();
        let speed = if delta > 0 && elapsed > 0.0 {
            delta as f64 / elapsed
        } else {
            let total_elapsed = now.duration_since(item.started).as_secs_f64();
            if total_elapsed > 0.0 {
                bytes as f64 / total_elapsed
            } else {
                0.0
            }
        };
        item.last_at = now;
        item.last_bytes = bytes;

        Some(TransferProgress {
            item_index: item.index,
            item_count: self.item_count,
            item_name: item.name.clone(),
            speed_bps: speed as u64,
            bytes_done: bytes,
            bytes_total: item.total,
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<MeterItem>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ============ Metered Stream ============

/// Adapter every transfer body passes through: checks the cancel flag per
/// chunk, re-slices chunks larger than `chunk_size` and feeds the meter.
pub struct MeteredStream {
    inner: ByteStream,
    pending: Bytes,
    chunk_size: usize,
    meter: Arc<TransferMeter>,
    token: CancelToken,
    finished: bool,
}

impl MeteredStream {
    pub fn new(inner: ByteStream, chunk_size: usize, meter: Arc<TransferMeter>, token: CancelToken) -> Self {
        Self {
            inner,
            pending: Bytes::new(),
            chunk_size: chunk_size.max(1),
            meter,
            token,
            finished: false,
        }
    }

    pub fn boxed(self) -> ByteStream {
        Box::pin(self)
    }
}

impl Stream for MeteredStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        if this.finished {
            return Poll::Ready(None);
        }
        if this.token.is_cancelled() {
            this.finished = true;
            return Poll::Ready(Some(Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "transfer cancelled",
            ))));
        }

        while this.pending.is_empty() {
            match ready!(this.inner.as_mut().poll_next(cx)) {
                Some(Ok(chunk)) => this.pending = chunk,
                Some(Err(e)) => {
                    this.finished = true;
                    return Poll::Ready(Some(Err(e)));
                }
                None => {
                    this.finished = true;
                    return Poll::Ready(None);
                }
            }
        }

        let take = this.pending.len().min(this.chunk_size);
        let slice = this.pending.split_to(take);
        this.meter.record_chunk(slice.len());
        Poll::Ready(Some(Ok(slice)))
    }
}

// ============ Progress Sampler ============

/// Ticker task emitting `TransferEvent::Progress` on a fixed interval
pub struct ProgressSampler {
    stop_tx: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl ProgressSampler {
    pub fn spawn(
        meter: Arc<TransferMeter>,
        interval: Duration,
        events: mpsc::UnboundedSender<TransferEvent>,
    ) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Some(progress) = meter.sample() {
                            if events.send(TransferEvent::Progress(progress)).is_err() {
                                break;
                            }
                        }
                    }
                    _ = &mut stop_rx => break,
                }
            }
        });
        Self {
            stop_tx: Some(stop_tx),
            handle,
        }
    }

    pub async fn stop(mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.handle).await;
    }
}

// ============ Pipeline ============

/// One file to move between backends
pub struct FileJob<'a> {
    pub source: &'a dyn StorageBackend,
    pub source_path: &'a str,
    pub dest: &'a dyn StorageBackend,
    pub dest_path: &'a str,
    pub size: u64,
    pub mode: TransferMode,
    /// Source and destination are the same drive
    pub same_drive: bool,
}

/// Per-request byte mover. Items run sequentially, so one pipeline owns the
/// meter, the cancel flag and the staging directory of its request.
pub struct StreamPipeline {
    chunk_size: usize,
    meter: Arc<TransferMeter>,
    token: CancelToken,
    staging: Option<tempfile::TempDir>,
}

impl StreamPipeline {
    pub fn new(chunk_size: usize, meter: Arc<TransferMeter>, token: CancelToken) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            meter,
            token,
            staging: None,
        }
    }

    pub fn meter(&self) -> &Arc<TransferMeter> {
        &self.meter
    }

    /// Move one file. Returns the file size on success.
    ///
    /// A failed or cancelled write deletes whatever reached the destination;
    /// on Move the source is deleted only after the destination is complete.
    pub async fn transfer_file(&mut self, job: FileJob<'_>) -> Result<u64, ProviderError> {
        if self.token.is_cancelled() {
            return Err(ProviderError::Cancelled);
        }
        let strategy = TransferStrategy::select(job.source.kind(), job.dest.kind());
        debug!(
            "{:?} {} -> {} ({} bytes, {:?})",
            strategy, job.source_path, job.dest_path, job.size, job.mode
        );

        let result = match strategy {
            TransferStrategy::LocalToLocal => self.local_to_local(&job).await,
            TransferStrategy::LocalToRemote | TransferStrategy::RemoteToLocal => self.pipe(&job).await,
            TransferStrategy::RemoteToRemote => self.staged(&job).await,
        };

        let bytes = match result {
            Ok(bytes) => bytes,
            Err(_) if self.token.is_cancelled() => return Err(ProviderError::Cancelled),
            Err(e) => return Err(e),
        };

        let moved_by_rename = strategy == TransferStrategy::LocalToLocal
            && job.source.as_local().is_some()
            && job.dest.as_local().is_some();
        if job.mode == TransferMode::Move && !moved_by_rename {
            job.source.delete(&[job.source_path.to_string()]).await?;
        }
        Ok(bytes)
    }

    async fn local_to_local(&self, job: &FileJob<'_>) -> Result<u64, ProviderError> {
        let (Some(source), Some(dest)) = (job.source.as_local(), job.dest.as_local()) else {
            return self.pipe(job).await;
        };

        let result = if job.same_drive {
            match job.mode {
                TransferMode::Move => source.rename_within(job.source_path, job.dest_path).await.map(|_| job.size),
                TransferMode::Copy => source.copy_within(job.source_path, job.dest_path).await,
            }
        } else {
            let from = source.resolve(job.source_path)?;
            let to = dest.resolve(job.dest_path)?;
            if let Some(parent) = to.parent() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| ProviderError::from_io(e, job.dest_path))?;
            }
            match job.mode {
                TransferMode::Move => match tokio::fs::rename(&from, &to).await {
                    Ok(()) => Ok(job.size),
                    // Different filesystems: copy, then remove the source
                    Err(_) => {
                        let copied = tokio::fs::copy(&from, &to)
                            .await
                            .map_err(|e| ProviderError::from_io(e, job.dest_path))?;
                        tokio::fs::remove_file(&from)
                            .await
                            .map_err(|e| ProviderError::from_io(e, job.source_path))?;
                        Ok(copied)
                    }
                },
                TransferMode::Copy => tokio::fs::copy(&from, &to)
                    .await
                    .map_err(|e| ProviderError::from_io(e, job.dest_path)),
            }
        };

        match result {
            Ok(bytes) => {
                self.meter.add_bytes(bytes);
                Ok(bytes)
            }
            Err(e) => {
                if job.mode == TransferMode::Copy {
                    cleanup(job.dest, job.dest_path).await;
                }
                Err(e)
            }
        }
    }

    async fn pipe(&self, job: &FileJob<'_>) -> Result<u64, ProviderError> {
        let response = job.source.read(job.source_path, None).await?;
        let body = self.metered(response.body);
        match job.dest.write(job.dest_path, body, Some(job.size)).await {
            Ok(()) => Ok(job.size),
            Err(e) => {
                cleanup(job.dest, job.dest_path).await;
                Err(e)
            }
        }
    }

    async fn staged(&mut self, job: &FileJob<'_>) -> Result<u64, ProviderError> {
        let staging_dir = self.staging_dir()?;
        let staged = tempfile::Builder::new()
            .prefix("stage-")
            .tempfile_in(staging_dir)?;

        // Phase 1: download into the staging file
        let response = job.source.read(job.source_path, None).await?;
        let mut body = self.metered(response.body);
        let mut file = tokio::fs::File::from_std(staged.as_file().try_clone()?);
        let mut staged_len = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| ProviderError::NetworkError(e.to_string()))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| ProviderError::from_io(e, "staging file"))?;
            staged_len += chunk.len() as u64;
        }
        file.flush().await?;
        drop(file);

        // Phase 2: upload the staging file
        let reader = tokio::fs::File::from_std(staged.reopen()?);
        let body = self.metered(UpstreamBody::from_reader(reader));
        let result = match job.dest.write(job.dest_path, body, Some(staged_len)).await {
            Ok(()) => Ok(staged_len),
            Err(e) => {
                cleanup(job.dest, job.dest_path).await;
                Err(e)
            }
        };
        debug!("Staging file released ({} bytes)", staged_len);
        result
    }

    fn metered(&self, body: UpstreamBody) -> ByteStream {
        let stream = body.into_stream_with_capacity(self.chunk_size);
        MeteredStream::new(stream, self.chunk_size, Arc::clone(&self.meter), self.token.clone()).boxed()
    }

    fn staging_dir(&mut self) -> Result<&std::path::Path, ProviderError> {
        if self.staging.is_none() {
            let dir = tempfile::Builder::new()
                .prefix("drivebridge-stage-")
                .tempdir()?;
            self.staging = Some(dir);
        }
        match &self.staging {
            Some(dir) => Ok(dir.path()),
            None => Err(ProviderError::IoError(io::Error::other("staging directory unavailable"))),
        }
    }
}

/// Best-effort removal of a partial destination; a missing object is success
pub async fn cleanup(dest: &dyn StorageBackend, path: &str) {
    match dest.delete(&[path.to_string()]).await {
        Ok(()) => debug!("Removed partial destination {}", path),
        Err(ProviderError::NotFound(_)) => {}
        Err(e) => warn!("Failed to remove partial destination {}: {}", path, e),
    }
}
