// DriveBridge Transfer Orchestrator
// Expands requested items into per-file jobs with an explicit worklist and
// runs them through the stream pipeline, one request per tokio task.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cancel::{CancelToken, CancellationRegistry, TaskId};
use crate::config::EngineConfig;
use crate::providers::{
    base_name, join_path, normalize_path, parent_path, ErrorInfo, ProviderError, StorageBackend,
};
use crate::stream_pipeline::{FileJob, ProgressSampler, StreamPipeline, TransferMeter, TransferStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferMode {
    Copy,
    Move,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferState {
    Pending,
    Active,
    Done,
    Error,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransferState::Done | TransferState::Error | TransferState::Cancelled)
    }
}

/// One file or directory handled by a request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransferTask {
    /// Id of the request this task belongs to
    pub id: TaskId,
    pub source_drive_id: String,
    pub dest_drive_id: String,
    pub source_path: String,
    pub dest_path: String,
    pub mode: TransferMode,
    pub state: TransferState,
    pub is_directory: bool,
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub speed_bps: u64,
}

/// Progress sample for the file currently in flight
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferProgress {
    /// 1-based index of the requested top-level item
    pub item_index: usize,
    pub item_count: usize,
    pub item_name: String,
    pub speed_bps: u64,
    pub bytes_done: u64,
    pub bytes_total: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum TransferEvent {
    /// A file entered the pipeline (state `Active`)
    ItemStarted(TransferTask),
    Progress(TransferProgress),
    ItemFinished(TransferTask, Option<ErrorInfo>),
}

/// Every task of a finished request with its terminal state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferReport {
    pub id: TaskId,
    pub tasks: Vec<(TransferTask, Option<ErrorInfo>)>,
    /// Largest slice the pipeline held for this request
    pub peak_chunk_bytes: usize,
}

impl TransferReport {
    pub fn count(&self, state: TransferState) -> usize {
        self.tasks.iter().filter(|(t, _)| t.state == state).count()
    }

    pub fn is_success(&self) -> bool {
        self.tasks.iter().all(|(t, _)| t.state == TransferState::Done)
    }

    pub fn errors(&self) -> impl Iterator<Item = &ErrorInfo> {
        self.tasks.iter().filter_map(|(_, e)| e.as_ref())
    }
}

/// A running request: its id, the event channel and the task producing the report
pub struct TransferHandle {
    pub id: TaskId,
    pub events: mpsc::UnboundedReceiver<TransferEvent>,
    pub join: JoinHandle<TransferReport>,
}

impl TransferHandle {
    /// Wait for the report, discarding any events not yet received
    pub async fn wait(self) -> Result<TransferReport, ProviderError> {
        drop(self.events);
        self.join
            .await
            .map_err(|e| ProviderError::IoError(std::io::Error::other(e)))
    }
}

/// A requested top-level item and the backend it is read from
#[derive(Clone)]
pub struct TransferSource {
    pub backend: Arc<dyn StorageBackend>,
    pub path: String,
}

/// Everything one request needs, with backends already opened
pub struct TransferPlan {
    pub sources: Vec<TransferSource>,
    pub source_drive_id: String,
    pub dest: Arc<dyn StorageBackend>,
    pub dest_drive_id: String,
    pub dest_dir: String,
    pub mode: TransferMode,
    /// Source and destination are the same drive
    pub same_drive: bool,
}

/// Worklist entries. A directory pushes its `FinishDir` below its children so
/// it runs after all of them.
enum Job {
    Entry {
        source: usize,
        path: String,
        dest_dir: String,
        ancestors: Vec<usize>,
    },
    FinishDir {
        source: usize,
        path: String,
        dest_path: String,
        dir: usize,
        ancestors: Vec<usize>,
    },
}

/// Starts requests and tracks their cancel tokens
#[derive(Clone)]
pub struct TransferOrchestrator {
    config: Arc<EngineConfig>,
    cancels: Arc<CancellationRegistry>,
}

impl TransferOrchestrator {
    pub fn new(config: Arc<EngineConfig>, cancels: Arc<CancellationRegistry>) -> Self {
        Self { config, cancels }
    }

    /// Spawn a request. Items run sequentially inside it; separate requests run concurrently.
    pub fn start(&self, plan: TransferPlan) -> TransferHandle {
        let id = TaskId::new();
        let guard = self.cancels.register(id);
        let (tx, rx) = mpsc::unbounded_channel();
        let config = Arc::clone(&self.config);

        info!(
            task_id = %id,
            "Transfer started: {} item(s) {} -> {} ({:?})",
            plan.sources.len(),
            plan.source_drive_id,
            plan.dest_drive_id,
            plan.mode
        );

        let join = tokio::spawn(async move {
            let meter = TransferMeter::new(plan.sources.len());
            let sampler = ProgressSampler::spawn(Arc::clone(&meter), config.progress_interval(), tx.clone());
            let pipeline = StreamPipeline::new(config.chunk_size, Arc::clone(&meter), guard.token().clone());

            let mut run = Run {
                id,
                plan: &plan,
                pipeline,
                token: guard.token().clone(),
                events: tx,
                tasks: Vec::new(),
                dir_failures: Vec::new(),
            };
            run.execute().await;

            sampler.stop().await;
            let report = TransferReport {
                id,
                tasks: run.tasks,
                peak_chunk_bytes: meter.peak_chunk_bytes(),
            };
            info!(
                task_id = %id,
                "Transfer finished: {} done, {} failed, {} cancelled",
                report.count(TransferState::Done),
                report.count(TransferState::Error),
                report.count(TransferState::Cancelled)
            );
            // Token stays registered until the report exists
            drop(guard);
            report
        });

        TransferHandle { id, events: rx, join }
    }
}

/// Reject same-drive requests that would land on the source or inside it
fn check_same_drive_target(path: &str, dest_dir: &str, mode: TransferMode) -> Result<(), ProviderError> {
    if path == "/" || dest_dir == path || dest_dir.starts_with(&format!("{}/", path)) {
        return Err(ProviderError::InvalidPath(format!(
            "Cannot transfer {} into itself",
            path
        )));
    }
    if mode == TransferMode::Copy && parent_path(path) == dest_dir {
        return Err(ProviderError::InvalidPath(format!(
            "{} is already in {}",
            path, dest_dir
        )));
    }
    Ok(())
}

/// State of one executing request
struct Run<'a> {
    id: TaskId,
    plan: &'a TransferPlan,
    pipeline: StreamPipeline,
    token: CancelToken,
    events: mpsc::UnboundedSender<TransferEvent>,
    tasks: Vec<(TransferTask, Option<ErrorInfo>)>,
    /// Failed-descendant counters, one per expanded directory
    dir_failures: Vec<usize>,
}

impl Run<'_> {
    async fn execute(&mut self) {
        let plan = self.plan;
        let dest_dir = normalize_path(&plan.dest_dir);
        if !self.token.is_cancelled() {
            if let Err(e) = plan.dest.mkdir(&dest_dir).await {
                warn!(task_id = %self.id, "Cannot create destination {}: {}", dest_dir, e);
            }
        }
        for (index, source) in plan.sources.iter().enumerate() {
            let path = normalize_path(&source.path);
            if plan.same_drive {
                if let Err(e) = check_same_drive_target(&path, &dest_dir, plan.mode) {
                    let dest_path = join_path(&dest_dir, &base_name(&path));
                    let task = self.new_task(&path, &dest_path, false, 0);
                    self.finish(task, Err(e));
                    continue;
                }
            }
            if plan.same_drive && plan.mode == TransferMode::Move {
                self.move_in_place(index, &path).await;
                continue;
            }

            let mut worklist = vec![Job::Entry {
                source: index,
                path,
                dest_dir: dest_dir.clone(),
                ancestors: Vec::new(),
            }];
            while let Some(job) = worklist.pop() {
                match job {
                    Job::Entry { source, path, dest_dir, ancestors } => {
                        self.entry(source, path, dest_dir, ancestors, &mut worklist).await;
                    }
                    Job::FinishDir { source, path, dest_path, dir, ancestors } => {
                        self.finish_dir(source, path, dest_path, dir, ancestors).await;
                    }
                }
            }
        }
    }

    /// Same-drive move: one backend-level move, no byte copying
    async fn move_in_place(&mut self, index: usize, path: &str) {
        let plan = self.plan;
        let backend = &plan.sources[index].backend;
        let dest_dir = normalize_path(&plan.dest_dir);
        let dest_path = join_path(&dest_dir, &base_name(path));
        let mut task = self.new_task(path, &dest_path, false, 0);

        let result = if self.token.is_cancelled() {
            Err(ProviderError::Cancelled)
        } else if parent_path(path) == dest_dir {
            Ok(())
        } else {
            backend.move_items(&[path.to_string()], &dest_dir).await
        };
        if let Ok(entry) = plan.dest.stat(&dest_path).await {
            task.bytes_total = entry.size;
            task.bytes_done = entry.size;
        }
        self.finish(task, result);
    }

    async fn entry(
        &mut self,
        source: usize,
        path: String,
        dest_dir: String,
        ancestors: Vec<usize>,
        worklist: &mut Vec<Job>,
    ) {
        let plan = self.plan;
        let backend = Arc::clone(&plan.sources[source].backend);
        let name = base_name(&path);
        let dest_path = join_path(&dest_dir, &name);

        if self.token.is_cancelled() {
            let task = self.new_task(&path, &dest_path, false, 0);
            self.fail_ancestors(&ancestors);
            self.finish(task, Err(ProviderError::Cancelled));
            return;
        }

        let entry = match backend.stat(&path).await {
            Ok(entry) => entry,
            Err(e) => {
                let task = self.new_task(&path, &dest_path, false, 0);
                self.fail_ancestors(&ancestors);
                self.finish(task, Err(e));
                return;
            }
        };

        if entry.is_directory {
            let expanded = match plan.dest.mkdir(&dest_path).await {
                Ok(()) => backend.list(&path).await,
                Err(e) => Err(e),
            };
            let children = match expanded {
                Ok(children) => children,
                Err(e) => {
                    let task = self.new_task(&path, &dest_path, true, 0);
                    self.fail_ancestors(&ancestors);
                    self.finish(task, Err(e));
                    return;
                }
            };

            let dir = self.dir_failures.len();
            self.dir_failures.push(0);
            let mut child_ancestors = ancestors.clone();
            child_ancestors.push(dir);
            debug!("Expanding {} ({} children)", path, children.len());

            worklist.push(Job::FinishDir {
                source,
                path: path.clone(),
                dest_path: dest_path.clone(),
                dir,
                ancestors,
            });
            for child in children.into_iter().rev() {
                worklist.push(Job::Entry {
                    source,
                    path: child.path,
                    dest_dir: dest_path.clone(),
                    ancestors: child_ancestors.clone(),
                });
            }
            return;
        }

        let strategy = TransferStrategy::select(backend.kind(), plan.dest.kind());
        let mut task = self.new_task(&path, &dest_path, false, entry.size);
        task.state = TransferState::Active;
        let _ = self.events.send(TransferEvent::ItemStarted(task.clone()));
        self.pipeline
            .meter()
            .begin_item(source + 1, &name, strategy.metered_bytes(entry.size));

        let result = self
            .pipeline
            .transfer_file(FileJob {
                source: backend.as_ref(),
                source_path: &path,
                dest: plan.dest.as_ref(),
                dest_path: &dest_path,
                size: entry.size,
                mode: plan.mode,
                same_drive: plan.same_drive,
            })
            .await;

        if let Some(progress) = self.pipeline.meter().end_item() {
            task.speed_bps = progress.speed_bps;
            let _ = self.events.send(TransferEvent::Progress(progress));
        }
        match &result {
            Ok(bytes) => task.bytes_done = *bytes,
            Err(_) => self.fail_ancestors(&ancestors),
        }
        self.finish(task, result.map(|_| ()));
    }

    async fn finish_dir(
        &mut self,
        source: usize,
        path: String,
        dest_path: String,
        dir: usize,
        ancestors: Vec<usize>,
    ) {
        let plan = self.plan;
        let task = self.new_task(&path, &dest_path, true, 0);
        let failed = self.dir_failures[dir];

        if failed > 0 {
            self.fail_ancestors(&ancestors);
            let state = if self.token.is_cancelled() {
                TransferState::Cancelled
            } else {
                TransferState::Error
            };
            let info = ErrorInfo::incomplete(&plan.source_drive_id, &path, failed);
            self.push(task, state, Some(info));
            return;
        }

        let result = match plan.mode {
            TransferMode::Move => self.remove_source_dir(source, &path).await,
            TransferMode::Copy => Ok(()),
        };
        if result.is_err() {
            self.fail_ancestors(&ancestors);
        }
        self.finish(task, result);
    }

    /// Delete a moved source directory, keeping it if hidden entries were left behind
    async fn remove_source_dir(&self, source: usize, path: &str) -> Result<(), ProviderError> {
        let backend = &self.plan.sources[source].backend;
        if let Some(local) = backend.as_local() {
            let abs = local.resolve(path)?;
            let leftover = std::fs::read_dir(&abs)
                .map(|mut entries| entries.next().is_some())
                .unwrap_or(false);
            if leftover {
                warn!("Keeping {}: hidden entries were not moved", path);
                return Ok(());
            }
        }
        backend.delete(&[path.to_string()]).await
    }

    fn fail_ancestors(&mut self, ancestors: &[usize]) {
        for &dir in ancestors {
            self.dir_failures[dir] += 1;
        }
    }

    fn new_task(&self, source_path: &str, dest_path: &str, is_directory: bool, size: u64) -> TransferTask {
        TransferTask {
            id: self.id,
            source_drive_id: self.plan.source_drive_id.clone(),
            dest_drive_id: self.plan.dest_drive_id.clone(),
            source_path: source_path.to_string(),
            dest_path: dest_path.to_string(),
            mode: self.plan.mode,
            state: TransferState::Pending,
            is_directory,
            bytes_done: 0,
            bytes_total: size,
            speed_bps: 0,
        }
    }

    fn finish(&mut self, task: TransferTask, result: Result<(), ProviderError>) {
        match result {
            Ok(()) => self.push(task, TransferState::Done, None),
            Err(ProviderError::Cancelled) => {
                debug!(task_id = %self.id, "Cancelled {}", task.source_path);
                self.push(task, TransferState::Cancelled, None)
            }
            Err(e) => {
                warn!(task_id = %self.id, "Transfer of {} failed: {}", task.source_path, e);
                let info = ErrorInfo::new(&e, Some(&self.plan.source_drive_id), Some(&task.source_path));
                self.push(task, TransferState::Error, Some(info))
            }
        }
    }

    fn push(&mut self, mut task: TransferTask, state: TransferState, error: Option<ErrorInfo>) {
        task.state = state;
        let _ = self
            .events
            .send(TransferEvent::ItemFinished(task.clone(), error.clone()));
        self.tasks.push((task, error));
    }
}
