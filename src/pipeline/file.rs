//! Logical file reassembly
//!
//! A [`LogicalFile`] is streamed by fetching every segment concurrently
//! through the file queue, decoding through the decode queue, and writing
//! the decoded buffers to the sink strictly in segment order.
//!
//! Corruption in an ordinary file halts the writer at the first bad segment
//! and asks the [`CorruptionObserver`] for a repair. Once the file's repair
//! status flips, the rest of the output is copied from the repaired copy on
//! disk, starting at the byte offset already written.

use super::decoder::{DecodedSegment, SegmentDecoder};
use super::queue::{QueueSlot, WorkQueue};
use crate::cancellable::{CancellableTask, Execution, TaskState};
use crate::error::{Error, Result};
use crate::nntp::ArticleId;
use crate::pool::Pool;
use crate::types::{Event, FileKind, TaskAction};
use crate::utils::{cache_file_name, lock};
use std::collections::BTreeSet;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, oneshot, watch};
use tokio_util::sync::CancellationToken;

const PRIORITY_SCALE: i64 = 10_000_000_000;
const SUBORDER_SCALE: i64 = 100_000;

/// Schedule weight of one segment fetch
///
/// Caller priority dominates, then earlier archive continuation parts, then
/// earlier segment indices.
pub fn schedule_weight(priority: i64, suborder: u32, index: usize) -> i64 {
    let index = i64::try_from(index).unwrap_or(i64::MAX);
    priority
        .saturating_mul(PRIORITY_SCALE)
        .saturating_sub(i64::from(suborder).saturating_mul(SUBORDER_SCALE))
        .saturating_sub(index)
}

/// One addressable chunk of a logical file
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Segment {
    /// Message id of the article carrying the chunk
    pub id: String,
    /// Declared encoded size
    pub bytes: u64,
    /// Sequence number within the file (1-based in manifests)
    pub number: u32,
}

/// Where a file stands with respect to repair
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RepairStatus {
    /// No repair outcome yet
    Pending,
    /// Repair ran and the file needed nothing
    Verified,
    /// Repair reconstructed the file at this path
    Repaired(PathBuf),
    /// The manifest is broken; the file cannot be completed
    Broken,
}

/// Receives corruption reports from file streams
pub trait CorruptionObserver: Send + Sync {
    /// A segment of `file` is missing or corrupt and needs repair data
    fn ready_for_par(&self, file: &Arc<LogicalFile>);
}

/// Shared machinery every file stream of a manifest runs on
#[derive(Clone)]
pub struct PipelineContext {
    /// Article source
    pub pool: Pool,
    /// Caps outstanding segment fetches across all files
    pub file_queue: WorkQueue,
    /// Runs one decode at a time, process-wide
    pub decode_queue: WorkQueue,
    /// Segment body decoder
    pub decoder: Arc<dyn SegmentDecoder>,
    /// Directory holding cached raw segment bodies
    pub cache_dir: PathBuf,
    /// Event bus
    pub events: broadcast::Sender<Event>,
    /// Manifest name stamped on events
    pub manifest: String,
}

impl PipelineContext {
    pub(crate) fn emit(&self, event: Event) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

/// Options for a single [`LogicalFile::stream`] run
#[derive(Clone, Copy, Debug, Default)]
pub struct StreamOptions {
    /// Caller priority; higher is fetched first
    pub priority: i64,
    /// Write corrupt segments through instead of halting for repair
    pub ignore_corruption: bool,
}

/// Summary of a finished stream
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StreamReport {
    /// Bytes written to the sink
    pub bytes_written: u64,
    /// Segments that were missing or corrupt during this run
    pub corrupted_segments: usize,
    /// The tail was copied from a repaired file
    pub repaired: bool,
}

/// A named output file made of ordered segments
pub struct LogicalFile {
    /// Output filename
    pub name: String,
    /// Newsgroups the segments were posted to
    pub groups: Vec<String>,
    /// Segments in write order
    pub segments: Vec<Segment>,
    /// Position among archive continuation parts (0 when not a continuation)
    pub suborder: u32,
    /// Role within the manifest
    pub kind: FileKind,
    finished: AtomicUsize,
    corrupted: Mutex<BTreeSet<usize>>,
    repair: watch::Sender<RepairStatus>,
    repair_source: Mutex<Option<PathBuf>>,
    tasks: Mutex<Vec<CancellableTask>>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for LogicalFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogicalFile")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("suborder", &self.suborder)
            .field("segments", &self.segments.len())
            .finish()
    }
}

impl LogicalFile {
    /// A plain file; triage assigns kind and suborder afterwards
    pub fn new(name: impl Into<String>, groups: Vec<String>, segments: Vec<Segment>) -> Self {
        let (repair, _) = watch::channel(RepairStatus::Pending);
        Self {
            name: name.into(),
            groups,
            segments,
            suborder: 0,
            kind: FileKind::Other,
            finished: AtomicUsize::new(0),
            corrupted: Mutex::new(BTreeSet::new()),
            repair,
            repair_source: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        }
    }

    /// Sum of declared segment sizes
    pub fn size(&self) -> u64 {
        self.segments.iter().map(|s| s.bytes).sum()
    }

    /// Segments fetched and decoded so far, across all runs
    pub fn finished_segments(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }

    /// Distinct segment indices seen corrupt
    pub fn corrupted_segments(&self) -> usize {
        lock(&self.corrupted).len()
    }

    /// Any segment has been seen corrupt
    pub fn is_corrupted(&self) -> bool {
        !lock(&self.corrupted).is_empty()
    }

    /// Current repair status
    pub fn repair_status(&self) -> RepairStatus {
        self.repair.borrow().clone()
    }

    /// Copy of this file downloaded for repair, if any
    pub fn repair_source(&self) -> Option<PathBuf> {
        lock(&self.repair_source).clone()
    }

    pub(crate) fn set_repair_source(&self, path: PathBuf) {
        *lock(&self.repair_source) = Some(path);
    }

    pub(crate) fn mark_repaired(&self, path: PathBuf) {
        self.repair.send_replace(RepairStatus::Repaired(path));
    }

    pub(crate) fn mark_verified(&self) {
        self.repair.send_replace(RepairStatus::Verified);
    }

    pub(crate) fn mark_broken(&self) {
        self.repair.send_replace(RepairStatus::Broken);
    }

    /// Withdraw every queued segment fetch and stop all running streams
    ///
    /// Returns how many queued fetches changed state.
    pub fn abort(&self, ctx: &PipelineContext) -> usize {
        let count = self.each_task(ctx, TaskAction::Aborted, CancellableTask::cancel);
        self.cancel.cancel();
        count
    }

    /// Hold back queued segment fetches
    pub fn pause(&self, ctx: &PipelineContext) -> usize {
        self.each_task(ctx, TaskAction::Paused, CancellableTask::pause)
    }

    /// Release held back segment fetches
    pub fn resume(&self, ctx: &PipelineContext) -> usize {
        self.each_task(ctx, TaskAction::Resumed, CancellableTask::resume)
    }

    fn each_task(&self, ctx: &PipelineContext, action: TaskAction, apply: fn(&CancellableTask) -> bool) -> usize {
        let tasks: Vec<CancellableTask> = lock(&self.tasks).clone();
        let count = tasks.iter().filter(|task| apply(task)).count();
        if count > 0 {
            tracing::debug!(file = %self.name, ?action, count, "Segment fetches changed");
            ctx.emit(Event::TasksChanged {
                manifest: ctx.manifest.clone(),
                file: self.name.clone(),
                action,
                count,
            });
        }
        count
    }

    fn track(&self, task: CancellableTask) {
        let mut tasks = lock(&self.tasks);
        tasks.retain(|t| matches!(t.state(), TaskState::Pending | TaskState::Paused));
        tasks.push(task);
    }

    fn stop_error(&self) -> Error {
        match self.repair_status() {
            RepairStatus::Broken => Error::RepairExhausted(format!("{} cannot be completed", self.name)),
            _ => Error::Cancelled,
        }
    }

    /// Stream the file into `sink` in segment order
    ///
    /// With an `observer`, corruption in a non-repair file halts writing at
    /// the first bad segment, reports every bad segment through
    /// [`CorruptionObserver::ready_for_par`], and resumes from the repaired
    /// copy. Without one, or with `ignore_corruption`, zero-filled
    /// placeholders are written in place of bad segments.
    pub async fn stream<W>(
        self: &Arc<Self>,
        ctx: &PipelineContext,
        options: StreamOptions,
        observer: Option<Arc<dyn CorruptionObserver>>,
        sink: &mut W,
    ) -> Result<StreamReport>
    where
        W: AsyncWrite + Unpin + Send + ?Sized,
    {
        if self.cancel.is_cancelled() {
            return Err(self.stop_error());
        }
        tokio::fs::create_dir_all(&ctx.cache_dir).await?;

        let cancel = self.cancel.child_token();
        let _stop = cancel.clone().drop_guard();

        let mut ready = Vec::with_capacity(self.segments.len());
        for index in 0..self.segments.len() {
            let (tx, rx) = oneshot::channel();
            let gate = CancellableTask::new();
            self.track(gate.clone());

            let file = self.clone();
            let ctx = ctx.clone();
            let cancel = cancel.clone();
            let weight = schedule_weight(options.priority, self.suborder, index);
            tokio::spawn(async move {
                if let Some(decoded) = file.load_segment(&ctx, index, weight, &gate, &cancel).await {
                    let _ = tx.send(decoded);
                }
            });
            ready.push(rx);
        }

        let halt_on_corruption =
            self.kind != FileKind::Par && !options.ignore_corruption && observer.is_some();
        let mut report = StreamReport::default();
        let mut halted_at: Option<usize> = None;

        for (index, rx) in ready.into_iter().enumerate() {
            let decoded = tokio::select! {
                _ = cancel.cancelled() => return Err(self.stop_error()),
                decoded = rx => decoded.map_err(|_| self.stop_error())?,
            };

            if !decoded.intact {
                report.corrupted_segments += 1;
                lock(&self.corrupted).insert(index);
                tracing::warn!(
                    file = %self.name,
                    segment = %self.segments[index].id,
                    index,
                    "Corrupt or missing segment"
                );
                ctx.emit(Event::Corrupted {
                    manifest: ctx.manifest.clone(),
                    file: self.name.clone(),
                    index,
                });
                if halt_on_corruption && let Some(observer) = &observer {
                    halted_at.get_or_insert(index);
                    observer.ready_for_par(self);
                }
            }

            if halted_at.is_none() {
                sink.write_all(&decoded.data).await?;
                report.bytes_written += decoded.data.len() as u64;
            }
        }

        if let Some(index) = halted_at {
            tracing::info!(file = %self.name, index, written = report.bytes_written, "Writer waiting for repair");
            let source = self.await_repair(&cancel).await?;
            let mut repaired = tokio::fs::File::open(&source).await?;
            repaired.seek(SeekFrom::Start(report.bytes_written)).await?;
            report.bytes_written += tokio::io::copy(&mut repaired, &mut *sink).await?;
            report.repaired = true;
        }

        sink.flush().await?;

        tracing::debug!(
            file = %self.name,
            bytes = report.bytes_written,
            corrupted = report.corrupted_segments,
            "File stream finished"
        );
        ctx.emit(Event::FileFinished {
            manifest: ctx.manifest.clone(),
            file: self.name.clone(),
            bytes: report.bytes_written,
            repaired: report.repaired,
        });
        Ok(report)
    }

    /// Wait until repair settles and return the copy to resume from
    async fn await_repair(&self, cancel: &CancellationToken) -> Result<PathBuf> {
        let mut status = self.repair.subscribe();
        let settled = loop {
            let current = status.borrow_and_update().clone();
            if current != RepairStatus::Pending {
                break current;
            }
            tokio::select! {
                biased;
                changed = status.changed() => changed.map_err(|_| Error::Cancelled)?,
                _ = cancel.cancelled() => return Err(self.stop_error()),
            }
        };

        match settled {
            RepairStatus::Repaired(path) => Ok(path),
            RepairStatus::Verified => self
                .repair_source()
                .ok_or_else(|| Error::RepairExhausted(format!("no verified copy of {}", self.name))),
            RepairStatus::Broken | RepairStatus::Pending => Err(self.stop_error()),
        }
    }

    /// Fetch and decode one segment; `None` when the stream was stopped
    async fn load_segment(
        &self,
        ctx: &PipelineContext,
        index: usize,
        weight: i64,
        gate: &CancellableTask,
        cancel: &CancellationToken,
    ) -> Option<DecodedSegment> {
        let segment = &self.segments[index];

        let mut slot = acquire(&ctx.file_queue, weight, cancel).await?;
        let (go, resumed) = oneshot::channel::<()>();
        match gate.execute(move || {
            let _ = go.send(());
        }) {
            Execution::Ran => {}
            Execution::Delayed => {
                drop(slot);
                tokio::select! {
                    _ = cancel.cancelled() => return None,
                    resumed = resumed => resumed.ok()?,
                }
                slot = acquire(&ctx.file_queue, weight, cancel).await?;
            }
            Execution::Prevented | Execution::AlreadyExecuted => return None,
        }

        let cache_path = ctx.cache_dir.join(cache_file_name(&segment.id));
        let (raw, cached) = match tokio::fs::read(&cache_path).await {
            Ok(raw) => (Some(raw), true),
            Err(_) => match self.fetch_body(ctx, segment, weight, cancel).await {
                Ok(raw) => {
                    if let Err(e) = tokio::fs::write(&cache_path, &raw).await {
                        tracing::warn!(segment = %segment.id, error = %e, "Failed to cache segment body");
                    }
                    (Some(raw), false)
                }
                Err(_) if cancel.is_cancelled() => return None,
                Err(e) => {
                    let e = Error::SegmentFetch {
                        id: segment.id.clone(),
                        reason: e.to_string(),
                    };
                    tracing::warn!(file = %self.name, index, error = %e, "Segment fetch failed");
                    (None, false)
                }
            },
        };
        drop(slot);

        let decoded = match raw {
            Some(raw) => {
                let decoder = ctx.decoder.clone();
                let declared = segment.bytes;
                let decode = async move {
                    tokio::task::spawn_blocking(move || decoder.decode(&raw, declared)).await
                };
                match ctx.decode_queue.run(weight, decode).await {
                    Ok(Ok(decoded)) => decoded,
                    Ok(Err(e)) => {
                        tracing::warn!(segment = %segment.id, error = %e, "Decode task failed");
                        DecodedSegment::placeholder(declared)
                    }
                    Err(_) => return None,
                }
            }
            None => DecodedSegment::placeholder(segment.bytes),
        };

        self.finished.fetch_add(1, Ordering::SeqCst);
        ctx.emit(Event::SegmentFetched {
            manifest: ctx.manifest.clone(),
            file: self.name.clone(),
            index,
            intact: decoded.intact,
            cached,
        });
        Some(decoded)
    }

    async fn fetch_body(
        &self,
        ctx: &PipelineContext,
        segment: &Segment,
        weight: i64,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let group = self.groups.first().map(String::as_str);
        let mut job = ctx.pool.body(group, ArticleId::message_id(&segment.id), Some(weight));
        tokio::select! {
            body = &mut job => body,
            _ = cancel.cancelled() => {
                job.cancel();
                Err(Error::Cancelled)
            }
        }
    }
}

async fn acquire(queue: &WorkQueue, weight: i64, cancel: &CancellationToken) -> Option<QueueSlot> {
    tokio::select! {
        _ = cancel.cancelled() => None,
        slot = queue.acquire(weight) => slot.ok(),
    }
}
