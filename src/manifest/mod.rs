//! Document manifests and repair orchestration
//!
//! A [`Manifest`] owns the logical files of one NZB document. It streams
//! them through the shared pipeline and, when a file reports corruption,
//! coordinates the repair:
//!
//! 1. Every corrupt segment is counted against the redundancy declared by
//!    the repair file names.
//! 2. The first report switches the manifest into repair mode, which
//!    downloads every repair file and every other file into a repair
//!    directory, then runs the repair tool on the primary repair file.
//! 3. A successful repair flips each file's repair status, which lets the
//!    halted writers finish from the repaired copies.
//!
//! When the damage exceeds the redundancy, no repair files exist, or the
//! repair tool fails, the manifest is marked broken: every file pipeline is
//! aborted and a single [`Event::Broken`] is emitted.

mod source;
mod triage;

pub use source::{ParsedManifest, fetch_url, parse, read_path};
pub use triage::{
    RarVolume, RawFile, Triaged, filename_from_subject, is_par2_file, is_primary_par2, par2_block_count,
    rar_volume, triage,
};

use crate::client::Client;
use crate::error::{Error, Result};
use crate::parity::{RepairEvent, RepairTool};
use crate::pipeline::{CorruptionObserver, LogicalFile, PipelineContext, StreamOptions, StreamReport};
use crate::types::{Event, FileKind};
use crate::utils::{manifest_name, slugify};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use tokio::io::AsyncWriteExt;

/// Priority of repair files while repairing
const PAR_PRIORITY: i64 = 99_999;
/// Priority of the other files while repairing
const REPAIR_PRIORITY: i64 = 88_888;

/// Primary file plus ordered continuations
#[derive(Clone, Debug, Default)]
pub struct FileBucket {
    /// Main file of the set
    pub primary: Option<Arc<LogicalFile>>,
    /// Remaining members in order
    pub continuations: Vec<Arc<LogicalFile>>,
}

impl FileBucket {
    fn from_indices(files: &[Arc<LogicalFile>], primary: Option<usize>, continuations: &[usize]) -> Self {
        Self {
            primary: primary.and_then(|idx| files.get(idx).cloned()),
            continuations: continuations.iter().filter_map(|&idx| files.get(idx).cloned()).collect(),
        }
    }

    /// Primary followed by continuations
    pub fn all(&self) -> Vec<Arc<LogicalFile>> {
        self.primary.iter().chain(self.continuations.iter()).cloned().collect()
    }

    /// Number of files in the set
    pub fn len(&self) -> usize {
        usize::from(self.primary.is_some()) + self.continuations.len()
    }

    /// The set has no files
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct ManifestInner {
    me: Weak<ManifestInner>,
    name: String,
    title: Option<String>,
    files: Vec<Arc<LogicalFile>>,
    pars: FileBucket,
    rars: FileBucket,
    max_repairable: u64,
    ctx: PipelineContext,
    repair_tool: Arc<dyn RepairTool>,
    broken_segments: AtomicUsize,
    needs_repair: AtomicBool,
    parmode: AtomicBool,
    broken: AtomicBool,
}

/// A parsed document and the machinery to download and repair it
#[derive(Clone)]
pub struct Manifest {
    inner: Arc<ManifestInner>,
}

impl std::fmt::Debug for Manifest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manifest")
            .field("name", &self.inner.name)
            .field("files", &self.inner.files.len())
            .field("pars", &self.inner.pars.len())
            .field("rars", &self.inner.rars.len())
            .finish()
    }
}

impl Manifest {
    /// Read and parse a manifest file
    pub async fn from_path(client: &Client, path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = read_path(path).await?;
        Self::parse(client, &content, &manifest_name(&path.to_string_lossy()))
    }

    /// Download and parse a manifest
    pub async fn from_url(client: &Client, url: &str) -> Result<Self> {
        let content = fetch_url(url, &client.config().retry).await?;
        Self::parse(client, &content, &manifest_name(url))
    }

    /// Parse manifest XML bound to `client`'s pool and queues
    pub fn parse(client: &Client, content: &[u8], name: &str) -> Result<Self> {
        let parsed = parse(content)?;
        let triaged = triage(parsed.files);

        let name = triaged
            .main_name
            .clone()
            .or_else(|| parsed.title.clone())
            .unwrap_or_else(|| name.to_string());
        let cache_dir = client.config().temp_dir.join(slugify(&name));
        let ctx = client.pipeline_context(name.clone(), cache_dir);

        Ok(Self::assemble(name, parsed.title, triaged, ctx, client.repair_tool()))
    }

    pub(crate) fn assemble(
        name: String,
        title: Option<String>,
        triaged: Triaged,
        ctx: PipelineContext,
        repair_tool: Arc<dyn RepairTool>,
    ) -> Self {
        let files: Vec<Arc<LogicalFile>> = triaged.files.into_iter().map(Arc::new).collect();
        let pars = FileBucket::from_indices(&files, triaged.par_primary, &triaged.par_continuations);
        let rars = FileBucket::from_indices(&files, triaged.rar_primary, &triaged.rar_continuations);
        let max_repairable = pars.all().iter().map(|par| par2_block_count(&par.name)).sum();

        tracing::info!(
            manifest = %name,
            files = files.len(),
            pars = pars.len(),
            rars = rars.len(),
            max_repairable,
            "Manifest parsed"
        );

        let inner = Arc::new_cyclic(|me| ManifestInner {
            me: me.clone(),
            name,
            title,
            files,
            pars,
            rars,
            max_repairable,
            ctx,
            repair_tool,
            broken_segments: AtomicUsize::new(0),
            needs_repair: AtomicBool::new(false),
            parmode: AtomicBool::new(false),
            broken: AtomicBool::new(false),
        });
        Self { inner }
    }

    /// Manifest name (main archive base name, title, or source name)
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// `<meta type="title">` of the document
    pub fn title(&self) -> Option<&str> {
        self.inner.title.as_deref()
    }

    /// Every logical file, in document order
    pub fn files(&self) -> &[Arc<LogicalFile>] {
        &self.inner.files
    }

    /// Look up a file by name
    pub fn file(&self, name: &str) -> Option<&Arc<LogicalFile>> {
        self.inner.files.iter().find(|f| f.name == name)
    }

    /// Repair files
    pub fn pars(&self) -> &FileBucket {
        &self.inner.pars
    }

    /// Winning archive set
    pub fn rars(&self) -> &FileBucket {
        &self.inner.rars
    }

    /// Sum of declared segment sizes of every file
    pub fn download_size(&self) -> u64 {
        self.inner.files.iter().map(|f| f.size()).sum()
    }

    /// Number of repair files
    pub fn par_count(&self) -> usize {
        self.inner.pars.len()
    }

    /// Broken segments the repair files can make up for
    pub fn max_repairable_segments(&self) -> u64 {
        self.inner.max_repairable
    }

    /// Corrupt segments reported so far
    pub fn broken_segments(&self) -> usize {
        self.inner.broken_segments.load(Ordering::SeqCst)
    }

    /// Repair mode has been entered
    pub fn in_repair(&self) -> bool {
        self.inner.parmode.load(Ordering::SeqCst)
    }

    /// The manifest was marked broken
    pub fn is_broken(&self) -> bool {
        self.inner.broken.load(Ordering::SeqCst)
    }

    /// Segment cache directory of this manifest
    pub fn cache_dir(&self) -> &Path {
        &self.inner.ctx.cache_dir
    }

    /// Directory repair downloads and reconstructed files go to
    pub fn repair_dir(&self) -> PathBuf {
        self.inner.repair_dir()
    }

    /// Stream one file into `sink`, repairing it if needed
    pub async fn stream<W>(&self, file: &Arc<LogicalFile>, priority: i64, sink: &mut W) -> Result<StreamReport>
    where
        W: tokio::io::AsyncWrite + Unpin + Send + ?Sized,
    {
        let observer: Arc<dyn CorruptionObserver> = self.inner.clone();
        let options = StreamOptions {
            priority,
            ignore_corruption: false,
        };
        file.stream(&self.inner.ctx, options, Some(observer), sink).await
    }

    /// Download every non-repair file into `dir`
    ///
    /// Files stream concurrently; corruption triggers the repair flow. The
    /// first failure is returned, a broken manifest taking precedence.
    pub async fn download(&self, dir: impl AsRef<Path>) -> Result<Vec<(String, StreamReport)>> {
        let dir = dir.as_ref();
        tokio::fs::create_dir_all(dir).await?;

        let targets: Vec<Arc<LogicalFile>> = self
            .inner
            .files
            .iter()
            .filter(|f| f.kind != FileKind::Par)
            .cloned()
            .collect();

        let downloads = targets.iter().map(|file| async move {
            let mut out = tokio::fs::File::create(dir.join(&file.name)).await?;
            let report = self.stream(file, 0, &mut out).await?;
            out.flush().await?;
            Ok::<_, Error>((file.name.clone(), report))
        });
        let results = futures::future::join_all(downloads).await;

        let mut reports = Vec::with_capacity(results.len());
        let mut first_error = None;
        for result in results {
            match result {
                Ok(report) => reports.push(report),
                Err(e) => {
                    let replace = match &first_error {
                        None => true,
                        Some(Error::RepairExhausted(_)) => false,
                        Some(_) => matches!(e, Error::RepairExhausted(_)),
                    };
                    if replace {
                        first_error = Some(e);
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                tracing::info!(manifest = %self.inner.name, files = reports.len(), "Manifest downloaded");
                Ok(reports)
            }
        }
    }

    /// Abort every file pipeline; returns how many queued fetches were withdrawn
    pub fn abort(&self) -> usize {
        let tasks = self.inner.abort_files();
        tracing::info!(manifest = %self.inner.name, tasks, "Manifest aborted");
        self.inner.ctx.emit(Event::Aborted {
            manifest: self.inner.name.clone(),
            tasks,
        });
        tasks
    }

    /// Hold back queued fetches of every file
    pub fn pause(&self) -> usize {
        self.inner.files.iter().map(|f| f.pause(&self.inner.ctx)).sum()
    }

    /// Release held back fetches of every file
    pub fn resume(&self) -> usize {
        self.inner.files.iter().map(|f| f.resume(&self.inner.ctx)).sum()
    }
}

impl ManifestInner {
    fn repair_dir(&self) -> PathBuf {
        self.ctx.cache_dir.join("repair")
    }

    fn abort_files(&self) -> usize {
        self.files.iter().map(|f| f.abort(&self.ctx)).sum()
    }

    /// Mark the manifest permanently broken; only the first call has effect
    fn mark_broken(&self, reason: String) {
        if self.broken.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::error!(manifest = %self.name, reason = %reason, "Manifest is broken");
        for file in &self.files {
            file.mark_broken();
        }
        self.abort_files();
        self.ctx.emit(Event::Broken {
            manifest: self.name.clone(),
            reason,
        });
    }

    async fn run_repair(self: Arc<Self>) {
        if let Err(e) = self.repair().await {
            self.mark_broken(e.to_string());
        }
    }

    async fn repair(&self) -> Result<()> {
        let Some(primary) = self.pars.primary.clone() else {
            return Err(Error::RepairExhausted("incomplete files and no repair files found".to_string()));
        };

        let dir = self.repair_dir();
        tokio::fs::create_dir_all(&dir).await?;

        tracing::info!(manifest = %self.name, par = %primary.name, "Repair started");
        self.ctx.emit(Event::RepairStarted {
            manifest: self.name.clone(),
            par_file: primary.name.clone(),
        });

        let others: Vec<Arc<LogicalFile>> = self.files.iter().filter(|f| f.kind != FileKind::Par).cloned().collect();
        for file in &others {
            file.set_repair_source(dir.join(&file.name));
        }

        let pars = self.pars.all();
        let par_downloads = futures::future::try_join_all(
            pars.iter().map(|file| self.download_raw(file, &dir, PAR_PRIORITY)),
        );
        let file_downloads = futures::future::try_join_all(
            others.iter().map(|file| self.download_raw(file, &dir, REPAIR_PRIORITY)),
        );
        let (par_result, file_result) = tokio::join!(par_downloads, file_downloads);
        par_result?;
        file_result?;

        if self.broken.load(Ordering::SeqCst) {
            return Err(Error::RepairExhausted("manifest broke during repair download".to_string()));
        }

        let mut events = self.repair_tool.repair(&dir.join(&primary.name)).await?;
        let mut success = None;
        while let Some(event) = events.recv().await {
            match event {
                RepairEvent::Progress { percent } => {
                    self.ctx.emit(Event::RepairProgress {
                        manifest: self.name.clone(),
                        percent,
                    });
                }
                RepairEvent::Repaired => tracing::debug!(manifest = %self.name, "Repair tool reports repaired"),
                RepairEvent::NotBroken => tracing::debug!(manifest = %self.name, "Repair tool found nothing to repair"),
                RepairEvent::Broken => tracing::warn!(manifest = %self.name, "Repair tool reports damage beyond repair"),
                RepairEvent::Finished { success: ok } => {
                    success = Some(ok);
                    break;
                }
            }
        }

        match success {
            Some(true) => {}
            Some(false) => {
                return Err(Error::RepairExhausted(format!("repair of {} failed", primary.name)));
            }
            None => {
                return Err(Error::RepairExhausted(format!(
                    "{} ended without reporting a result",
                    self.repair_tool.name()
                )));
            }
        }

        for file in &others {
            if file.is_corrupted() {
                let path = dir.join(&file.name);
                file.mark_repaired(path.clone());
                self.ctx.emit(Event::FileRepaired {
                    manifest: self.name.clone(),
                    file: file.name.clone(),
                    path,
                });
            } else {
                file.mark_verified();
            }
            self.ctx.emit(Event::FileVerified {
                manifest: self.name.clone(),
                file: file.name.clone(),
            });
        }

        tracing::info!(manifest = %self.name, files = others.len(), "Repair finished");
        Ok(())
    }

    /// Stream `file` into `dir` as is, zero-filling bad segments
    async fn download_raw(&self, file: &Arc<LogicalFile>, dir: &Path, priority: i64) -> Result<StreamReport> {
        let path = dir.join(&file.name);
        let mut out = tokio::fs::File::create(&path).await?;
        let options = StreamOptions {
            priority,
            ignore_corruption: true,
        };
        let report = file.stream(&self.ctx, options, None, &mut out).await?;
        out.flush().await?;
        tracing::debug!(file = %file.name, path = %path.display(), "Repair download finished");
        Ok(report)
    }
}

impl CorruptionObserver for ManifestInner {
    fn ready_for_par(&self, file: &Arc<LogicalFile>) {
        if self.broken.load(Ordering::SeqCst) {
            return;
        }

        if !self.needs_repair.swap(true, Ordering::SeqCst) {
            tracing::info!(manifest = %self.name, file = %file.name, "Corruption detected, repair needed");
            self.ctx.emit(Event::NeedsRepair {
                manifest: self.name.clone(),
            });
        }

        let broken = self.broken_segments.fetch_add(1, Ordering::SeqCst) + 1;
        if broken as u64 > self.max_repairable {
            self.mark_broken(format!(
                "{} broken segments exceed repair capacity of {}",
                broken, self.max_repairable
            ));
            return;
        }

        if self.parmode.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(me) = self.me.upgrade() {
            tokio::spawn(me.run_repair());
        }
    }
}
