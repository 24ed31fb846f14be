//! One pooled connection
//!
//! A [`Worker`] owns a single socket. Two depth-1 queues keep it orderly:
//! - the command slot (a fair async mutex around the connection) lets exactly
//!   one command be on the wire at a time
//! - the combo slot serializes multi-command operations such as
//!   "select group, then fetch body" so unrelated commands cannot slip in
//!   between the two halves
//!
//! Busyness is derived from how many callers sit in those queues, plus
//! outstanding leases handed out by the pool.

use super::article::{
    ActiveGroup, Article, ArticleId, GroupInfo, Headers, OverviewEntry, OverviewField,
    parse_overview_format,
};
use super::framing::{FrameMode, ResponseReader};
use super::response::{Response, codes};
use super::server_info::ServerInfo;
use super::transport::{self, BoxedStream, NntpStream};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::utils::lock;
use std::collections::BTreeSet;
use std::fmt;
use std::future::Future;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Busyness reported for a worker taken out of rotation
pub const EXPLICIT_BUSY: usize = 10;

/// Identifier of a worker within its pool
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(pub u64);

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "w{}", self.0)
    }
}

/// Connection lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    /// Socket opening, greeting not yet received
    Connecting,
    /// Greeting received, credentials being exchanged
    Authenticating,
    /// Serving commands
    Ready,
    /// Socket gone; terminal
    Closed,
}

/// Notifications a worker sends to its pool
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    /// Nothing queued or leased any more
    Free(WorkerId),
    /// The connection ended
    Closed {
        id: WorkerId,
        error: Option<String>,
        was_ready: bool,
    },
}

/// Connection parameters shared by every worker of a pool
#[derive(Clone, Debug)]
pub struct WorkerSettings {
    /// Server hostname
    pub host: String,
    /// Server port
    pub port: u16,
    /// Wrap the socket in TLS
    pub secure: bool,
    /// AUTHINFO user and password
    pub credentials: Option<(String, String)>,
    /// Bound on each wire command
    pub command_timeout: Duration,
    /// Log every command and status line
    pub debug: bool,
    /// Collapse CRLF to LF in bodies
    pub convert_newlines: bool,
}

impl WorkerSettings {
    /// Settings derived from the client configuration
    pub fn from_config(config: &Config) -> Self {
        Self {
            host: config.server.host.clone(),
            port: config.server.port,
            secure: config.server.secure,
            credentials: config
                .server
                .credentials()
                .map(|(u, p)| (u.to_string(), p.to_string())),
            command_timeout: config.command_timeout,
            debug: config.debug,
            convert_newlines: config.convert_newlines,
        }
    }
}

/// Point-in-time view of a worker
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerStats {
    /// Worker id
    pub id: WorkerId,
    /// Lifecycle state
    pub state: WorkerState,
    /// Busyness level
    pub busy: usize,
    /// Currently selected group
    pub group: Option<String>,
}

struct Connection {
    stream: BoxedStream,
    reader: ResponseReader,
    /// Timed-out commands whose replies may still arrive
    abandoned: usize,
}

impl Connection {
    async fn roundtrip(
        &mut self,
        command: &str,
        mode: FrameMode,
        expected: Option<&str>,
        convert_newlines: bool,
    ) -> Result<Response> {
        let line = format!("{}\r\n", command);
        self.stream
            .write_all(line.as_bytes())
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        self.stream
            .flush()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        loop {
            let response = self
                .reader
                .read_response(&mut self.stream, mode, convert_newlines)
                .await?;
            if self.abandoned > 0 && is_stale_reply(&response, expected) {
                self.abandoned -= 1;
                tracing::debug!(
                    status = response.code(),
                    message = %response.message(),
                    "Discarding late reply to a timed-out command"
                );
                continue;
            }
            return Ok(response);
        }
    }
}

/// An article reply (220-223) that answers some other command
///
/// `expected` is the message id or article number the current command asked
/// for; `None` means the command is not an article fetch at all. Replies that
/// name no article are taken as they are.
fn is_stale_reply(response: &Response, expected: Option<&str>) -> bool {
    if !(codes::ARTICLE_FOLLOWS..=codes::ARTICLE_EXISTS).contains(&response.code()) {
        return false;
    }
    let words = response.message_words();
    match expected {
        None => true,
        Some(id) if id.starts_with('<') => words
            .iter()
            .find(|w| w.starts_with('<'))
            .is_some_and(|named| *named != id),
        Some(number) => words
            .first()
            .is_some_and(|named| named.parse::<u64>().is_ok() && *named != number),
    }
}

struct WorkerInner {
    id: WorkerId,
    settings: WorkerSettings,
    info: Arc<ServerInfo>,
    state: watch::Sender<WorkerState>,
    conn: tokio::sync::Mutex<Option<Connection>>,
    combo: tokio::sync::Mutex<()>,
    comm_count: AtomicUsize,
    combo_count: AtomicUsize,
    leases: AtomicUsize,
    explicit_busy: AtomicBool,
    current_group: Mutex<Option<GroupInfo>>,
    last_activity: Mutex<Instant>,
    last_error: Mutex<Option<String>>,
    closed_reported: AtomicBool,
    closed: CancellationToken,
    events: Option<mpsc::UnboundedSender<WorkerEvent>>,
}

/// Handle to one pooled connection; clones share the connection
#[derive(Clone)]
pub struct Worker {
    inner: Arc<WorkerInner>,
}

impl fmt::Debug for Worker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Worker")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .field("busy", &self.busy())
            .finish()
    }
}

#[derive(Clone, Copy)]
enum Queue {
    Comm,
    Combo,
}

/// Keeps a queue counter raised while a caller waits in or occupies a slot
struct QueueGuard<'a> {
    worker: &'a Worker,
    queue: Queue,
}

impl<'a> QueueGuard<'a> {
    fn enter(worker: &'a Worker, queue: Queue) -> Self {
        worker.counter(queue).fetch_add(1, Ordering::SeqCst);
        Self { worker, queue }
    }
}

impl Drop for QueueGuard<'_> {
    fn drop(&mut self) {
        self.worker.counter(self.queue).fetch_sub(1, Ordering::SeqCst);
        self.worker.touch();
        self.worker.announce_if_free();
    }
}

impl Worker {
    fn new(
        id: WorkerId,
        settings: WorkerSettings,
        info: Arc<ServerInfo>,
        events: Option<mpsc::UnboundedSender<WorkerEvent>>,
    ) -> Self {
        let (state, _) = watch::channel(WorkerState::Connecting);
        Self {
            inner: Arc::new(WorkerInner {
                id,
                settings,
                info,
                state,
                conn: tokio::sync::Mutex::new(None),
                combo: tokio::sync::Mutex::new(()),
                comm_count: AtomicUsize::new(0),
                combo_count: AtomicUsize::new(0),
                leases: AtomicUsize::new(0),
                explicit_busy: AtomicBool::new(false),
                current_group: Mutex::new(None),
                last_activity: Mutex::new(Instant::now()),
                last_error: Mutex::new(None),
                closed_reported: AtomicBool::new(false),
                closed: CancellationToken::new(),
                events,
            }),
        }
    }

    /// Open a connection in the background; the worker is usable immediately
    /// and commands wait until authentication has finished
    pub(crate) fn spawn(
        id: WorkerId,
        settings: WorkerSettings,
        info: Arc<ServerInfo>,
        events: mpsc::UnboundedSender<WorkerEvent>,
    ) -> Self {
        let worker = Self::new(id, settings, info, Some(events));
        let connecting = worker.clone();

        tokio::spawn(async move {
            let settings = &connecting.inner.settings;
            let opened = tokio::select! {
                opened = transport::connect(&settings.host, settings.port, settings.secure) => opened,
                _ = connecting.inner.closed.cancelled() => Err(Error::Transport("worker closed".to_string())),
            };

            let result = match opened {
                Ok(stream) => connecting.establish(stream).await,
                Err(e) => Err(e),
            };

            if let Err(e) = result {
                tracing::warn!(
                    worker = %connecting.id(),
                    host = %connecting.inner.settings.host,
                    error = %e,
                    "Connection setup failed"
                );
                connecting.fail(e.to_string());
            }
        });

        worker
    }

    /// Drive an already open stream; returns once authenticated
    pub async fn with_stream(
        stream: impl NntpStream + 'static,
        settings: WorkerSettings,
        info: Arc<ServerInfo>,
    ) -> Result<Self> {
        let worker = Self::new(WorkerId(0), settings, info, None);
        if let Err(e) = worker.establish(Box::new(stream)).await {
            worker.fail(e.to_string());
            return Err(e);
        }
        Ok(worker)
    }

    async fn establish(&self, stream: BoxedStream) -> Result<()> {
        let mut conn = Connection {
            stream,
            reader: ResponseReader::new(),
            abandoned: 0,
        };

        let timeout = self.inner.settings.command_timeout;
        let greeting = tokio::time::timeout(
            timeout,
            conn.reader
                .read_response(&mut conn.stream, FrameMode::SingleLine, false),
        )
        .await
        .map_err(|_| Error::Timeout(timeout))??;

        if !matches!(
            greeting.code(),
            codes::POSTING_ALLOWED | codes::POSTING_PROHIBITED
        ) {
            return Err(Error::Protocol {
                code: greeting.code(),
                message: greeting.message().to_string(),
            });
        }

        if self.inner.settings.debug {
            tracing::debug!(worker = %self.id(), status = greeting.code(), message = %greeting.message(), "<- greeting");
        }

        *self.inner.conn.lock().await = Some(conn);
        self.set_state(WorkerState::Authenticating);

        if let Some((user, pass)) = self.inner.settings.credentials.clone() {
            self.authenticate(&user, &pass).await?;
        }

        self.set_state(WorkerState::Ready);
        self.touch();
        tracing::info!(
            worker = %self.id(),
            host = %self.inner.settings.host,
            "Connection ready"
        );
        self.announce_if_free();
        Ok(())
    }

    async fn authenticate(&self, user: &str, pass: &str) -> Result<()> {
        let response = self
            .exchange(&format!("AUTHINFO USER {}", user), FrameMode::SingleLine, None)
            .await?;

        if response.code() == codes::PASSWORD_REQUIRED {
            self.exchange(&format!("AUTHINFO PASS {}", pass), FrameMode::SingleLine, None)
                .await?;
        }

        tracing::debug!(worker = %self.id(), user = %user, "Authenticated");
        Ok(())
    }

    /// Worker id
    pub fn id(&self) -> WorkerId {
        self.inner.id
    }

    /// Hostname this worker is connected to
    pub fn host(&self) -> &str {
        &self.inner.settings.host
    }

    /// Shared per-host cache
    pub fn server_info(&self) -> &Arc<ServerInfo> {
        &self.inner.info
    }

    /// Lifecycle state
    pub fn state(&self) -> WorkerState {
        *self.inner.state.borrow()
    }

    /// Serving commands
    pub fn is_ready(&self) -> bool {
        self.state() == WorkerState::Ready
    }

    /// Not yet closed
    pub fn is_alive(&self) -> bool {
        self.state() != WorkerState::Closed
    }

    /// Still connecting or authenticating
    pub fn is_starting(&self) -> bool {
        matches!(
            self.state(),
            WorkerState::Connecting | WorkerState::Authenticating
        )
    }

    /// How busy this worker is; lower is better, 0 means free
    ///
    /// Combo operations (and pool leases) are counted first; a worker with
    /// none of those reports its raw command queue. A worker still starting
    /// up counts as 1. An explicit busy mark overrides everything.
    pub fn busy(&self) -> usize {
        if self.inner.explicit_busy.load(Ordering::SeqCst) {
            return EXPLICIT_BUSY;
        }

        let combos = self.inner.combo_count.load(Ordering::SeqCst)
            + self.inner.leases.load(Ordering::SeqCst);
        if combos > 0 {
            return combos;
        }

        let commands = self.inner.comm_count.load(Ordering::SeqCst);
        if commands > 0 {
            return commands;
        }

        usize::from(self.is_starting())
    }

    /// Take the worker out of rotation (or put it back) without closing it
    pub fn set_busy(&self, busy: bool) {
        self.inner.explicit_busy.store(busy, Ordering::SeqCst);
        if !busy {
            self.announce_if_free();
        }
    }

    /// Name of the currently selected group
    pub fn current_group(&self) -> Option<String> {
        lock(&self.inner.current_group)
            .as_ref()
            .map(|g| g.name.clone())
    }

    /// Time since the last command started or finished
    pub fn idle_for(&self) -> Duration {
        lock(&self.inner.last_activity).elapsed()
    }

    /// Snapshot for pool statistics
    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            id: self.id(),
            state: self.state(),
            busy: self.busy(),
            group: self.current_group(),
        }
    }

    /// Send a command once authenticated and read its response
    pub async fn submit(&self, command: &str, mode: FrameMode) -> Result<Response> {
        self.wait_ready().await?;
        self.exchange(command, mode, None).await
    }

    /// Select a group; reuses the last known state unless `force`
    pub async fn group(&self, name: &str, force: bool) -> Result<GroupInfo> {
        self.combo(self.select_group(name, force)).await
    }

    /// Fetch headers only
    pub async fn head(&self, group: Option<&str>, id: &ArticleId) -> Result<Article> {
        self.combo(async {
            let response = self.fetch(group, "HEAD", id).await?;
            Ok(Article {
                headers: Headers::parse(&String::from_utf8_lossy(response.body())),
                body: Vec::new(),
            })
        })
        .await
    }

    /// Fetch the body only
    pub async fn body(&self, group: Option<&str>, id: &ArticleId) -> Result<Vec<u8>> {
        self.combo(async {
            let response = self.fetch(group, "BODY", id).await?;
            Ok(response.into_body())
        })
        .await
    }

    /// Fetch headers and body
    pub async fn article(&self, group: Option<&str>, id: &ArticleId) -> Result<Article> {
        self.combo(async {
            let response = self.fetch(group, "ARTICLE", id).await?;
            Ok(Article::parse(response.body()))
        })
        .await
    }

    /// Check that an article exists; returns its number and message id
    pub async fn stat(&self, group: Option<&str>, id: &ArticleId) -> Result<(u64, String)> {
        self.combo(async {
            let response = self.fetch(group, "STAT", id).await?;
            let words = response.message_words();
            let number = words.first().and_then(|n| n.parse().ok()).unwrap_or(0);
            let message_id = words.get(1).map(|s| s.to_string()).unwrap_or_default();
            Ok((number, message_id))
        })
        .await
    }

    /// Lowercased capability lines, cached per host
    pub async fn capabilities(&self, force: bool) -> Result<BTreeSet<String>> {
        self.combo(async {
            if !force && let Some(cached) = self.inner.info.capabilities() {
                return Ok(cached);
            }

            let response = self
                .submit("CAPABILITIES", FrameMode::MultiLine)
                .await?;
            let capabilities: BTreeSet<String> = response
                .lines()
                .iter()
                .filter(|l| !l.is_empty())
                .map(|l| l.to_lowercase())
                .collect();

            self.inner.info.set_capabilities(capabilities.clone());
            Ok(capabilities)
        })
        .await
    }

    /// `LIST ACTIVE`, cached per host when no wildmat is given
    pub async fn list_newsgroups(
        &self,
        wildmat: Option<&str>,
        force: bool,
    ) -> Result<Vec<ActiveGroup>> {
        self.combo(async {
            if wildmat.is_none()
                && !force
                && let Some(cached) = self.inner.info.active_list()
            {
                return Ok(cached);
            }

            let command = match wildmat {
                Some(pattern) => format!("LIST ACTIVE {}", pattern),
                None => "LIST ACTIVE".to_string(),
            };
            let response = self.submit(&command, FrameMode::MultiLine).await?;
            let groups: Vec<ActiveGroup> = response
                .lines()
                .iter()
                .filter_map(|l| ActiveGroup::parse_line(l))
                .collect();

            if wildmat.is_none() {
                self.inner.info.set_active_list(groups.clone());
            }
            Ok(groups)
        })
        .await
    }

    /// Overview column layout, cached per host
    pub async fn overview_format(&self, force: bool) -> Result<Vec<OverviewField>> {
        self.combo(self.load_overview_format(force)).await
    }

    /// Overview rows for an article range
    ///
    /// Tries the compressed `XZVER` first; any failure marks it unsupported
    /// for the host and falls back to `XOVER`.
    pub async fn overview(&self, group: &str, first: u64, last: u64) -> Result<Vec<OverviewEntry>> {
        self.combo(async {
            self.select_group(group, false).await?;
            let format = self.load_overview_format(false).await?;

            let mut response = None;
            if self.inner.info.xzver() != Some(false) {
                match self
                    .submit(&format!("XZVER {}-{}", first, last), FrameMode::Compressed)
                    .await
                {
                    Ok(r) => response = Some(r),
                    Err(e) if e.is_transport() => return Err(e),
                    Err(e) => {
                        tracing::debug!(worker = %self.id(), error = %e, "XZVER unavailable, using XOVER");
                        self.inner.info.set_xzver(false);
                    }
                }
            }

            let response = match response {
                Some(r) => r,
                None => {
                    self.submit(&format!("XOVER {}-{}", first, last), FrameMode::MultiLine)
                        .await?
                }
            };

            Ok(response
                .lines()
                .iter()
                .filter(|l| !l.is_empty())
                .map(|l| OverviewEntry::parse_line(l, &format))
                .collect())
        })
        .await
    }

    /// Say goodbye politely, then close the socket
    pub async fn quit(&self) {
        if self.is_ready() {
            let _ = tokio::time::timeout(
                self.inner.settings.command_timeout,
                self.exchange("QUIT", FrameMode::SingleLine, None),
            )
            .await;
        }
        self.destroy();
    }

    /// Close the socket immediately; in-flight commands fail with a transport error
    pub fn destroy(&self) {
        self.inner.closed.cancel();
        *lock(&self.inner.last_error) = Some("worker closed".to_string());
        self.set_state(WorkerState::Closed);
        if let Ok(mut slot) = self.inner.conn.try_lock() {
            slot.take();
        }
        self.report_closed(None);
    }

    async fn combo<T>(&self, operation: impl Future<Output = Result<T>>) -> Result<T> {
        let _queued = QueueGuard::enter(self, Queue::Combo);
        let _slot = self.inner.combo.lock().await;
        operation.await
    }

    async fn fetch(&self, group: Option<&str>, verb: &str, id: &ArticleId) -> Result<Response> {
        let selected = match group {
            Some(name) => Some(self.select_group(name, false).await?),
            None => None,
        };
        id.check_range(selected.as_ref())?;

        let mode = if verb == "STAT" {
            FrameMode::SingleLine
        } else {
            FrameMode::MultiLine
        };
        self.wait_ready().await?;
        let expected = id.to_string();
        self.exchange(&format!("{} {}", verb, expected), mode, Some(&expected))
            .await
    }

    async fn select_group(&self, name: &str, force: bool) -> Result<GroupInfo> {
        if !force
            && let Some(current) = lock(&self.inner.current_group).clone()
            && current.name == name
        {
            return Ok(current);
        }

        let response = self
            .submit(&format!("GROUP {}", name), FrameMode::SingleLine)
            .await?;
        let info = GroupInfo::parse(response.message(), name)?;

        self.inner.info.set_group(info.clone());
        *lock(&self.inner.current_group) = Some(info.clone());
        Ok(info)
    }

    async fn load_overview_format(&self, force: bool) -> Result<Vec<OverviewField>> {
        if !force && let Some(cached) = self.inner.info.overview_format() {
            return Ok(cached);
        }

        let response = self
            .submit("LIST OVERVIEW.FMT", FrameMode::MultiLine)
            .await?;
        let format = parse_overview_format(response.lines());
        self.inner.info.set_overview_format(format.clone());
        Ok(format)
    }

    async fn wait_ready(&self) -> Result<()> {
        let mut state = self.inner.state.subscribe();
        let reached = state
            .wait_for(|s| matches!(s, WorkerState::Ready | WorkerState::Closed))
            .await
            .map(|s| *s);

        match reached {
            Ok(WorkerState::Ready) => Ok(()),
            _ => Err(self.closed_error()),
        }
    }

    /// Send one command on the wire, bypassing the authentication wait
    ///
    /// `expected` names the article an article command asks for, so late
    /// replies to earlier timed-out commands can be told apart.
    async fn exchange(&self, command: &str, mode: FrameMode, expected: Option<&str>) -> Result<Response> {
        let _queued = QueueGuard::enter(self, Queue::Comm);
        let mut slot = self.inner.conn.lock().await;

        if self.inner.closed.is_cancelled() {
            return Err(self.closed_error());
        }
        let Some(conn) = slot.as_mut() else {
            return Err(self.closed_error());
        };

        let settings = &self.inner.settings;
        if settings.debug {
            tracing::debug!(worker = %self.id(), command = %redact(command), "->");
        }
        self.touch();

        let timeout = settings.command_timeout;
        let outcome = tokio::select! {
            outcome = tokio::time::timeout(timeout, conn.roundtrip(command, mode, expected, settings.convert_newlines)) => outcome,
            _ = self.inner.closed.cancelled() => Ok(Err(self.closed_error())),
        };

        match outcome {
            Err(_) => {
                // The reply may still come; buffered bytes stay so it is framed whole
                conn.abandoned += 1;
                tracing::warn!(
                    worker = %self.id(),
                    command = %redact(command),
                    timeout_ms = timeout.as_millis(),
                    "Command timed out"
                );
                Err(Error::Timeout(timeout))
            }
            Ok(Err(e)) if e.is_transport() => {
                slot.take();
                drop(slot);
                self.fail(e.to_string());
                Err(e)
            }
            Ok(result) => {
                if settings.debug {
                    match &result {
                        Ok(r) => tracing::debug!(worker = %self.id(), status = r.code(), message = %r.message(), "<-"),
                        Err(e) => tracing::debug!(worker = %self.id(), error = %e, "<-"),
                    }
                }
                result
            }
        }
    }

    fn closed_error(&self) -> Error {
        let reason = lock(&self.inner.last_error)
            .clone()
            .unwrap_or_else(|| "connection closed".to_string());
        Error::Transport(reason)
    }

    fn fail(&self, reason: String) {
        let was_ready = self.is_ready();
        *lock(&self.inner.last_error) = Some(reason.clone());
        self.inner.closed.cancel();
        self.set_state(WorkerState::Closed);
        self.report_closed_with(Some(reason), was_ready);
    }

    fn report_closed(&self, error: Option<String>) {
        self.report_closed_with(error, true);
    }

    fn report_closed_with(&self, error: Option<String>, was_ready: bool) {
        if self.inner.closed_reported.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(events) = &self.inner.events {
            let _ = events.send(WorkerEvent::Closed {
                id: self.id(),
                error,
                was_ready,
            });
        }
    }

    fn set_state(&self, state: WorkerState) {
        self.inner.state.send_if_modified(|current| {
            // Closed is terminal
            if *current == state || *current == WorkerState::Closed {
                return false;
            }
            *current = state;
            true
        });
    }

    fn counter(&self, queue: Queue) -> &AtomicUsize {
        match queue {
            Queue::Comm => &self.inner.comm_count,
            Queue::Combo => &self.inner.combo_count,
        }
    }

    fn touch(&self) {
        *lock(&self.inner.last_activity) = Instant::now();
    }

    fn announce_if_free(&self) {
        if self.is_ready()
            && self.busy() == 0
            && let Some(events) = &self.inner.events
        {
            let _ = events.send(WorkerEvent::Free(self.id()));
        }
    }
}

fn redact(command: &str) -> &str {
    if command.starts_with("AUTHINFO PASS") {
        "AUTHINFO PASS ****"
    } else {
        command
    }
}

/// A worker handed out by the pool
///
/// While a lease is alive the worker counts as busy, so the pool does not
/// hand the same idle worker to a second request before the first has queued
/// its command. Dropping the lease announces the worker if it became free.
pub struct WorkerLease {
    worker: Worker,
}

impl WorkerLease {
    pub(crate) fn new(worker: Worker) -> Self {
        worker.inner.leases.fetch_add(1, Ordering::SeqCst);
        Self { worker }
    }
}

impl Deref for WorkerLease {
    type Target = Worker;

    fn deref(&self) -> &Worker {
        &self.worker
    }
}

impl fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("WorkerLease").field(&self.worker).finish()
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.worker.inner.leases.fetch_sub(1, Ordering::SeqCst);
        self.worker.announce_if_free();
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::ZlibEncoder;
    use std::io::Write;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream};

    fn settings(timeout: Duration) -> WorkerSettings {
        WorkerSettings {
            host: "news.example.com".into(),
            port: 119,
            secure: false,
            credentials: None,
            command_timeout: timeout,
            debug: true,
            convert_newlines: false,
        }
    }

    /// Server side of a duplex that answers each expected command in order.
    /// A `None` reply leaves the command unanswered.
    fn scripted(
        greeting: &'static str,
        script: Vec<(&'static str, Option<Vec<u8>>)>,
    ) -> (DuplexStream, tokio::task::JoinHandle<Vec<String>>) {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let handle = tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(server);
            let mut lines = BufReader::new(read).lines();
            let mut seen = Vec::new();
            write.write_all(greeting.as_bytes()).await.unwrap();

            for (expected, reply) in script {
                let Ok(Some(line)) = lines.next_line().await else {
                    break;
                };
                assert_eq!(line, expected, "unexpected command");
                seen.push(line);
                if let Some(reply) = reply {
                    write.write_all(&reply).await.unwrap();
                }
            }
            seen
        });
        (client, handle)
    }

    fn reply(text: &str) -> Option<Vec<u8>> {
        Some(text.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn body_is_unstuffed_and_group_cached() {
        let (stream, server) = scripted(
            "200 welcome\r\n",
            vec![
                ("GROUP alt.binaries.test", reply("211 2 2 5 alt.binaries.test\r\n")),
                ("BODY <a@b>", reply("222 0 <a@b>\r\n..line\r\nplain\r\n.\r\n")),
                ("BODY <c@d>", reply("222 0 <c@d>\r\nsecond\r\n.\r\n")),
            ],
        );

        let worker = Worker::with_stream(stream, settings(Duration::from_secs(5)), Arc::new(ServerInfo::new("h")))
            .await
            .unwrap();

        let body = worker
            .body(Some("alt.binaries.test"), &ArticleId::message_id("a@b"))
            .await
            .unwrap();
        assert_eq!(body, b".line\r\nplain");

        let body = worker
            .body(Some("alt.binaries.test"), &ArticleId::message_id("c@d"))
            .await
            .unwrap();
        assert_eq!(body, b"second");

        assert_eq!(worker.current_group().as_deref(), Some("alt.binaries.test"));
        assert_eq!(server.await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn authinfo_sends_password_on_381() {
        let (stream, server) = scripted(
            "200 welcome\r\n",
            vec![
                ("AUTHINFO USER alice", reply("381 password please\r\n")),
                ("AUTHINFO PASS secret", reply("281 ok\r\n")),
            ],
        );

        let mut settings = settings(Duration::from_secs(5));
        settings.credentials = Some(("alice".into(), "secret".into()));

        let worker = Worker::with_stream(stream, settings, Arc::new(ServerInfo::new("h")))
            .await
            .unwrap();
        assert!(worker.is_ready());
        assert_eq!(server.await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn rejected_credentials_fail_the_connection() {
        let (stream, _server) = scripted(
            "200 welcome\r\n",
            vec![("AUTHINFO USER alice", reply("481 go away\r\n"))],
        );

        let mut settings = settings(Duration::from_secs(5));
        settings.credentials = Some(("alice".into(), "secret".into()));

        let err = Worker::with_stream(stream, settings, Arc::new(ServerInfo::new("h")))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), Some(481));
    }

    #[tokio::test]
    async fn timeout_frees_the_command_slot() {
        let (stream, _server) = scripted(
            "200 welcome\r\n",
            vec![
                ("STAT <slow@x>", None),
                ("STAT <fast@x>", reply("223 7 <fast@x>\r\n")),
            ],
        );

        let worker = Worker::with_stream(
            stream,
            settings(Duration::from_millis(150)),
            Arc::new(ServerInfo::new("h")),
        )
        .await
        .unwrap();

        let err = worker
            .stat(None, &ArticleId::message_id("slow@x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
        assert!(worker.is_ready(), "timeout must not close the socket");

        let (number, id) = worker
            .stat(None, &ArticleId::message_id("fast@x"))
            .await
            .unwrap();
        assert_eq!(number, 7);
        assert_eq!(id, "<fast@x>");
        assert_eq!(worker.busy(), 0);
    }

    /// Answers the first command only after `delay`, the rest immediately
    fn late_first_reply(
        delay: Duration,
        replies: Vec<&'static str>,
    ) -> DuplexStream {
        let (client, server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(server);
            let mut lines = BufReader::new(read).lines();
            write.write_all(b"200 welcome\r\n").await.unwrap();

            for (i, reply) in replies.into_iter().enumerate() {
                if lines.next_line().await.unwrap().is_none() {
                    return;
                }
                if i == 0 {
                    tokio::time::sleep(delay).await;
                }
                write.write_all(reply.as_bytes()).await.unwrap();
            }
        });
        client
    }

    #[tokio::test]
    async fn late_reply_is_not_taken_for_the_next_article() {
        let stream = late_first_reply(
            Duration::from_millis(250),
            vec![
                "222 0 <slow@x>\r\nSLOW-BODY\r\n.\r\n",
                "222 0 <fast@x>\r\nFAST-BODY\r\n.\r\n",
            ],
        );
        let worker = Worker::with_stream(
            stream,
            settings(Duration::from_millis(150)),
            Arc::new(ServerInfo::new("h")),
        )
        .await
        .unwrap();

        let err = worker
            .body(None, &ArticleId::message_id("slow@x"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)), "got {:?}", err);

        let body = worker
            .body(None, &ArticleId::message_id("fast@x"))
            .await
            .unwrap();
        assert_eq!(body, b"FAST-BODY");
        assert!(worker.is_ready());
    }

    #[tokio::test]
    async fn late_article_reply_is_skipped_before_group_reply() {
        let stream = late_first_reply(
            Duration::from_millis(250),
            vec![
                "222 0 <slow@x>\r\nSLOW-BODY\r\n.\r\n",
                "211 3 1 3 alt.test\r\n",
            ],
        );
        let worker = Worker::with_stream(
            stream,
            settings(Duration::from_millis(150)),
            Arc::new(ServerInfo::new("h")),
        )
        .await
        .unwrap();

        assert!(worker.body(None, &ArticleId::message_id("slow@x")).await.is_err());

        let info = worker.group("alt.test", false).await.unwrap();
        assert_eq!((info.count, info.low, info.high), (3, 1, 3));
    }

    #[tokio::test]
    async fn protocol_error_keeps_worker_usable() {
        let (stream, _server) = scripted(
            "201 no posting\r\n",
            vec![
                ("BODY <gone@x>", reply("430 no such article\r\n")),
                ("BODY <here@x>", reply("222 0 <here@x>\r\nok\r\n.\r\n")),
            ],
        );

        let worker = Worker::with_stream(stream, settings(Duration::from_secs(5)), Arc::new(ServerInfo::new("h")))
            .await
            .unwrap();

        let err = worker
            .body(None, &ArticleId::message_id("gone@x"))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), Some(430));

        let body = worker
            .body(None, &ArticleId::message_id("here@x"))
            .await
            .unwrap();
        assert_eq!(body, b"ok");
    }

    #[tokio::test]
    async fn closed_socket_is_transport_error() {
        let (stream, server) = scripted("200 welcome\r\n", vec![]);
        let worker = Worker::with_stream(stream, settings(Duration::from_secs(5)), Arc::new(ServerInfo::new("h")))
            .await
            .unwrap();
        server.await.unwrap();

        let err = worker
            .body(None, &ArticleId::message_id("x@y"))
            .await
            .unwrap_err();
        assert!(err.is_transport());
        assert_eq!(worker.state(), WorkerState::Closed);

        let again = worker
            .body(None, &ArticleId::message_id("x@y"))
            .await
            .unwrap_err();
        assert!(again.is_transport());
    }

    #[tokio::test]
    async fn capabilities_and_active_list_are_cached_per_host() {
        let info = Arc::new(ServerInfo::new("h"));
        let (stream, server) = scripted(
            "200 welcome\r\n",
            vec![
                ("CAPABILITIES", reply("101 caps\r\nVERSION 2\r\nREADER\r\n.\r\n")),
                ("LIST ACTIVE", reply("215 list\r\nalt.test 10 1 y\r\n.\r\n")),
                ("LIST ACTIVE alt.*", reply("215 list\r\nalt.test 11 1 y\r\n.\r\n")),
            ],
        );
        let worker = Worker::with_stream(stream, settings(Duration::from_secs(5)), info.clone())
            .await
            .unwrap();

        let caps = worker.capabilities(false).await.unwrap();
        assert!(caps.contains("reader"));
        assert_eq!(worker.capabilities(false).await.unwrap(), caps);

        let all = worker.list_newsgroups(None, false).await.unwrap();
        assert_eq!(all[0].high, 10);
        assert_eq!(worker.list_newsgroups(None, false).await.unwrap(), all);

        let filtered = worker.list_newsgroups(Some("alt.*"), false).await.unwrap();
        assert_eq!(filtered[0].high, 11);
        assert_eq!(info.active_list().unwrap()[0].high, 10);

        assert_eq!(server.await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn overview_falls_back_to_xover_and_remembers() {
        let info = Arc::new(ServerInfo::new("h"));
        let (stream, server) = scripted(
            "200 welcome\r\n",
            vec![
                ("GROUP alt.test", reply("211 3 1 3 alt.test\r\n")),
                ("LIST OVERVIEW.FMT", reply("215 fmt\r\nSubject:\r\n:bytes\r\n.\r\n")),
                ("XZVER 1-2", reply("500 what?\r\n")),
                ("XOVER 1-2", reply("224 ov\r\n1\tfirst\t100\r\n2\tsecond\t200\r\n.\r\n")),
                ("XOVER 3-3", reply("224 ov\r\n3\tthird\t300\r\n.\r\n")),
            ],
        );
        let worker = Worker::with_stream(stream, settings(Duration::from_secs(5)), info.clone())
            .await
            .unwrap();

        let rows = worker.overview("alt.test", 1, 2).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get("subject"), Some("second"));
        assert_eq!(rows[1].get("bytes"), Some("200"));
        assert_eq!(info.xzver(), Some(false));

        let rows = worker.overview("alt.test", 3, 3).await.unwrap();
        assert_eq!(rows[0].number(), Some(3));
        assert_eq!(server.await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn overview_uses_compressed_reply_when_available() {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"5\tzipped\r\n.\r\n").unwrap();
        let mut compressed = b"224 compressed\r\n".to_vec();
        compressed.extend(encoder.finish().unwrap());

        let (stream, _server) = scripted(
            "200 welcome\r\n",
            vec![
                ("GROUP alt.test", reply("211 1 5 5 alt.test\r\n")),
                ("LIST OVERVIEW.FMT", reply("215 fmt\r\nSubject:\r\n.\r\n")),
                ("XZVER 5-5", Some(compressed)),
            ],
        );
        let worker = Worker::with_stream(stream, settings(Duration::from_secs(5)), Arc::new(ServerInfo::new("h")))
            .await
            .unwrap();

        let rows = worker.overview("alt.test", 5, 5).await.unwrap();
        assert_eq!(rows[0].get("subject"), Some("zipped"));
    }

    #[tokio::test]
    async fn explicit_busy_and_leases_raise_busyness() {
        let (stream, _server) = scripted("200 welcome\r\n", vec![]);
        let worker = Worker::with_stream(stream, settings(Duration::from_secs(5)), Arc::new(ServerInfo::new("h")))
            .await
            .unwrap();
        assert_eq!(worker.busy(), 0);

        let lease = WorkerLease::new(worker.clone());
        assert_eq!(worker.busy(), 1);
        drop(lease);
        assert_eq!(worker.busy(), 0);

        worker.set_busy(true);
        assert_eq!(worker.busy(), EXPLICIT_BUSY);
        worker.set_busy(false);
        assert_eq!(worker.busy(), 0);
    }

    #[tokio::test]
    async fn bad_greeting_is_rejected() {
        let (stream, _server) = scripted("502 go away\r\n", vec![]);
        let err = Worker::with_stream(stream, settings(Duration::from_secs(5)), Arc::new(ServerInfo::new("h")))
            .await
            .unwrap_err();
        assert_eq!(err.status_code(), Some(502));
    }
}
