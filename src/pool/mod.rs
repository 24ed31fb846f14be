//! Connection pool and request scheduler
//!
//! The pool turns a capped set of [`Worker`]s into a priority-aware work queue.
//! Callers ask for a worker with [`Pool::request_worker`] (or use one of the
//! high-level operations such as [`Pool::body`]); the pool either hands out a
//! free worker right away or parks the request until one announces itself
//! free, always serving the heaviest waiting request first.
//!
//! A background dispatcher owns the reaction to worker announcements and the
//! periodic idle eviction. It stops when the pool is closed or dropped.

mod request;

pub use request::{DEFAULT_WEIGHT, Job, WorkerRequest};

use crate::cancellable::{CancellableTask, TaskSignal};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::nntp::worker::WorkerEvent;
use crate::nntp::{
    ActiveGroup, Article, ArticleId, GroupInfo, OverviewEntry, OverviewField, ServerInfo, Worker,
    WorkerId, WorkerLease, WorkerSettings, WorkerStats,
};
use crate::utils::lock;
use request::PendingRequest;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Sizing and eviction policy of a pool
#[derive(Clone, Debug)]
pub struct PoolOptions {
    /// Upper bound on simultaneously open connections
    pub max_connections: usize,
    /// A worker idle this long may be evicted
    pub idle_timeout: Duration,
    /// How often idle workers are looked for
    pub idle_check_interval: Duration,
}

impl PoolOptions {
    /// Options taken from the client configuration
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_connections: config.server.connections,
            idle_timeout: config.idle_timeout,
            idle_check_interval: config.idle_check_interval,
        }
    }
}

/// Point-in-time view of the pool
#[derive(Clone, Debug)]
pub struct PoolStats {
    /// Live workers
    pub workers: Vec<WorkerStats>,
    /// Requests parked until a worker frees up
    pub pending: usize,
    /// Parked requests that are not paused
    pub waiting: usize,
    /// Connection cap
    pub max_connections: usize,
}

#[derive(Default)]
struct PoolState {
    workers: Vec<Worker>,
    pending: Vec<PendingRequest>,
    waiting: usize,
    closed: bool,
}

impl PoolState {
    fn alive(&self) -> impl Iterator<Item = &Worker> {
        self.workers.iter().filter(|w| w.is_alive())
    }

    fn has_runnable(&self) -> bool {
        self.pending
            .iter()
            .any(|p| !p.task.is_paused() && !p.task.is_cancelled())
    }
}

struct PoolInner {
    settings: WorkerSettings,
    options: PoolOptions,
    info: Arc<ServerInfo>,
    state: Mutex<PoolState>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    next_worker: AtomicU64,
    next_seq: AtomicU64,
    shutdown: CancellationToken,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        self.shutdown.cancel();
        for worker in lock(&self.state).workers.drain(..) {
            worker.destroy();
        }
    }
}

/// Scheduler over a bounded set of connections to one server
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Create an empty pool; connections are opened on demand
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(settings: WorkerSettings, options: PoolOptions) -> Self {
        let (events, receiver) = mpsc::unbounded_channel();
        let info = Arc::new(ServerInfo::new(settings.host.clone()));

        let inner = Arc::new(PoolInner {
            settings,
            options,
            info,
            state: Mutex::new(PoolState::default()),
            events,
            next_worker: AtomicU64::new(1),
            next_seq: AtomicU64::new(0),
            shutdown: CancellationToken::new(),
        });

        spawn_dispatcher(Arc::downgrade(&inner), receiver, inner.shutdown.clone(), inner.options.idle_check_interval);

        Self { inner }
    }

    /// Pool configured from the client configuration
    pub fn from_config(config: &Config) -> Self {
        Self::new(WorkerSettings::from_config(config), PoolOptions::from_config(config))
    }

    /// Cache shared by every worker of this pool
    pub fn server_info(&self) -> &Arc<ServerInfo> {
        &self.inner.info
    }

    /// Ask for a worker, preferring one already positioned on `group`
    ///
    /// Scheduling happens on the next tick. The returned future resolves to a
    /// lease once a worker is assigned; its task handle can cancel, pause or
    /// resume the request until then.
    pub fn request_worker(&self, group: Option<&str>, weight: Option<i64>) -> WorkerRequest {
        let task = CancellableTask::new();
        let (reply, rx) = oneshot::channel();
        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);

        let pool = Arc::downgrade(&self.inner);
        task.on_signal(move |signal| {
            if let Some(inner) = pool.upgrade() {
                Pool { inner }.on_task_signal(seq, signal);
            }
        });

        let entry = PendingRequest {
            seq,
            group: group.map(str::to_string),
            weight: weight.unwrap_or(DEFAULT_WEIGHT),
            task: task.clone(),
            reply,
            counted: false,
        };

        let pool = self.clone();
        tokio::spawn(async move { pool.schedule(entry) });

        WorkerRequest { task, rx }
    }

    /// Fetch an article's headers
    pub fn head(&self, group: Option<&str>, id: ArticleId, weight: Option<i64>) -> Job<Article> {
        let target = group.map(str::to_string);
        self.linked(group, weight, move |worker| async move {
            worker.head(target.as_deref(), &id).await
        })
    }

    /// Fetch an article's body
    pub fn body(&self, group: Option<&str>, id: ArticleId, weight: Option<i64>) -> Job<Vec<u8>> {
        let target = group.map(str::to_string);
        self.linked(group, weight, move |worker| async move {
            worker.body(target.as_deref(), &id).await
        })
    }

    /// Fetch a whole article
    pub fn article(&self, group: Option<&str>, id: ArticleId, weight: Option<i64>) -> Job<Article> {
        let target = group.map(str::to_string);
        self.linked(group, weight, move |worker| async move {
            worker.article(target.as_deref(), &id).await
        })
    }

    /// Check that an article exists
    pub fn stat(&self, group: Option<&str>, id: ArticleId, weight: Option<i64>) -> Job<(u64, String)> {
        let target = group.map(str::to_string);
        self.linked(group, weight, move |worker| async move {
            worker.stat(target.as_deref(), &id).await
        })
    }

    /// Select a group on some worker
    pub fn group(&self, name: &str, force: bool) -> Job<GroupInfo> {
        let target = name.to_string();
        self.linked(Some(name), None, move |worker| async move {
            worker.group(&target, force).await
        })
    }

    /// Server capabilities
    pub fn capabilities(&self, force: bool) -> Job<BTreeSet<String>> {
        self.linked(None, None, move |worker| async move { worker.capabilities(force).await })
    }

    /// Active newsgroups, optionally filtered by a wildmat
    pub fn list_newsgroups(&self, wildmat: Option<&str>, force: bool) -> Job<Vec<ActiveGroup>> {
        let wildmat = wildmat.map(str::to_string);
        self.linked(None, None, move |worker| async move {
            worker.list_newsgroups(wildmat.as_deref(), force).await
        })
    }

    /// Overview column layout
    pub fn overview_format(&self, force: bool) -> Job<Vec<OverviewField>> {
        self.linked(None, None, move |worker| async move {
            worker.overview_format(force).await
        })
    }

    /// Overview rows for a range of a group
    pub fn overview(&self, group: &str, first: u64, last: u64) -> Job<Vec<OverviewEntry>> {
        let target = group.to_string();
        self.linked(Some(group), None, move |worker| async move {
            worker.overview(&target, first, last).await
        })
    }

    /// Snapshot of workers and queue depth
    pub fn stats(&self) -> PoolStats {
        let state = lock(&self.inner.state);
        PoolStats {
            workers: state.alive().map(Worker::stats).collect(),
            pending: state.pending.len(),
            waiting: state.waiting,
            max_connections: self.inner.options.max_connections,
        }
    }

    /// Fail every parked request, stop the dispatcher and close every connection
    ///
    /// Idle workers get a polite QUIT first; busy ones are cut off.
    pub async fn close(&self) {
        let (workers, pending) = {
            let mut state = lock(&self.inner.state);
            state.closed = true;
            state.waiting = 0;
            (
                std::mem::take(&mut state.workers),
                std::mem::take(&mut state.pending),
            )
        };

        self.inner.shutdown.cancel();

        for entry in pending {
            entry.task.cancel();
        }

        let goodbyes = workers.iter().map(|worker| async move {
            if worker.is_ready() && worker.busy() == 0 {
                worker.quit().await;
            } else {
                worker.destroy();
            }
        });
        futures::future::join_all(goodbyes).await;

        tracing::info!(host = %self.inner.settings.host, workers = workers.len(), "Pool closed");
    }

    fn linked<T, F, Fut>(&self, group: Option<&str>, weight: Option<i64>, operation: F) -> Job<T>
    where
        T: Send + 'static,
        F: FnOnce(WorkerLease) -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
    {
        let request = self.request_worker(group, weight);
        let task = request.task().clone();

        let handle = tokio::spawn(async move {
            let worker = request.await?;
            operation(worker).await
        });

        Job::new(task, handle)
    }

    fn schedule(&self, mut entry: PendingRequest) {
        if entry.task.is_cancelled() {
            return;
        }

        let worker = {
            let mut state = lock(&self.inner.state);
            if state.closed {
                drop(state);
                entry.deliver(Err(Error::Cancelled));
                return;
            }

            match self.get_or_create_worker(&mut state, entry.group.as_deref()) {
                Some(worker) if worker.is_ready() && worker.busy() == 0 => worker,
                _ => {
                    if !entry.task.is_paused() {
                        entry.counted = true;
                        state.waiting += 1;
                    }
                    let pos = state
                        .pending
                        .partition_point(|p| p.goes_before(entry.weight, entry.seq));
                    state.pending.insert(pos, entry);
                    return;
                }
            }
        };

        entry.deliver(Ok(WorkerLease::new(worker)));
    }

    /// Pick the worker a new request should go to, opening a connection when
    /// allowed. `None` means the request has to wait.
    fn get_or_create_worker(&self, state: &mut PoolState, group: Option<&str>) -> Option<Worker> {
        let mut idle = Vec::new();
        let mut upstarts = Vec::new();

        for worker in state.alive() {
            let busy = worker.busy();
            if worker.is_ready() && busy == 0 {
                if group.is_some() && worker.current_group().as_deref() == group {
                    return Some(worker.clone());
                }
                idle.push(worker.clone());
            } else if worker.is_starting() && busy == 1 {
                upstarts.push(worker.clone());
            }
        }

        if let Some(worker) = idle.into_iter().next() {
            return Some(worker);
        }

        let alive = state.alive().count();
        if alive < self.inner.options.max_connections {
            if state.waiting == 0
                && let Some(worker) = upstarts.into_iter().next()
            {
                return Some(worker);
            }
            return Some(self.open_worker(state));
        }

        let mut ranked: Vec<&Worker> = state.alive().collect();
        ranked.sort_by_key(|w| w.busy());
        ranked.truncate(ranked.len().div_ceil(2));

        ranked
            .iter()
            .find(|w| group.is_some() && w.current_group().as_deref() == group)
            .or_else(|| ranked.first())
            .map(|w| (*w).clone())
    }

    fn open_worker(&self, state: &mut PoolState) -> Worker {
        let id = WorkerId(self.inner.next_worker.fetch_add(1, Ordering::SeqCst));
        tracing::debug!(
            worker = %id,
            host = %self.inner.settings.host,
            open = state.alive().count() + 1,
            "Opening connection"
        );

        let worker = Worker::spawn(
            id,
            self.inner.settings.clone(),
            self.inner.info.clone(),
            self.inner.events.clone(),
        );
        state.workers.push(worker.clone());
        worker
    }

    /// Serve the heaviest runnable request with a worker that just became free
    fn dispatch(&self, id: WorkerId) {
        let handoff = {
            let mut state = lock(&self.inner.state);
            if state.closed {
                return;
            }
            let Some(worker) = state.workers.iter().find(|w| w.id() == id).cloned() else {
                return;
            };
            if !worker.is_ready() || worker.busy() != 0 {
                return;
            }

            let mut withdrawn = 0;
            state.pending.retain(|p| {
                let keep = !p.task.is_cancelled();
                if !keep && p.counted {
                    withdrawn += 1;
                }
                keep
            });
            state.waiting -= withdrawn;

            let Some(pos) = state.pending.iter().position(|p| !p.task.is_paused()) else {
                return;
            };
            let mut entry = state.pending.remove(pos);
            if entry.counted {
                entry.counted = false;
                state.waiting -= 1;
            }

            (entry, WorkerLease::new(worker))
        };

        let (entry, lease) = handoff;
        tracing::trace!(worker = %id, weight = entry.weight, "Dispatching parked request");
        entry.deliver(Ok(lease));
    }

    fn on_worker_closed(&self, id: WorkerId, error: Option<String>, was_ready: bool) {
        let orphans = {
            let mut state = lock(&self.inner.state);
            let before = state.workers.len();
            state.workers.retain(|w| w.id() != id);
            let removed = state.workers.len() != before;

            if !removed || state.closed || !state.has_runnable() {
                return;
            }

            let others = state.alive().count();
            if !was_ready && others == 0 {
                // The server cannot be reached at all; do not spin reconnecting
                state.waiting = 0;
                std::mem::take(&mut state.pending)
            } else {
                if others < self.inner.options.max_connections {
                    self.open_worker(&mut state);
                }
                return;
            }
        };

        let reason = error.unwrap_or_else(|| "connection closed".to_string());
        tracing::error!(
            host = %self.inner.settings.host,
            error = %reason,
            failed = orphans.len(),
            "Cannot connect, failing parked requests"
        );
        for entry in orphans {
            entry.deliver(Err(Error::Transport(reason.clone())));
        }
    }

    fn on_task_signal(&self, seq: u64, signal: TaskSignal) {
        let mut state = lock(&self.inner.state);
        let Some(pos) = state.pending.iter().position(|p| p.seq == seq) else {
            return;
        };

        match signal {
            TaskSignal::Cancelled => {
                let entry = state.pending.remove(pos);
                if entry.counted {
                    state.waiting -= 1;
                }
            }
            TaskSignal::Paused => {
                if state.pending[pos].counted {
                    state.pending[pos].counted = false;
                    state.waiting -= 1;
                }
            }
            TaskSignal::Resumed => {
                if !state.pending[pos].counted {
                    state.pending[pos].counted = true;
                    state.waiting += 1;
                }
                let free: Vec<WorkerId> = state
                    .alive()
                    .filter(|w| w.is_ready() && w.busy() == 0)
                    .map(Worker::id)
                    .collect();
                drop(state);
                for id in free {
                    self.dispatch(id);
                }
            }
            _ => {}
        }
    }

    /// Close workers that sat idle too long, always keeping at least one
    fn reap_idle(&self) {
        let victims = {
            let mut state = lock(&self.inner.state);
            let mut alive = state.alive().count();
            let mut victims = Vec::new();

            for worker in state.alive() {
                if alive <= 1 {
                    break;
                }
                if worker.is_ready()
                    && worker.busy() == 0
                    && worker.idle_for() > self.inner.options.idle_timeout
                {
                    victims.push(worker.clone());
                    alive -= 1;
                }
            }

            state
                .workers
                .retain(|w| !victims.iter().any(|v| v.id() == w.id()));
            victims
        };

        for worker in victims {
            tracing::debug!(worker = %worker.id(), idle_secs = worker.idle_for().as_secs(), "Evicting idle connection");
            tokio::spawn(async move { worker.quit().await });
        }
    }

    fn handle(&self, event: WorkerEvent) {
        match event {
            WorkerEvent::Free(id) => self.dispatch(id),
            WorkerEvent::Closed {
                id,
                error,
                was_ready,
            } => {
                if let Some(reason) = &error {
                    tracing::warn!(worker = %id, error = %reason, "Connection closed");
                }
                self.on_worker_closed(id, error, was_ready);
            }
        }
    }
}

fn spawn_dispatcher(
    pool: Weak<PoolInner>,
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    shutdown: CancellationToken,
    idle_check_interval: Duration,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(idle_check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => {
                    let (Some(event), Some(inner)) = (event, pool.upgrade()) else {
                        break;
                    };
                    Pool { inner }.handle(event);
                }
                _ = interval.tick() => {
                    let Some(inner) = pool.upgrade() else {
                        break;
                    };
                    Pool { inner }.reap_idle();
                }
            }
        }

        tracing::debug!("Pool dispatcher stopped");
    });
}
