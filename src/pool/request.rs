//! Handles returned by the pool for queued work

use crate::cancellable::{CancellableTask, TaskState};
use crate::error::{Error, Result};
use crate::nntp::WorkerLease;
use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Weight used when the caller does not pick one
pub const DEFAULT_WEIGHT: i64 = 10;

/// A request waiting for a worker
pub(crate) struct PendingRequest {
    pub seq: u64,
    pub group: Option<String>,
    pub weight: i64,
    pub task: CancellableTask,
    pub reply: oneshot::Sender<Result<WorkerLease>>,
    /// Currently included in the pool's waiting counter
    pub counted: bool,
}

impl PendingRequest {
    /// Ordering key: heavier first, then earlier
    pub fn goes_before(&self, weight: i64, seq: u64) -> bool {
        self.weight > weight || (self.weight == weight && self.seq < seq)
    }

    /// Hand the lease (or an error) to the requester unless the task was withdrawn
    pub fn deliver(self, outcome: Result<WorkerLease>) {
        let reply = self.reply;
        self.task.execute(move || {
            let _ = reply.send(outcome);
        });
    }
}

/// Future resolving to a leased worker
///
/// Dropping it before it resolves withdraws the request.
pub struct WorkerRequest {
    pub(crate) task: CancellableTask,
    pub(crate) rx: oneshot::Receiver<Result<WorkerLease>>,
}

impl WorkerRequest {
    /// Control handle for the queued request
    pub fn task(&self) -> &CancellableTask {
        &self.task
    }

    /// Withdraw the request; returns false if it was already served or withdrawn
    pub fn cancel(&self) -> bool {
        self.task.cancel()
    }
}

impl Future for WorkerRequest {
    type Output = Result<WorkerLease>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(Error::Cancelled)))
    }
}

impl Drop for WorkerRequest {
    fn drop(&mut self) {
        if matches!(self.task.state(), TaskState::Pending | TaskState::Paused) {
            self.task.cancel();
        }
    }
}

/// A queued pool operation running in the background
///
/// Awaiting it yields the operation's result. The task handle can pause,
/// resume or cancel the operation until a worker has been assigned.
pub struct Job<T> {
    task: CancellableTask,
    handle: JoinHandle<Result<T>>,
}

impl<T> Job<T> {
    pub(crate) fn new(task: CancellableTask, handle: JoinHandle<Result<T>>) -> Self {
        Self { task, handle }
    }

    /// Control handle for the queued request
    pub fn task(&self) -> &CancellableTask {
        &self.task
    }

    /// Withdraw the operation if it has not been assigned a worker yet
    pub fn cancel(&self) -> bool {
        self.task.cancel()
    }

    /// Hold the operation back
    pub fn pause(&self) -> bool {
        self.task.pause()
    }

    /// Let a paused operation be scheduled again
    pub fn resume(&self) -> bool {
        self.task.resume()
    }
}

impl<T> Future for Job<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        Pin::new(&mut this.handle).poll(cx).map(|joined| match joined {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Err(Error::Cancelled),
            Err(e) => Err(Error::Other(format!("pool job failed: {}", e))),
        })
    }
}
