//! One-shot deferred work that can be withdrawn, paused and resumed
//!
//! A [`CancellableTask`] stands in for a unit of work that has been queued but
//! not yet started. Whoever queued it keeps a clone and may cancel, pause or
//! resume it; whoever eventually serves it calls [`CancellableTask::execute`].
//!
//! The wrapped work runs at most once, no matter how many times `execute` is
//! called or how many pause/resume cycles happen in between.

use crate::utils::lock;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Notification raised by a task on every state-relevant call
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskSignal {
    /// `cancel()` on a task that was already cancelled
    AlreadyCancelled,
    /// `cancel()` or `execute()` on a task that already ran
    AlreadyExecuted,
    /// The task was cancelled
    Cancelled,
    /// The task was paused
    Paused,
    /// The task was resumed
    Resumed,
    /// `execute()` was refused because the task is cancelled
    ExecutionPrevented,
    /// `execute()` was deferred until the next resume
    ExecutionDelayed,
    /// The work ran
    Executed,
}

/// Observable lifecycle state
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting to be executed
    Pending,
    /// Waiting, but execution is held back until resumed
    Paused,
    /// Withdrawn; will never run
    Cancelled,
    /// Ran; terminal
    Executed,
}

/// Result of a call to [`CancellableTask::execute`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Execution {
    /// The work ran during this call
    Ran,
    /// The task was cancelled, nothing ran
    Prevented,
    /// The task is paused, the work will run on the next resume
    Delayed,
    /// The task had already run
    AlreadyExecuted,
}

type Work = Box<dyn FnOnce() + Send>;
type Listener = Arc<dyn Fn(TaskSignal) + Send + Sync>;

#[derive(Default)]
struct Inner {
    cancelled: bool,
    paused: bool,
    executed: bool,
    job: Option<Work>,
    deferred: Vec<Work>,
    listeners: Vec<Listener>,
}

/// Handle to a cancellable one-shot unit of work
///
/// Clones share state.
#[derive(Clone, Default)]
pub struct CancellableTask {
    inner: Arc<Mutex<Inner>>,
}

impl fmt::Debug for CancellableTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancellableTask")
            .field("state", &self.state())
            .finish()
    }
}

impl CancellableTask {
    /// A pending task with no bound job
    pub fn new() -> Self {
        Self::default()
    }

    /// A pending task whose `job` runs before the function given to `execute`
    pub fn with_job(job: impl FnOnce() + Send + 'static) -> Self {
        let task = Self::default();
        lock(&task.inner).job = Some(Box::new(job));
        task
    }

    /// Register a listener for every signal this task raises
    ///
    /// Listeners run on the calling thread after the task's lock is released,
    /// so they may call back into the task.
    pub fn on_signal(&self, listener: impl Fn(TaskSignal) + Send + Sync + 'static) {
        lock(&self.inner).listeners.push(Arc::new(listener));
    }

    /// Current state
    pub fn state(&self) -> TaskState {
        let inner = lock(&self.inner);
        if inner.executed {
            TaskState::Executed
        } else if inner.cancelled {
            TaskState::Cancelled
        } else if inner.paused {
            TaskState::Paused
        } else {
            TaskState::Pending
        }
    }

    /// True once cancelled
    pub fn is_cancelled(&self) -> bool {
        self.state() == TaskState::Cancelled
    }

    /// True while paused
    pub fn is_paused(&self) -> bool {
        self.state() == TaskState::Paused
    }

    /// True once the work ran
    pub fn is_executed(&self) -> bool {
        self.state() == TaskState::Executed
    }

    /// Withdraw the task
    ///
    /// Returns `false` (and signals why) when it was already cancelled or
    /// already executed.
    pub fn cancel(&self) -> bool {
        let signal = {
            let mut inner = lock(&self.inner);
            if inner.cancelled {
                TaskSignal::AlreadyCancelled
            } else if inner.executed {
                TaskSignal::AlreadyExecuted
            } else {
                inner.cancelled = true;
                inner.paused = false;
                inner.deferred.clear();
                inner.job = None;
                TaskSignal::Cancelled
            }
        };

        self.emit(signal);
        signal == TaskSignal::Cancelled
    }

    /// Hold back execution until [`resume`](Self::resume)
    ///
    /// No-op unless the task is pending.
    pub fn pause(&self) -> bool {
        {
            let mut inner = lock(&self.inner);
            if inner.cancelled || inner.executed || inner.paused {
                return false;
            }
            inner.paused = true;
        }

        self.emit(TaskSignal::Paused);
        true
    }

    /// Lift a pause and replay any execution that was deferred by it
    ///
    /// No-op unless the task is paused.
    pub fn resume(&self) -> bool {
        let deferred = {
            let mut inner = lock(&self.inner);
            if !inner.paused || inner.cancelled || inner.executed {
                return false;
            }
            inner.paused = false;
            std::mem::take(&mut inner.deferred)
        };

        self.emit(TaskSignal::Resumed);

        for work in deferred {
            self.execute(work);
        }
        true
    }

    /// Run the bound job and then `f`, unless cancelled, paused or already run
    ///
    /// The task is pinned as executed before any work runs, so re-entrant
    /// calls from inside `f` cannot run it twice.
    pub fn execute(&self, f: impl FnOnce() + Send + 'static) -> Execution {
        let job = {
            let mut inner = lock(&self.inner);
            if inner.cancelled {
                drop(inner);
                self.emit(TaskSignal::ExecutionPrevented);
                return Execution::Prevented;
            }
            if inner.executed {
                drop(inner);
                self.emit(TaskSignal::AlreadyExecuted);
                return Execution::AlreadyExecuted;
            }
            if inner.paused {
                inner.deferred.push(Box::new(f));
                drop(inner);
                self.emit(TaskSignal::ExecutionDelayed);
                return Execution::Delayed;
            }
            inner.executed = true;
            inner.job.take()
        };

        if let Some(job) = job {
            job();
        }
        f();

        self.emit(TaskSignal::Executed);
        Execution::Ran
    }

    fn emit(&self, signal: TaskSignal) {
        let listeners = lock(&self.inner).listeners.clone();
        for listener in listeners {
            listener(signal);
        }
    }
}
