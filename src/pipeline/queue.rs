//! Bounded, priority-ordered work queue
//!
//! Used twice: as the file queue that caps outstanding segment fetches across
//! every file, and as the decode queue that lets exactly one decode run at a
//! time with a minimum pause between decode starts.

use crate::error::{Error, Result};
use crate::utils::lock;
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;

struct Waiter {
    priority: i64,
    seq: u64,
    grant: oneshot::Sender<QueueSlot>,
}

impl Waiter {
    fn key(&self) -> (i64, Reverse<u64>) {
        (self.priority, Reverse(self.seq))
    }
}

impl PartialEq for Waiter {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for Waiter {}

impl PartialOrd for Waiter {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Waiter {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

#[derive(Default)]
struct QueueState {
    running: usize,
    waiters: BinaryHeap<Waiter>,
    seq: u64,
    last_start: Option<Instant>,
    closed: bool,
}

struct QueueInner {
    name: &'static str,
    limit: usize,
    spacing: Duration,
    state: Mutex<QueueState>,
}

/// Permission to run one unit of work; dropping it lets the next waiter in
pub struct QueueSlot {
    queue: Option<Arc<QueueInner>>,
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        if let Some(queue) = self.queue.take() {
            release(queue);
        }
    }
}

/// Hand the slot to the heaviest live waiter, or give it back
fn release(queue: Arc<QueueInner>) {
    let mut state = lock(&queue.state);
    while let Some(waiter) = state.waiters.pop() {
        let slot = QueueSlot {
            queue: Some(queue.clone()),
        };
        match waiter.grant.send(slot) {
            Ok(()) => return,
            Err(mut unclaimed) => {
                // Waiter gave up; keep the slot from releasing itself again
                unclaimed.queue = None;
            }
        }
    }
    state.running = state.running.saturating_sub(1);
}

/// Priority work queue with a concurrency limit and optional start spacing
#[derive(Clone)]
pub struct WorkQueue {
    inner: Arc<QueueInner>,
}

impl WorkQueue {
    /// Queue running at most `limit` jobs at once
    pub fn new(name: &'static str, limit: usize) -> Self {
        Self::throttled(name, limit, Duration::ZERO)
    }

    /// Queue that additionally waits `spacing` between job starts
    pub fn throttled(name: &'static str, limit: usize, spacing: Duration) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                name,
                limit: limit.max(1),
                spacing,
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Wait for a slot; heavier priorities are served first, ties in arrival order
    pub async fn acquire(&self, priority: i64) -> Result<QueueSlot> {
        let waiting = {
            let mut state = lock(&self.inner.state);
            if state.closed {
                return Err(Error::Cancelled);
            }
            if state.running < self.inner.limit && state.waiters.is_empty() {
                state.running += 1;
                None
            } else {
                let (grant, rx) = oneshot::channel();
                let seq = state.seq;
                state.seq += 1;
                state.waiters.push(Waiter {
                    priority,
                    seq,
                    grant,
                });
                Some(rx)
            }
        };

        let slot = match waiting {
            None => QueueSlot {
                queue: Some(self.inner.clone()),
            },
            Some(rx) => rx.await.map_err(|_| Error::Cancelled)?,
        };

        self.pace().await;
        Ok(slot)
    }

    /// Run `job` once a slot is free
    pub async fn run<F>(&self, priority: i64, job: F) -> Result<F::Output>
    where
        F: Future,
    {
        let _slot = self.acquire(priority).await?;
        Ok(job.await)
    }

    /// Refuse new work and fail everything still waiting
    pub fn close(&self) {
        let waiters = {
            let mut state = lock(&self.inner.state);
            state.closed = true;
            std::mem::take(&mut state.waiters)
        };
        tracing::debug!(queue = self.inner.name, dropped = waiters.len(), "Work queue closed");
    }

    /// Jobs currently holding a slot
    pub fn running(&self) -> usize {
        lock(&self.inner.state).running
    }

    /// Jobs waiting for a slot
    pub fn waiting(&self) -> usize {
        lock(&self.inner.state).waiters.len()
    }

    async fn pace(&self) {
        if self.inner.spacing.is_zero() {
            return;
        }

        let delay = {
            let mut state = lock(&self.inner.state);
            let now = Instant::now();
            let start = match state.last_start {
                Some(last) if last + self.inner.spacing > now => last + self.inner.spacing,
                _ => now,
            };
            state.last_start = Some(start);
            start - now
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn waiters_are_served_by_priority_then_arrival() {
        let queue = WorkQueue::new("test", 1);
        let held = queue.acquire(0).await.unwrap();

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for (tag, priority) in [("low", 1), ("high", 9), ("mid", 5), ("high2", 9)] {
            let queue = queue.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                let _slot = queue.acquire(priority).await.unwrap();
                lock(&order).push(tag);
            }));
            // Make arrival order deterministic
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        assert_eq!(queue.waiting(), 4);
        drop(held);
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(*lock(&order), vec!["high", "high2", "mid", "low"]);
        assert_eq!(queue.running(), 0);
    }

    #[tokio::test]
    async fn limit_bounds_concurrency() {
        let queue = WorkQueue::new("test", 3);
        let active = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let peak = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let queue = queue.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .run(0, async {
                        let now = active.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                        peak.fetch_max(now, std::sync::atomic::Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                        active.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
                    })
                    .await
                    .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert!(peak.load(std::sync::atomic::Ordering::SeqCst) <= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn throttle_spaces_job_starts() {
        let queue = WorkQueue::throttled("decode", 1, Duration::from_millis(50));
        let begin = Instant::now();

        for _ in 0..3 {
            queue.run(0, async {}).await.unwrap();
        }

        assert!(begin.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn abandoned_waiter_does_not_leak_the_slot() {
        let queue = WorkQueue::new("test", 1);
        let held = queue.acquire(0).await.unwrap();

        let abandoned = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.acquire(5).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        abandoned.abort();
        let _ = abandoned.await;

        drop(held);
        let again = tokio::time::timeout(Duration::from_secs(1), queue.acquire(0)).await;
        assert!(again.unwrap().is_ok());
    }

    #[tokio::test]
    async fn close_fails_waiters() {
        let queue = WorkQueue::new("test", 1);
        let _held = queue.acquire(0).await.unwrap();
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.acquire(0).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        queue.close();
        assert!(matches!(waiter.await.unwrap(), Err(Error::Cancelled)));
        assert!(matches!(queue.acquire(0).await, Err(Error::Cancelled)));
    }
}
