//! Per-run task queue
//!
//! Hands each pending task to exactly one worker. Claim and release happen
//! under one lock, so a task is never in `pending` and `in_flight` at the
//! same time. Pause and cancel signals arrive from the run state machine.

use std::collections::{HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::debug;

use crate::state::{RunId, Task, TaskKey, TaskStatus};

/// Error type for queue operations
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Task {task} belongs to run {actual}, not {expected}")]
    WrongRun {
        task: TaskKey,
        expected: RunId,
        actual: RunId,
    },

    #[error("Task {0} is not pending")]
    NotPending(TaskKey),

    #[error("Task {0} is already queued")]
    Duplicate(TaskKey),

    #[error("Queue is closed")]
    Closed,
}

/// Result type for queue operations
pub type QueueResult<T> = Result<T, QueueError>;

/// Whether workers may claim tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueGate {
    Open,
    /// Claims wait until resumed
    Paused,
    /// No further claims, ever
    Closed,
}

#[derive(Debug)]
struct QueueInner {
    pending: VecDeque<TaskKey>,
    in_flight: HashSet<TaskKey>,
    gate: QueueGate,
}

/// FIFO of pending tasks for one run
#[derive(Debug)]
pub struct TaskQueue {
    run_id: RunId,
    inner: Mutex<QueueInner>,
    notify: Notify,
}

impl TaskQueue {
    pub fn new(run_id: impl Into<RunId>) -> Self {
        Self {
            run_id: run_id.into(),
            inner: Mutex::new(QueueInner {
                pending: VecDeque::new(),
                in_flight: HashSet::new(),
                gate: QueueGate::Open,
            }),
            notify: Notify::new(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        // A panic while holding this lock leaves the sets consistent
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Add pending tasks of this run. Nothing is enqueued if any task is rejected.
    pub fn enqueue(&self, tasks: &[Task]) -> QueueResult<usize> {
        let mut inner = self.lock();
        if inner.gate == QueueGate::Closed {
            return Err(QueueError::Closed);
        }

        let mut batch = HashSet::with_capacity(tasks.len());
        for task in tasks {
            let key = task.key();
            if task.run_id != self.run_id {
                return Err(QueueError::WrongRun {
                    task: key,
                    expected: self.run_id.clone(),
                    actual: task.run_id.clone(),
                });
            }
            if task.status != TaskStatus::Pending {
                return Err(QueueError::NotPending(key));
            }
            if inner.in_flight.contains(&key)
                || inner.pending.contains(&key)
                || !batch.insert(key.clone())
            {
                return Err(QueueError::Duplicate(key));
            }
        }

        inner
            .pending
            .extend(tasks.iter().map(|task| task.key()));
        drop(inner);

        self.notify.notify_waiters();
        debug!(run_id = %self.run_id, count = tasks.len(), "Tasks enqueued");
        Ok(tasks.len())
    }

    /// Claim the next task without waiting.
    ///
    /// Returns `None` when the queue is empty, paused or closed.
    pub fn try_acquire(&self) -> Option<TaskKey> {
        let mut inner = self.lock();
        if inner.gate != QueueGate::Open {
            return None;
        }
        Self::pop(&mut inner)
    }

    /// Claim the next task, waiting while the queue is paused.
    ///
    /// Returns `None` once nothing is left to claim or the queue is closed.
    pub async fn acquire(&self) -> Option<TaskKey> {
        loop {
            let notified = self.notify.notified();
            {
                let mut inner = self.lock();
                match inner.gate {
                    QueueGate::Closed => return None,
                    _ if inner.pending.is_empty() => return None,
                    QueueGate::Open => return Self::pop(&mut inner),
                    QueueGate::Paused => {}
                }
            }
            notified.await;
        }
    }

    fn pop(inner: &mut QueueInner) -> Option<TaskKey> {
        let key = inner.pending.pop_front()?;
        inner.in_flight.insert(key.clone());
        Some(key)
    }

    /// Mark a claimed task as finished. Returns false if it was not in flight.
    pub fn release(&self, key: &TaskKey) -> bool {
        self.lock().in_flight.remove(key)
    }

    /// Stop handing out tasks until resumed
    pub fn pause(&self) {
        let mut inner = self.lock();
        if inner.gate == QueueGate::Open {
            inner.gate = QueueGate::Paused;
        }
    }

    pub fn resume(&self) {
        {
            let mut inner = self.lock();
            if inner.gate == QueueGate::Paused {
                inner.gate = QueueGate::Open;
            }
        }
        self.notify.notify_waiters();
    }

    /// Stop handing out tasks for good. Returns the tasks that were never claimed.
    pub fn close(&self) -> Vec<TaskKey> {
        let drained = {
            let mut inner = self.lock();
            inner.gate = QueueGate::Closed;
            inner.pending.drain(..).collect()
        };
        self.notify.notify_waiters();
        drained
    }

    pub fn gate(&self) -> QueueGate {
        self.lock().gate
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }

    pub fn is_in_flight(&self, key: &TaskKey) -> bool {
        self.lock().in_flight.contains(key)
    }
}
