//! Live progress snapshots
//!
//! Each run owns a [`ProgressPublisher`] backed by a `watch` channel.
//! Subscribers always see the latest snapshot first, may miss intermediate
//! ones under load, and always see the terminal one before the stream ends.

use std::sync::Mutex;

use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::state::{Run, RunId, RunStatus};

/// Snapshot of a run's progress
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressView {
    pub run_id: RunId,
    pub status: RunStatus,
    pub completed: u32,
    pub total: u32,
    pub successful: u32,
    pub failed: u32,
    /// successful / completed
    pub success_rate: f64,
    pub running_cost: f64,
    /// Estimated seconds until every task is terminal; absent until a task
    /// has been timed, zero once terminal
    pub eta_seconds: Option<f64>,
    pub updated_at: DateTime<Utc>,
}

impl ProgressView {
    /// Project a run's counters; `concurrency` scales the ETA
    pub fn from_run(run: &Run, concurrency: usize) -> Self {
        let remaining = run.counters.remaining();
        let eta_seconds = if run.is_terminal() || remaining == 0 {
            Some(0.0)
        } else {
            run.average_processing_ms().map(|avg_ms| {
                avg_ms * remaining as f64 / concurrency.max(1) as f64 / 1_000.0
            })
        };

        Self {
            run_id: run.id.clone(),
            status: run.status,
            completed: run.counters.completed,
            total: run.counters.total,
            successful: run.counters.successful,
            failed: run.counters.failed,
            success_rate: run.accuracy(),
            running_cost: run.running_cost,
            eta_seconds,
            updated_at: Utc::now(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Completed fraction in [0, 1]
    pub fn fraction_complete(&self) -> f64 {
        if self.total == 0 {
            1.0
        } else {
            self.completed as f64 / self.total as f64
        }
    }
}

/// Publishes a run's snapshots; closes after the terminal one
#[derive(Debug)]
pub struct ProgressPublisher {
    sender: Mutex<Option<watch::Sender<ProgressView>>>,
    receiver: watch::Receiver<ProgressView>,
}

impl ProgressPublisher {
    pub fn new(initial: ProgressView) -> Self {
        let terminal = initial.is_terminal();
        let (sender, receiver) = watch::channel(initial);
        Self {
            sender: Mutex::new((!terminal).then_some(sender)),
            receiver,
        }
    }

    /// Replace the current snapshot. Ignored once closed.
    pub fn publish(&self, view: ProgressView) {
        let Ok(mut sender) = self.sender.lock() else {
            return;
        };
        let terminal = view.is_terminal();
        if let Some(tx) = sender.as_ref() {
            tx.send_replace(view);
        }
        if terminal {
            // Dropping the sender ends every subscription after this value
            sender.take();
        }
    }

    /// Latest published snapshot
    pub fn latest(&self) -> ProgressView {
        self.receiver.borrow().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.sender.lock().map(|s| s.is_none()).unwrap_or(true)
    }

    pub fn subscribe(&self) -> ProgressSubscription {
        ProgressSubscription {
            receiver: self.receiver.clone(),
            primed: false,
        }
    }
}

/// A subscriber's view of a run's progress
#[derive(Debug)]
pub struct ProgressSubscription {
    receiver: watch::Receiver<ProgressView>,
    primed: bool,
}

impl ProgressSubscription {
    /// Next snapshot; the first call returns the current one immediately.
    ///
    /// Returns `None` after the terminal snapshot has been delivered.
    pub async fn next(&mut self) -> Option<ProgressView> {
        if !self.primed {
            self.primed = true;
            return Some(self.receiver.borrow_and_update().clone());
        }
        match self.receiver.changed().await {
            Ok(()) => Some(self.receiver.borrow_and_update().clone()),
            Err(_) => None,
        }
    }

    pub fn into_stream(self) -> impl Stream<Item = ProgressView> + Send + 'static {
        futures::stream::unfold(self, |mut sub| async move {
            let view = sub.next().await?;
            Some((view, sub))
        })
    }
}
