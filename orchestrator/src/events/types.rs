//! Run lifecycle events
//!
//! Broadcast process-wide; consumers filter by run id or event type.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::state::{ErrorKind, ModelId, PuzzleId, RunId, RunStatus, TaskStatus};

/// All run coordination events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RunEvent {
    /// A run was created and its tasks enqueued
    RunCreated {
        run_id: RunId,
        dataset_ref: String,
        models: Vec<ModelId>,
        mode: String,
        total_tasks: u32,
        timestamp: DateTime<Utc>,
    },

    /// A run moved between lifecycle states
    StatusChanged {
        run_id: RunId,
        from: RunStatus,
        to: RunStatus,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A worker claimed a task
    TaskClaimed {
        run_id: RunId,
        puzzle_id: PuzzleId,
        model_id: ModelId,
        timestamp: DateTime<Utc>,
    },

    /// A task reached a terminal state
    TaskFinished {
        run_id: RunId,
        puzzle_id: PuzzleId,
        model_id: ModelId,
        status: TaskStatus,
        correct: bool,
        error_kind: Option<ErrorKind>,
        duration_ms: u64,
        cost: f64,
        timestamp: DateTime<Utc>,
    },

    /// A puzzle's consensus was finalized
    ConsensusFinalized {
        run_id: RunId,
        puzzle_id: PuzzleId,
        verdict: Option<String>,
        agreement: f64,
        correct: bool,
        reporters: u32,
        timestamp: DateTime<Utc>,
    },

    /// Running cost reached the mode's ceiling; the run was paused
    BudgetExceeded {
        run_id: RunId,
        running_cost: f64,
        ceiling: f64,
        timestamp: DateTime<Utc>,
    },
}

impl RunEvent {
    /// Get the timestamp of this event
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Self::RunCreated { timestamp, .. }
            | Self::StatusChanged { timestamp, .. }
            | Self::TaskClaimed { timestamp, .. }
            | Self::TaskFinished { timestamp, .. }
            | Self::ConsensusFinalized { timestamp, .. }
            | Self::BudgetExceeded { timestamp, .. } => *timestamp,
        }
    }

    /// Get the run this event belongs to
    pub fn run_id(&self) -> &str {
        match self {
            Self::RunCreated { run_id, .. }
            | Self::StatusChanged { run_id, .. }
            | Self::TaskClaimed { run_id, .. }
            | Self::TaskFinished { run_id, .. }
            | Self::ConsensusFinalized { run_id, .. }
            | Self::BudgetExceeded { run_id, .. } => run_id,
        }
    }

    /// Get the event type as a string
    pub fn event_type(&self) -> &'static str {
        match self {
            Self::RunCreated { .. } => "run_created",
            Self::StatusChanged { .. } => "status_changed",
            Self::TaskClaimed { .. } => "task_claimed",
            Self::TaskFinished { .. } => "task_finished",
            Self::ConsensusFinalized { .. } => "consensus_finalized",
            Self::BudgetExceeded { .. } => "budget_exceeded",
        }
    }

    /// Whether this event ends its run
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::StatusChanged { to, .. } if to.is_terminal())
    }
}
