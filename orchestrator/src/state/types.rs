//! Core types for run bookkeeping
//!
//! These types describe the authoritative state of an evaluation run and are
//! handed to the archive when a run reaches a terminal state.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for runs
pub type RunId = String;

/// Identifier of a puzzle within a dataset
pub type PuzzleId = String;

/// Model identifier, resolved to a backend through the registry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModelId(String);

impl ModelId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ModelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ModelId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ModelId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identity of a task within its run: one puzzle attempted by one model
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskKey {
    pub puzzle_id: PuzzleId,
    pub model_id: ModelId,
}

impl TaskKey {
    pub fn new(puzzle_id: impl Into<PuzzleId>, model_id: impl Into<ModelId>) -> Self {
        Self {
            puzzle_id: puzzle_id.into(),
            model_id: model_id.into(),
        }
    }

    /// Stable task id used in exports and logs
    pub fn task_id(&self) -> String {
        format!("{}::{}", self.puzzle_id, self.model_id)
    }
}

impl std::fmt::Display for TaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}::{}", self.puzzle_id, self.model_id)
    }
}

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Pending,
    Running,
    Paused,
    Completed,
    Cancelled,
    Error,
}

impl RunStatus {
    /// Terminal states never transition again
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RunStatus::Completed | RunStatus::Cancelled | RunStatus::Error
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Pending => "pending",
            RunStatus::Running => "running",
            RunStatus::Paused => "paused",
            RunStatus::Completed => "completed",
            RunStatus::Cancelled => "cancelled",
            RunStatus::Error => "error",
        }
    }

    /// Apply a transition request, returning the next status if the edge exists.
    ///
    /// ```text
    /// pending --start--> running
    /// running --all_tasks_terminal--> completed
    /// running --pause--> paused
    /// paused  --resume--> running
    /// pending|running|paused --cancel--> cancelled
    /// running --setup_failure--> error
    /// ```
    pub fn next(self, transition: RunTransition) -> Option<RunStatus> {
        use RunStatus::*;
        use RunTransition::*;
        match (self, transition) {
            (Pending, Start) => Some(Running),
            (Running, AllTasksTerminal) => Some(Completed),
            (Running, Pause) => Some(Paused),
            (Paused, Resume) => Some(Running),
            (Pending | Running | Paused, Cancel) => Some(Cancelled),
            (Running, SetupFailure) => Some(Error),
            _ => None,
        }
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requests that move a run between states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunTransition {
    Start,
    AllTasksTerminal,
    Pause,
    Resume,
    Cancel,
    SetupFailure,
}

/// Status of a single task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting in the queue
    Pending,
    /// Claimed by a worker, call in flight
    Running,
    /// The model returned an answer (right or wrong)
    Completed,
    /// No usable answer: backend failure, timeout, cancellation
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Running => "running",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Timeout,
    BackendError,
    RateLimited,
    InvalidResponse,
    Cancelled,
    SetupFailure,
}

impl ErrorKind {
    /// Failures the worker may retry before finalizing the task
    pub fn is_retriable(self) -> bool {
        matches!(self, ErrorKind::Timeout | ErrorKind::RateLimited)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::Timeout => "timeout",
            ErrorKind::BackendError => "backend_error",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::InvalidResponse => "invalid_response",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::SetupFailure => "setup_failure",
        }
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of attempting a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskOutcome {
    /// Whether the answer matched the expected answer
    pub correct: bool,
    /// Accuracy score in [0, 1]
    pub accuracy: f64,
    /// Canonical JSON text of the model's answer (absent on failure)
    pub verdict: Option<String>,
    /// Wall-clock processing time across all attempts
    pub duration_ms: u64,
    /// Cost in USD across all attempts
    pub cost: f64,
    /// Number of backend calls made
    pub attempts: u32,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

impl TaskOutcome {
    /// An answered task
    pub fn answered(
        verdict: String,
        correct: bool,
        accuracy: f64,
        duration_ms: u64,
        cost: f64,
    ) -> Self {
        Self {
            correct,
            accuracy: accuracy.clamp(0.0, 1.0),
            verdict: Some(verdict),
            duration_ms,
            cost,
            attempts: 1,
            error_kind: None,
            error_message: None,
        }
    }

    /// A task that produced no answer
    pub fn failed(
        kind: ErrorKind,
        message: impl Into<String>,
        duration_ms: u64,
        cost: f64,
    ) -> Self {
        Self {
            correct: false,
            accuracy: 0.0,
            verdict: None,
            duration_ms,
            cost,
            attempts: 1,
            error_kind: Some(kind),
            error_message: Some(message.into()),
        }
    }

    /// Force-finalization of a task that was still open when its run was cancelled
    pub fn cancelled() -> Self {
        Self {
            attempts: 0,
            ..Self::failed(ErrorKind::Cancelled, "run cancelled", 0, 0.0)
        }
    }

    pub fn is_failure(&self) -> bool {
        self.error_kind.is_some()
    }

    /// Task status this outcome finalizes into
    pub fn terminal_status(&self) -> TaskStatus {
        if self.is_failure() {
            TaskStatus::Failed
        } else {
            TaskStatus::Completed
        }
    }
}

/// One puzzle × model unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub run_id: RunId,
    pub puzzle_id: PuzzleId,
    pub model_id: ModelId,
    pub status: TaskStatus,
    pub outcome: Option<TaskOutcome>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl Task {
    /// Create a pending task
    pub fn new(run_id: RunId, key: TaskKey) -> Self {
        Self {
            run_id,
            puzzle_id: key.puzzle_id,
            model_id: key.model_id,
            status: TaskStatus::Pending,
            outcome: None,
            claimed_at: None,
            finished_at: None,
        }
    }

    pub fn key(&self) -> TaskKey {
        TaskKey::new(self.puzzle_id.clone(), self.model_id.clone())
    }

    /// Counts toward the run's successful tasks
    pub fn is_successful(&self) -> bool {
        self.outcome.as_ref().is_some_and(|o| o.correct)
    }
}

/// Per-task counters of a run
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    pub total: u32,
    pub completed: u32,
    pub successful: u32,
    pub failed: u32,
}

impl RunCounters {
    pub fn new(total: u32) -> Self {
        Self {
            total,
            ..Self::default()
        }
    }

    /// Count one terminal task
    pub fn record(&mut self, successful: bool) {
        self.completed += 1;
        if successful {
            self.successful += 1;
        } else {
            self.failed += 1;
        }
    }

    /// `completed = successful + failed <= total`
    pub fn is_consistent(&self) -> bool {
        self.completed == self.successful + self.failed && self.completed <= self.total
    }

    pub fn all_terminal(&self) -> bool {
        self.completed == self.total
    }

    pub fn remaining(&self) -> u32 {
        self.total.saturating_sub(self.completed)
    }
}

/// One evaluation session over a dataset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Run {
    pub id: RunId,
    pub dataset_ref: String,
    /// Ordered model set; order breaks consensus ties last
    pub models: Vec<ModelId>,
    pub mode: String,
    pub status: RunStatus,
    pub counters: RunCounters,
    /// Sum of processing time over terminal tasks that made at least one call
    pub total_processing_ms: u64,
    /// Number of tasks contributing to `total_processing_ms`
    pub timed_tasks: u32,
    pub running_cost: f64,
    pub cancel_requested: bool,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl Run {
    pub fn new(dataset_ref: String, models: Vec<ModelId>, mode: String, total_tasks: u32) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            dataset_ref,
            models,
            mode,
            status: RunStatus::Pending,
            counters: RunCounters::new(total_tasks),
            total_processing_ms: 0,
            timed_tasks: 0,
            running_cost: 0.0,
            cancel_requested: false,
            error: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }

    pub fn is_multi_model(&self) -> bool {
        self.models.len() > 1
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Average processing time of timed tasks
    pub fn average_processing_ms(&self) -> Option<f64> {
        if self.timed_tasks == 0 {
            None
        } else {
            Some(self.total_processing_ms as f64 / self.timed_tasks as f64)
        }
    }

    /// successful / completed
    pub fn accuracy(&self) -> f64 {
        if self.counters.completed == 0 {
            0.0
        } else {
            self.counters.successful as f64 / self.counters.completed as f64
        }
    }
}

/// A single model's report for a puzzle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelVerdict {
    pub model_id: ModelId,
    /// `None` when the task failed (abstention)
    pub verdict: Option<String>,
    pub correct: bool,
}

/// Consensus bookkeeping for one puzzle of a multi-model run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusRecord {
    pub run_id: RunId,
    pub puzzle_id: PuzzleId,
    pub expected_models: Vec<ModelId>,
    /// Reports in arrival order
    pub reports: Vec<ModelVerdict>,
    pub verdict: Option<String>,
    pub agreement: f64,
    pub correct: bool,
    pub tie_broken: bool,
    pub finalized: bool,
    pub finalized_at: Option<DateTime<Utc>>,
}

impl ConsensusRecord {
    pub fn new(run_id: RunId, puzzle_id: PuzzleId, expected_models: Vec<ModelId>) -> Self {
        Self {
            run_id,
            puzzle_id,
            expected_models,
            reports: Vec::new(),
            verdict: None,
            agreement: 0.0,
            correct: false,
            tie_broken: false,
            finalized: false,
            finalized_at: None,
        }
    }

    pub fn has_report_from(&self, model: &ModelId) -> bool {
        self.reports.iter().any(|r| &r.model_id == model)
    }

    pub fn all_reported(&self) -> bool {
        self.expected_models.iter().all(|m| self.has_report_from(m))
    }

    /// Reports that carry a verdict
    pub fn verdicts(&self) -> impl Iterator<Item = &ModelVerdict> {
        self.reports.iter().filter(|r| r.verdict.is_some())
    }
}

/// Per-model cost totals
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelCost {
    pub calls: u32,
    /// Cost in nanodollars (1e-9 USD)
    pub cost_nanos: i64,
    pub elapsed_ms: u64,
}

/// Per-run cost accumulator; only the cost meter mutates it
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CostLedger {
    pub run_id: RunId,
    /// Total cost in nanodollars (1e-9 USD)
    pub total_nanos: i64,
    pub per_model: BTreeMap<ModelId, ModelCost>,
    /// Tasks whose cost has been charged
    pub charged: BTreeSet<TaskKey>,
}

impl CostLedger {
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            ..Self::default()
        }
    }

    /// Running total in USD
    pub fn total(&self) -> f64 {
        crate::cost::nanos_to_usd(self.total_nanos)
    }

    pub fn is_charged(&self, key: &TaskKey) -> bool {
        self.charged.contains(key)
    }
}
