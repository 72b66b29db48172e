//! Run state machine
//!
//! Owns one run's authoritative state. Every mutation happens inside one
//! critical section which also updates the counters, the cost ledger and
//! the consensus records, then publishes the resulting snapshot. Observers
//! never see counters and task statuses disagree.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio_util::sync::{CancellationToken, WaitForCancellationFuture};
use tracing::{debug, info, warn};

use crate::config::ModeProfile;
use crate::cost::{CostMeter, SharedCostMeter};
use crate::events::{ProgressPublisher, ProgressSubscription, ProgressView, RunEvent, SharedEventBus};
use crate::queue::{QueueResult, TaskQueue};
use crate::state::{
    ConsensusRecord, CostLedger, ErrorKind, ModelId, PuzzleId, Run, RunId, RunRecordSet,
    RunStatus, RunTransition, Task, TaskKey, TaskOutcome, TaskStatus,
};

use super::aggregator::ConsensusAggregator;

/// Selects tasks by status, model or puzzle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub model_id: Option<ModelId>,
    pub puzzle_id: Option<PuzzleId>,
}

impl TaskFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(mut self, status: TaskStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn model(mut self, model_id: impl Into<ModelId>) -> Self {
        self.model_id = Some(model_id.into());
        self
    }

    pub fn puzzle(mut self, puzzle_id: impl Into<PuzzleId>) -> Self {
        self.puzzle_id = Some(puzzle_id.into());
        self
    }

    pub fn matches(&self, task: &Task) -> bool {
        self.status.map_or(true, |s| task.status == s)
            && self.model_id.as_ref().map_or(true, |m| &task.model_id == m)
            && self.puzzle_id.as_ref().map_or(true, |p| &task.puzzle_id == p)
    }
}

/// Per-model slice of a puzzle summary
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub completed: u32,
    pub correct: u32,
    pub failed: u32,
    pub cost: f64,
}

/// Puzzle-level view of a run, derived from tasks and consensus records
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PuzzleSummary {
    pub run_id: RunId,
    pub total_puzzles: u32,
    /// Puzzles with at least one terminal task
    pub attempted: u32,
    /// Puzzles solved: by consensus for multi-model runs, by the single model otherwise
    pub solved: u32,
    pub consensus_finalized: u32,
    pub per_model: BTreeMap<ModelId, ModelSummary>,
}

impl PuzzleSummary {
    pub fn solve_rate(&self) -> f64 {
        if self.total_puzzles == 0 {
            0.0
        } else {
            self.solved as f64 / self.total_puzzles as f64
        }
    }

    /// Build from a run's records
    pub fn from_records(
        run: &Run,
        tasks: &[Task],
        consensus: &[ConsensusRecord],
        ledger: &CostLedger,
    ) -> Self {
        let mut puzzles: BTreeMap<&str, (bool, bool)> = BTreeMap::new();
        let mut per_model: BTreeMap<ModelId, ModelSummary> = run
            .models
            .iter()
            .map(|m| (m.clone(), ModelSummary::default()))
            .collect();

        for task in tasks {
            let (attempted, solved) = puzzles.entry(task.puzzle_id.as_str()).or_default();
            if !task.status.is_terminal() {
                continue;
            }
            *attempted = true;
            *solved |= task.is_successful();

            let entry = per_model.entry(task.model_id.clone()).or_default();
            entry.completed += 1;
            if task.is_successful() {
                entry.correct += 1;
            } else {
                entry.failed += 1;
            }
        }
        for (model, cost) in &ledger.per_model {
            per_model.entry(model.clone()).or_default().cost =
                crate::cost::nanos_to_usd(cost.cost_nanos);
        }

        let solved = if run.is_multi_model() {
            consensus.iter().filter(|r| r.finalized && r.correct).count() as u32
        } else {
            puzzles.values().filter(|(_, solved)| *solved).count() as u32
        };

        Self {
            run_id: run.id.clone(),
            total_puzzles: puzzles.len() as u32,
            attempted: puzzles.values().filter(|(attempted, _)| *attempted).count() as u32,
            solved,
            consensus_finalized: consensus.iter().filter(|r| r.finalized).count() as u32,
            per_model,
        }
    }
}

/// One exported task row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskExportRow {
    pub run_id: RunId,
    pub task_id: String,
    pub puzzle_id: PuzzleId,
    pub model_id: ModelId,
    pub status: TaskStatus,
    pub correct: bool,
    pub accuracy: f64,
    pub verdict: Option<String>,
    pub duration_ms: u64,
    pub cost: f64,
    pub attempts: u32,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub consensus_verdict: Option<String>,
}

impl TaskExportRow {
    pub fn rows(tasks: &[Task], consensus: &[ConsensusRecord]) -> Vec<Self> {
        let verdicts: HashMap<&str, Option<&String>> = consensus
            .iter()
            .map(|r| (r.puzzle_id.as_str(), r.verdict.as_ref()))
            .collect();

        tasks
            .iter()
            .map(|task| {
                let outcome = task.outcome.as_ref();
                Self {
                    run_id: task.run_id.clone(),
                    task_id: task.key().task_id(),
                    puzzle_id: task.puzzle_id.clone(),
                    model_id: task.model_id.clone(),
                    status: task.status,
                    correct: outcome.is_some_and(|o| o.correct),
                    accuracy: outcome.map_or(0.0, |o| o.accuracy),
                    verdict: outcome.and_then(|o| o.verdict.clone()),
                    duration_ms: outcome.map_or(0, |o| o.duration_ms),
                    cost: outcome.map_or(0.0, |o| o.cost),
                    attempts: outcome.map_or(0, |o| o.attempts),
                    error_kind: outcome.and_then(|o| o.error_kind),
                    error_message: outcome.and_then(|o| o.error_message.clone()),
                    consensus_verdict: verdicts
                        .get(task.puzzle_id.as_str())
                        .and_then(|v| v.cloned()),
                }
            })
            .collect()
    }
}

/// What `complete` did with a reported outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    /// The task was finalized with this outcome
    Applied,
    /// The task was already terminal; only its cost was kept
    LateIgnored,
    /// No such task in this run
    Unknown,
}

struct RunState {
    run: Run,
    tasks: Vec<Task>,
    index: HashMap<TaskKey, usize>,
    consensus: Option<ConsensusAggregator>,
    ledger: CostLedger,
    /// Set once the operator resumes past the cost ceiling
    budget_lifted: bool,
}

/// Lifecycle owner for one run
pub struct RunStateMachine {
    run_id: RunId,
    models: Vec<ModelId>,
    concurrency: usize,
    cost_ceiling: Option<f64>,
    state: Mutex<RunState>,
    queue: TaskQueue,
    cancel: CancellationToken,
    progress: ProgressPublisher,
    events: SharedEventBus,
    meter: SharedCostMeter,
}

impl RunStateMachine {
    /// Create a pending run and enqueue its tasks
    pub fn new(
        run: Run,
        tasks: Vec<Task>,
        mode: &ModeProfile,
        events: SharedEventBus,
        meter: SharedCostMeter,
    ) -> QueueResult<Self> {
        let queue = TaskQueue::new(run.id.clone());
        queue.enqueue(&tasks)?;

        let concurrency = mode
            .concurrency
            .slots(run.models.len())
            .min(tasks.len())
            .max(1);
        let consensus = run
            .is_multi_model()
            .then(|| ConsensusAggregator::new(run.id.clone(), run.models.clone(), meter.pricing()));
        let index = tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.key(), i))
            .collect();

        let progress = ProgressPublisher::new(ProgressView::from_run(&run, concurrency));

        Ok(Self {
            run_id: run.id.clone(),
            models: run.models.clone(),
            concurrency,
            cost_ceiling: mode.cost_ceiling,
            state: Mutex::new(RunState {
                ledger: CostLedger::new(run.id.clone()),
                run,
                tasks,
                index,
                consensus,
                budget_lifted: false,
            }),
            queue,
            cancel: CancellationToken::new(),
            progress,
            events,
            meter,
        })
    }

    fn lock(&self) -> MutexGuard<'_, RunState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn models(&self) -> &[ModelId] {
        &self.models
    }

    /// Worker slots for this run
    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    pub fn queue(&self) -> &TaskQueue {
        &self.queue
    }

    /// Resolves once the run is cancelled or fails setup
    pub fn cancelled(&self) -> WaitForCancellationFuture<'_> {
        self.cancel.cancelled()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    // =========================================================================
    // Transitions
    // =========================================================================

    /// Move to `to`, stamping timestamps and announcing the change
    fn apply(&self, state: &mut RunState, to: RunStatus, reason: Option<String>) {
        let from = state.run.status;
        state.run.status = to;
        let now = Utc::now();
        if to == RunStatus::Running && state.run.started_at.is_none() {
            state.run.started_at = Some(now);
        }
        if to.is_terminal() {
            state.run.completed_at = Some(now);
        }

        info!(
            run_id = %self.run_id,
            %from,
            %to,
            reason = reason.as_deref().unwrap_or(""),
            "Run status changed"
        );
        self.events.publish(RunEvent::StatusChanged {
            run_id: self.run_id.clone(),
            from,
            to,
            reason,
            timestamp: now,
        });
    }

    fn publish_progress(&self, state: &RunState) {
        self.progress
            .publish(ProgressView::from_run(&state.run, self.concurrency));
    }

    /// pending -> running. Returns false if the run was already past pending.
    pub fn start(&self) -> bool {
        let mut state = self.lock();
        let Some(next) = state.run.status.next(RunTransition::Start) else {
            return false;
        };
        self.apply(&mut state, next, None);
        self.publish_progress(&state);
        true
    }

    /// running -> error. All open tasks fail with `setup_failure`.
    pub fn fail_setup(&self, reason: impl Into<String>) -> bool {
        let reason = reason.into();
        let mut state = self.lock();
        let Some(next) = state.run.status.next(RunTransition::SetupFailure) else {
            return false;
        };

        self.queue.close();
        self.cancel.cancel();
        state.run.error = Some(reason.clone());
        let forced = self.force_finalize(&mut state, || {
            TaskOutcome {
                attempts: 0,
                ..TaskOutcome::failed(ErrorKind::SetupFailure, reason.clone(), 0, 0.0)
            }
        });
        self.finalize_open_consensus(&mut state);
        warn!(run_id = %self.run_id, forced, error = %reason, "Run setup failed");

        self.apply(&mut state, next, Some(reason));
        self.publish_progress(&state);
        true
    }

    /// running -> paused. No-op in any other state. Returns the resulting status.
    pub fn pause(&self) -> RunStatus {
        let mut state = self.lock();
        if let Some(next) = state.run.status.next(RunTransition::Pause) {
            self.queue.pause();
            self.apply(&mut state, next, None);
            self.publish_progress(&state);
        }
        state.run.status
    }

    /// paused -> running, completing the run if nothing is left.
    /// Lifts the cost-ceiling guard for the rest of the run.
    pub fn resume(&self) -> RunStatus {
        let mut state = self.lock();
        if let Some(next) = state.run.status.next(RunTransition::Resume) {
            state.budget_lifted = true;
            self.queue.resume();
            self.apply(&mut state, next, None);
            self.complete_if_done(&mut state);
            self.publish_progress(&state);
        }
        state.run.status
    }

    /// Cancel from any non-terminal state. Open tasks fail with `cancelled`;
    /// finished tasks keep their outcomes.
    pub fn cancel(&self) -> RunStatus {
        let mut state = self.lock();
        let Some(next) = state.run.status.next(RunTransition::Cancel) else {
            return state.run.status;
        };

        state.run.cancel_requested = true;
        self.queue.close();
        self.cancel.cancel();
        let forced = self.force_finalize(&mut state, TaskOutcome::cancelled);
        self.finalize_open_consensus(&mut state);
        info!(run_id = %self.run_id, forced, "Run cancelled");

        self.apply(&mut state, next, Some("cancel requested".to_string()));
        self.publish_progress(&state);
        state.run.status
    }

    fn complete_if_done(&self, state: &mut RunState) {
        if !state.run.counters.all_terminal() {
            return;
        }
        if let Some(next) = state.run.status.next(RunTransition::AllTasksTerminal) {
            self.queue.close();
            self.apply(state, next, None);
        }
    }

    fn force_finalize(&self, state: &mut RunState, outcome: impl Fn() -> TaskOutcome) -> u32 {
        let RunState { run, tasks, .. } = state;
        let now = Utc::now();
        let mut forced = 0;
        for task in tasks.iter_mut().filter(|t| !t.status.is_terminal()) {
            let outcome = outcome();
            task.status = TaskStatus::Failed;
            task.finished_at = Some(now);
            run.counters.record(false);
            forced += 1;

            self.events.publish(RunEvent::TaskFinished {
                run_id: self.run_id.clone(),
                puzzle_id: task.puzzle_id.clone(),
                model_id: task.model_id.clone(),
                status: TaskStatus::Failed,
                correct: false,
                error_kind: outcome.error_kind,
                duration_ms: 0,
                cost: 0.0,
                timestamp: now,
            });
            task.outcome = Some(outcome);
        }
        forced
    }

    fn finalize_open_consensus(&self, state: &mut RunState) {
        let Some(aggregator) = state.consensus.as_mut() else {
            return;
        };
        for record in aggregator.finalize_open() {
            self.publish_consensus(&record);
        }
    }

    fn publish_consensus(&self, record: &ConsensusRecord) {
        debug!(
            run_id = %self.run_id,
            puzzle_id = %record.puzzle_id,
            agreement = record.agreement,
            correct = record.correct,
            "Consensus finalized"
        );
        self.events.publish(RunEvent::ConsensusFinalized {
            run_id: self.run_id.clone(),
            puzzle_id: record.puzzle_id.clone(),
            verdict: record.verdict.clone(),
            agreement: record.agreement,
            correct: record.correct,
            reporters: record.reports.len() as u32,
            timestamp: record.finalized_at.unwrap_or_else(Utc::now),
        });
    }

    // =========================================================================
    // Task operations
    // =========================================================================

    /// Mark a dequeued task as running.
    ///
    /// Returns `None` (and releases the claim) if the task can no longer run.
    pub fn claim(&self, key: &TaskKey) -> Option<Task> {
        let mut state = self.lock();
        if state.run.is_terminal() {
            self.queue.release(key);
            return None;
        }
        let Some(&idx) = state.index.get(key) else {
            self.queue.release(key);
            return None;
        };

        let task = &mut state.tasks[idx];
        if task.status != TaskStatus::Pending {
            self.queue.release(key);
            return None;
        }
        task.status = TaskStatus::Running;
        task.claimed_at = Some(Utc::now());

        self.events.publish(RunEvent::TaskClaimed {
            run_id: self.run_id.clone(),
            puzzle_id: key.puzzle_id.clone(),
            model_id: key.model_id.clone(),
            timestamp: Utc::now(),
        });
        Some(task.clone())
    }

    /// Report a task's outcome.
    ///
    /// Updates the task, counters, cost ledger and consensus together, then
    /// applies the cost-ceiling guard and the completion check.
    pub fn complete(&self, key: &TaskKey, outcome: TaskOutcome) -> Completion {
        let mut guard = self.lock();
        let state = &mut *guard;
        self.queue.release(key);

        let Some(&idx) = state.index.get(key) else {
            warn!(run_id = %self.run_id, task = %key, "Outcome for unknown task");
            return Completion::Unknown;
        };

        if state.tasks[idx].status.is_terminal() {
            // Late result after cancellation: the spend still happened
            if outcome.attempts > 0
                && self
                    .meter
                    .record_call(&mut state.ledger, key, outcome.duration_ms, outcome.cost)
            {
                state.run.running_cost = CostMeter::running_total(&state.ledger);
                self.publish_progress(state);
            }
            debug!(run_id = %self.run_id, task = %key, "Late outcome ignored");
            return Completion::LateIgnored;
        }

        let status = outcome.terminal_status();
        let now = Utc::now();

        if outcome.attempts > 0 {
            state.run.total_processing_ms += outcome.duration_ms;
            state.run.timed_tasks += 1;
            self.meter
                .record_call(&mut state.ledger, key, outcome.duration_ms, outcome.cost);
            state.run.running_cost = CostMeter::running_total(&state.ledger);
        }
        state.run.counters.record(outcome.correct);

        self.events.publish(RunEvent::TaskFinished {
            run_id: self.run_id.clone(),
            puzzle_id: key.puzzle_id.clone(),
            model_id: key.model_id.clone(),
            status,
            correct: outcome.correct,
            error_kind: outcome.error_kind,
            duration_ms: outcome.duration_ms,
            cost: outcome.cost,
            timestamp: now,
        });

        if let Some(record) = state
            .consensus
            .as_mut()
            .and_then(|agg| agg.report(key, &outcome))
        {
            self.publish_consensus(&record);
        }

        let task = &mut state.tasks[idx];
        task.status = status;
        task.finished_at = Some(now);
        task.outcome = Some(outcome);

        self.check_budget(state);
        self.complete_if_done(state);
        self.publish_progress(state);
        Completion::Applied
    }

    /// Auto-pause once the running cost reaches the mode's ceiling
    fn check_budget(&self, state: &mut RunState) {
        let Some(ceiling) = self.cost_ceiling else {
            return;
        };
        if state.budget_lifted
            || state.run.running_cost < ceiling
            || state.run.counters.all_terminal()
        {
            return;
        }
        let Some(next) = state.run.status.next(RunTransition::Pause) else {
            return;
        };

        self.queue.pause();
        warn!(
            run_id = %self.run_id,
            running_cost = state.run.running_cost,
            ceiling,
            "Cost ceiling reached, pausing run"
        );
        self.events.publish(RunEvent::BudgetExceeded {
            run_id: self.run_id.clone(),
            running_cost: state.run.running_cost,
            ceiling,
            timestamp: Utc::now(),
        });
        self.apply(state, next, Some("cost ceiling reached".to_string()));
    }

    /// Fail tasks left open after the worker pool exited.
    ///
    /// Only happens when a worker died mid-task. Returns how many were failed.
    pub fn finalize_stranded(&self) -> u32 {
        let open: Vec<TaskKey> = {
            let state = self.lock();
            if state.run.is_terminal() {
                return 0;
            }
            state
                .tasks
                .iter()
                .filter(|t| !t.status.is_terminal())
                .map(Task::key)
                .collect()
        };

        let mut stranded = 0;
        for key in open {
            let outcome = TaskOutcome::failed(
                ErrorKind::BackendError,
                "worker exited before reporting",
                0,
                0.0,
            );
            if self.complete(&key, TaskOutcome { attempts: 0, ..outcome }) == Completion::Applied {
                stranded += 1;
            }
        }
        if stranded > 0 {
            warn!(run_id = %self.run_id, stranded, "Failed tasks abandoned by workers");
        }
        stranded
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Current progress snapshot
    pub fn snapshot(&self) -> ProgressView {
        let state = self.lock();
        ProgressView::from_run(&state.run, self.concurrency)
    }

    /// Live snapshots; the first is the current one
    pub fn subscribe(&self) -> ProgressSubscription {
        self.progress.subscribe()
    }

    /// Wait until the run reaches a terminal state
    pub async fn wait_terminal(&self) -> ProgressView {
        let mut sub = self.subscribe();
        let mut last = self.progress.latest();
        while let Some(view) = sub.next().await {
            last = view;
            if last.is_terminal() {
                break;
            }
        }
        last
    }

    /// Wait out a pause.
    ///
    /// Returns true once the run is running, false if it ends first.
    pub async fn wait_until_running(&self) -> bool {
        let mut sub = self.subscribe();
        while let Some(view) = sub.next().await {
            if view.status == RunStatus::Running {
                return true;
            }
            if view.is_terminal() {
                return false;
            }
        }
        false
    }

    pub fn run(&self) -> Run {
        self.lock().run.clone()
    }

    pub fn status(&self) -> RunStatus {
        self.lock().run.status
    }

    pub fn tasks(&self, filter: &TaskFilter) -> Vec<Task> {
        self.lock()
            .tasks
            .iter()
            .filter(|t| filter.matches(t))
            .cloned()
            .collect()
    }

    pub fn task(&self, key: &TaskKey) -> Option<Task> {
        let state = self.lock();
        state.index.get(key).map(|&i| state.tasks[i].clone())
    }

    pub fn consensus_records(&self) -> Vec<ConsensusRecord> {
        self.lock()
            .consensus
            .as_ref()
            .map(ConsensusAggregator::records)
            .unwrap_or_default()
    }

    pub fn ledger(&self) -> CostLedger {
        self.lock().ledger.clone()
    }

    pub fn running_total(&self) -> f64 {
        CostMeter::running_total(&self.lock().ledger)
    }

    pub fn puzzle_summary(&self) -> PuzzleSummary {
        let state = self.lock();
        let consensus = state
            .consensus
            .as_ref()
            .map(ConsensusAggregator::records)
            .unwrap_or_default();
        PuzzleSummary::from_records(&state.run, &state.tasks, &consensus, &state.ledger)
    }

    /// Everything recorded about the run, taken in one critical section
    pub fn record_set(&self) -> RunRecordSet {
        let state = self.lock();
        RunRecordSet {
            run: state.run.clone(),
            tasks: state.tasks.clone(),
            consensus: state
                .consensus
                .as_ref()
                .map(ConsensusAggregator::records)
                .unwrap_or_default(),
            ledger: state.ledger.clone(),
        }
    }
}
