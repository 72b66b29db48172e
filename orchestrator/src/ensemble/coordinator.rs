//! Run coordinator - entry point for launching and controlling runs
//!
//! Keeps a registry of live runs keyed by run id. Each launched run gets a
//! driver task that starts it, prepares its backends, drives a bounded
//! worker pool and archives the run once it is terminal.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::{ConfigError, ModeProfile, OrchestratorConfig};
use crate::cost::{CostEstimate, CostMeter, PricingTable, SharedCostMeter};
use crate::dataset::{DatasetError, Puzzle, SharedDatasetSource};
use crate::events::{
    EventBus, EventFilter, FilteredReceiver, ProgressPublisher, ProgressSubscription,
    ProgressView, RunEvent, SharedEventBus,
};
use crate::invoker::{BackendRegistry, BackendUsage, ModelInvoker, SharedModelInvoker};
use crate::queue::QueueError;
use crate::state::{
    ConsensusRecord, CostLedger, ModelId, NoopArchive, Run, RunId, RunRecordSet, RunStatus,
    SharedRunArchive, StoreError, Task, TaskKey,
};

use super::machine::{PuzzleSummary, RunStateMachine, TaskExportRow, TaskFilter};
use super::worker::{run_worker, WorkerContext};

/// Error type for coordinator operations
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run {0} is still active")]
    RunActive(String),

    #[error("Config error: {0}")]
    Config(#[from] ConfigError),

    #[error("Dataset error: {0}")]
    Dataset(#[from] DatasetError),

    #[error("Archive error: {0}")]
    Store(#[from] StoreError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Export failed: {0}")]
    Export(#[from] serde_json::Error),
}

/// Result type for coordinator operations
pub type CoordinatorResult<T> = Result<T, CoordinatorError>;

/// Shared reference to RunCoordinator
pub type SharedRunCoordinator = Arc<RunCoordinator>;

/// Parameters of a new run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LaunchRequest {
    pub dataset_ref: String,
    pub model_ids: Vec<ModelId>,
    pub mode: String,
}

impl LaunchRequest {
    pub fn new(
        dataset_ref: impl Into<String>,
        model_ids: impl IntoIterator<Item = impl Into<ModelId>>,
        mode: impl Into<String>,
    ) -> Self {
        Self {
            dataset_ref: dataset_ref.into(),
            model_ids: model_ids.into_iter().map(Into::into).collect(),
            mode: mode.into(),
        }
    }
}

#[derive(Clone)]
struct LiveRun {
    machine: Arc<RunStateMachine>,
    /// Flips to true once the driver has archived the run
    settled: watch::Receiver<bool>,
}

/// Launches runs and answers queries about them
pub struct RunCoordinator {
    config: OrchestratorConfig,
    datasets: SharedDatasetSource,
    meter: SharedCostMeter,
    invoker: SharedModelInvoker,
    events: SharedEventBus,
    archive: SharedRunArchive,
    runs: RwLock<HashMap<RunId, LiveRun>>,
}

impl RunCoordinator {
    /// Create a coordinator over explicitly registered backends
    pub fn new(
        config: OrchestratorConfig,
        registry: BackendRegistry,
        datasets: SharedDatasetSource,
    ) -> Self {
        let meter = CostMeter::new(PricingTable::from_config(&config)).shared();
        let invoker = ModelInvoker::new(registry, meter.clone()).shared();
        Self {
            config,
            datasets,
            meter,
            invoker,
            events: EventBus::new().shared(),
            archive: Arc::new(NoopArchive),
            runs: RwLock::new(HashMap::new()),
        }
    }

    /// Create a coordinator with one backend per configured model
    pub fn from_config(
        config: OrchestratorConfig,
        datasets: SharedDatasetSource,
    ) -> CoordinatorResult<Self> {
        let registry = BackendRegistry::from_config(&config)?;
        Ok(Self::new(config, registry, datasets))
    }

    /// Archive terminal runs here
    pub fn with_archive(mut self, archive: SharedRunArchive) -> Self {
        self.archive = archive;
        self
    }

    pub fn with_event_bus(mut self, events: SharedEventBus) -> Self {
        self.events = events;
        self
    }

    /// Create a shared reference to this coordinator
    pub fn shared(self) -> SharedRunCoordinator {
        Arc::new(self)
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn meter(&self) -> &SharedCostMeter {
        &self.meter
    }

    // =========================================================================
    // Launch
    // =========================================================================

    fn resolve_mode(&self, mode: &str) -> CoordinatorResult<ModeProfile> {
        self.config
            .mode(mode)
            .cloned()
            .ok_or_else(|| CoordinatorError::InvalidConfig(format!("unknown mode '{mode}'")))
    }

    fn validate_models(&self, models: &[ModelId]) -> CoordinatorResult<()> {
        if models.is_empty() {
            return Err(CoordinatorError::InvalidConfig(
                "at least one model is required".to_string(),
            ));
        }
        let mut seen = HashSet::with_capacity(models.len());
        for model in models {
            if !seen.insert(model) {
                return Err(CoordinatorError::InvalidConfig(format!(
                    "model '{model}' listed twice"
                )));
            }
            if !self.invoker.knows(model) {
                return Err(CoordinatorError::InvalidConfig(format!(
                    "unknown model '{model}'"
                )));
            }
        }
        Ok(())
    }

    async fn load_dataset(&self, dataset_ref: &str) -> CoordinatorResult<Vec<Puzzle>> {
        let puzzles = match self.datasets.load(dataset_ref).await {
            Ok(puzzles) => puzzles,
            Err(DatasetError::NotFound(r) | DatasetError::InvalidRef(r)) => {
                return Err(CoordinatorError::InvalidConfig(format!(
                    "unknown dataset '{r}'"
                )))
            }
            Err(e) => return Err(e.into()),
        };
        if puzzles.is_empty() {
            return Err(CoordinatorError::InvalidConfig(format!(
                "dataset '{dataset_ref}' has no puzzles"
            )));
        }
        Ok(puzzles)
    }

    /// Cost and duration estimate for a prospective run
    pub async fn estimate(&self, request: &LaunchRequest) -> CoordinatorResult<CostEstimate> {
        let mode = self.resolve_mode(&request.mode)?;
        self.validate_models(&request.model_ids)?;
        let puzzles = self.load_dataset(&request.dataset_ref).await?;
        Ok(self.meter.estimate(&mode, &request.model_ids, puzzles.len()))
    }

    /// Create a run with one pending task per (puzzle, model) and start it.
    ///
    /// Nothing is created when the request is rejected.
    pub async fn launch(&self, request: LaunchRequest) -> CoordinatorResult<RunId> {
        let mode = self.resolve_mode(&request.mode)?;
        self.validate_models(&request.model_ids)?;
        let puzzles = self.load_dataset(&request.dataset_ref).await?;

        let total = (puzzles.len() * request.model_ids.len()) as u32;
        let run = Run::new(
            request.dataset_ref.clone(),
            request.model_ids.clone(),
            mode.name.clone(),
            total,
        );
        let run_id = run.id.clone();

        // Models of one puzzle sit next to each other so consensus closes early
        let tasks: Vec<Task> = puzzles
            .iter()
            .flat_map(|p| {
                request
                    .model_ids
                    .iter()
                    .map(|m| Task::new(run_id.clone(), TaskKey::new(p.id.clone(), m.clone())))
            })
            .collect();

        let machine = Arc::new(RunStateMachine::new(
            run,
            tasks,
            &mode,
            self.events.clone(),
            self.meter.clone(),
        )?);

        self.events.publish(RunEvent::RunCreated {
            run_id: run_id.clone(),
            dataset_ref: request.dataset_ref.clone(),
            models: request.model_ids.clone(),
            mode: mode.name.clone(),
            total_tasks: total,
            timestamp: Utc::now(),
        });
        info!(
            run_id = %run_id,
            dataset = %request.dataset_ref,
            models = request.model_ids.len(),
            mode = %mode.name,
            tasks = total,
            concurrency = machine.concurrency(),
            "Run launched"
        );

        let (settled_tx, settled_rx) = watch::channel(false);
        {
            let mut runs = self.runs.write().unwrap_or_else(|p| p.into_inner());
            runs.insert(
                run_id.clone(),
                LiveRun {
                    machine: Arc::clone(&machine),
                    settled: settled_rx,
                },
            );
        }

        let ctx = WorkerContext {
            machine,
            invoker: self.invoker.clone(),
            puzzles: puzzles.into_iter().map(|p| (p.id.clone(), p)).collect(),
            mode,
        };
        tokio::spawn(drive(Arc::new(ctx), self.archive.clone(), settled_tx));

        Ok(run_id)
    }

    // =========================================================================
    // Control
    // =========================================================================

    fn live(&self, run_id: &str) -> CoordinatorResult<LiveRun> {
        let runs = self.runs.read().unwrap_or_else(|p| p.into_inner());
        runs.get(run_id)
            .cloned()
            .ok_or_else(|| CoordinatorError::RunNotFound(run_id.to_string()))
    }

    fn machine(&self, run_id: &str) -> CoordinatorResult<Arc<RunStateMachine>> {
        self.live(run_id).map(|live| live.machine)
    }

    pub fn pause(&self, run_id: &str) -> CoordinatorResult<RunStatus> {
        Ok(self.machine(run_id)?.pause())
    }

    pub fn resume(&self, run_id: &str) -> CoordinatorResult<RunStatus> {
        Ok(self.machine(run_id)?.resume())
    }

    pub fn cancel(&self, run_id: &str) -> CoordinatorResult<RunStatus> {
        Ok(self.machine(run_id)?.cancel())
    }

    /// Wait until the run is terminal and archived
    pub async fn wait(&self, run_id: &str) -> CoordinatorResult<ProgressView> {
        let mut live = self.live(run_id)?;
        // A dropped sender means the driver is gone; nothing left to wait for
        let _ = live.settled.wait_for(|settled| *settled).await;
        Ok(live.machine.snapshot())
    }

    /// Remove a terminal run from the registry and the archive
    pub fn clear(&self, run_id: &str) -> CoordinatorResult<()> {
        let mut runs = self.runs.write().unwrap_or_else(|p| p.into_inner());
        match runs.get(run_id) {
            Some(live) if !live.machine.status().is_terminal() => {
                return Err(CoordinatorError::RunActive(run_id.to_string()))
            }
            Some(_) => {
                runs.remove(run_id);
            }
            None if self.archive.load(run_id)?.is_none() => {
                return Err(CoordinatorError::RunNotFound(run_id.to_string()))
            }
            None => {}
        }
        drop(runs);

        self.archive.remove(run_id)?;
        info!(run_id, "Run cleared");
        Ok(())
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Records of a live run, or of an archived one
    fn records(&self, run_id: &str) -> CoordinatorResult<RunRecordSet> {
        if let Ok(machine) = self.machine(run_id) {
            return Ok(machine.record_set());
        }
        self.archive
            .load(run_id)?
            .ok_or_else(|| CoordinatorError::RunNotFound(run_id.to_string()))
    }

    /// Live and archived runs, newest first
    pub fn list_runs(&self) -> CoordinatorResult<Vec<Run>> {
        let mut runs: Vec<Run> = {
            let live = self.runs.read().unwrap_or_else(|p| p.into_inner());
            live.values().map(|l| l.machine.run()).collect()
        };
        let known: HashSet<RunId> = runs.iter().map(|r| r.id.clone()).collect();
        runs.extend(
            self.archive
                .list_runs()?
                .into_iter()
                .filter(|r| !known.contains(&r.id)),
        );
        runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(runs)
    }

    pub fn get_run(&self, run_id: &str) -> CoordinatorResult<Run> {
        if let Ok(machine) = self.machine(run_id) {
            return Ok(machine.run());
        }
        Ok(self.records(run_id)?.run)
    }

    pub fn list_tasks(&self, run_id: &str, filter: &TaskFilter) -> CoordinatorResult<Vec<Task>> {
        if let Ok(machine) = self.machine(run_id) {
            return Ok(machine.tasks(filter));
        }
        Ok(self
            .records(run_id)?
            .tasks
            .into_iter()
            .filter(|t| filter.matches(t))
            .collect())
    }

    pub fn consensus(&self, run_id: &str) -> CoordinatorResult<Vec<ConsensusRecord>> {
        Ok(self.records(run_id)?.consensus)
    }

    pub fn puzzle_summary(&self, run_id: &str) -> CoordinatorResult<PuzzleSummary> {
        let records = self.records(run_id)?;
        Ok(PuzzleSummary::from_records(
            &records.run,
            &records.tasks,
            &records.consensus,
            &records.ledger,
        ))
    }

    pub fn ledger(&self, run_id: &str) -> CoordinatorResult<CostLedger> {
        if let Ok(machine) = self.machine(run_id) {
            return Ok(machine.ledger());
        }
        Ok(self.records(run_id)?.ledger)
    }

    /// Total cost charged to the run so far, in USD
    pub fn running_total(&self, run_id: &str) -> CoordinatorResult<f64> {
        Ok(CostMeter::running_total(&self.ledger(run_id)?))
    }

    /// One JSON object per task, newline separated
    pub fn export_tasks(&self, run_id: &str) -> CoordinatorResult<Vec<u8>> {
        let records = self.records(run_id)?;
        let mut out = Vec::new();
        for row in TaskExportRow::rows(&records.tasks, &records.consensus) {
            serde_json::to_writer(&mut out, &row)?;
            out.push(b'\n');
        }
        Ok(out)
    }

    /// Per-backend call counters across all runs
    pub fn backend_usage(&self) -> BTreeMap<ModelId, BackendUsage> {
        self.invoker.usage()
    }

    // =========================================================================
    // Progress
    // =========================================================================

    pub fn snapshot(&self, run_id: &str) -> CoordinatorResult<ProgressView> {
        if let Ok(machine) = self.machine(run_id) {
            return Ok(machine.snapshot());
        }
        Ok(ProgressView::from_run(&self.records(run_id)?.run, 1))
    }

    /// Live snapshots of a run; an archived run yields its final snapshot only
    pub fn subscribe(&self, run_id: &str) -> CoordinatorResult<ProgressSubscription> {
        if let Ok(machine) = self.machine(run_id) {
            return Ok(machine.subscribe());
        }
        let view = ProgressView::from_run(&self.records(run_id)?.run, 1);
        Ok(ProgressPublisher::new(view).subscribe())
    }

    /// Every run's lifecycle events
    pub fn events(&self) -> broadcast::Receiver<RunEvent> {
        self.events.subscribe()
    }

    pub fn events_filtered(&self, filter: EventFilter) -> FilteredReceiver {
        self.events.subscribe_filtered(filter)
    }
}

/// Drive one run from start to archive
async fn drive(ctx: Arc<WorkerContext>, archive: SharedRunArchive, settled: watch::Sender<bool>) {
    let machine = Arc::clone(&ctx.machine);
    let run_id = machine.run_id().to_string();

    if machine.start() {
        match ctx.invoker.prepare(machine.models()).await {
            Ok(()) => {
                let mut pool = JoinSet::new();
                for worker_id in 0..machine.concurrency() {
                    pool.spawn(run_worker(worker_id, Arc::clone(&ctx)));
                }
                while let Some(joined) = pool.join_next().await {
                    if let Err(e) = joined {
                        error!(run_id = %run_id, error = %e, "Worker task failed");
                    }
                }
                machine.finalize_stranded();
            }
            Err(e) => {
                machine.fail_setup(e.to_string());
            }
        }
    }

    // A run paused with nothing left waits here for resume or cancel
    let last = machine.wait_terminal().await;
    info!(
        run_id = %run_id,
        status = %last.status,
        completed = last.completed,
        successful = last.successful,
        running_cost = last.running_cost,
        "Run finished"
    );

    if let Err(e) = archive.persist(&machine.record_set()) {
        warn!(run_id = %run_id, error = %e, "Failed to archive run");
    }
    let _ = settled.send(true);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ModelConfig, SimulatedConfig, MODE_TESTING};
    use crate::dataset::InMemoryDatasets;
    use serde_json::json;

    fn coordinator() -> RunCoordinator {
        let config = OrchestratorConfig::default()
            .with_model("sim-a", ModelConfig::simulated(SimulatedConfig::default()))
            .with_model("sim-b", ModelConfig::simulated(SimulatedConfig::default()));
        let datasets = InMemoryDatasets::new()
            .with_dataset(
                "d1",
                vec![
                    Puzzle::new("p1", json!(1)).with_expected(json!(2)),
                    Puzzle::new("p2", json!(2)).with_expected(json!(4)),
                ],
            )
            .with_dataset("empty", vec![]);
        RunCoordinator::from_config(config, Arc::new(datasets)).unwrap()
    }

    #[tokio::test]
    async fn test_launch_rejections() {
        let c = coordinator();
        let cases = [
            LaunchRequest::new("d1", Vec::<ModelId>::new(), MODE_TESTING),
            LaunchRequest::new("d1", ["sim-a", "sim-a"], MODE_TESTING),
            LaunchRequest::new("d1", ["nope"], MODE_TESTING),
            LaunchRequest::new("d1", ["sim-a"], "turbo"),
            LaunchRequest::new("missing", ["sim-a"], MODE_TESTING),
            LaunchRequest::new("empty", ["sim-a"], MODE_TESTING),
            LaunchRequest::new("../d1", ["sim-a"], MODE_TESTING),
        ];
        for request in cases {
            assert!(
                matches!(
                    c.launch(request.clone()).await,
                    Err(CoordinatorError::InvalidConfig(_))
                ),
                "accepted {request:?}"
            );
        }
        assert!(c.list_runs().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_simulated_run_completes() {
        let c = coordinator();
        let run_id = c
            .launch(LaunchRequest::new("d1", ["sim-a", "sim-b"], MODE_TESTING))
            .await
            .unwrap();

        let view = c.wait(&run_id).await.unwrap();
        assert_eq!(view.status, RunStatus::Completed);
        assert_eq!(view.completed, 4);
        assert_eq!(view.total, 4);
        assert_eq!(view.successful + view.failed, 4);

        assert_eq!(c.consensus(&run_id).unwrap().len(), 2);
        assert_eq!(c.list_tasks(&run_id, &TaskFilter::new()).unwrap().len(), 4);

        let export = c.export_tasks(&run_id).unwrap();
        assert_eq!(export.split(|b| *b == b'\n').filter(|l| !l.is_empty()).count(), 4);

        // Terminal control is a no-op
        assert_eq!(c.pause(&run_id).unwrap(), RunStatus::Completed);
        assert_eq!(c.cancel(&run_id).unwrap(), RunStatus::Completed);
    }

    #[tokio::test]
    async fn test_clear_only_terminal() {
        let c = coordinator();
        let run_id = c
            .launch(LaunchRequest::new("d1", ["sim-a"], MODE_TESTING))
            .await
            .unwrap();
        c.pause(&run_id).unwrap();
        if !c.get_run(&run_id).unwrap().is_terminal() {
            assert!(matches!(c.clear(&run_id), Err(CoordinatorError::RunActive(_))));
        }

        c.cancel(&run_id).unwrap();
        c.wait(&run_id).await.unwrap();
        c.clear(&run_id).unwrap();
        assert!(matches!(
            c.get_run(&run_id),
            Err(CoordinatorError::RunNotFound(_))
        ));
        assert!(matches!(
            c.clear(&run_id),
            Err(CoordinatorError::RunNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_estimate() {
        let c = coordinator();
        let estimate = c
            .estimate(&LaunchRequest::new("d1", ["sim-a", "sim-b"], MODE_TESTING))
            .await
            .unwrap();
        assert_eq!(estimate.puzzle_count, 2);
        assert_eq!(estimate.task_count, 4);
        assert!(estimate.low <= estimate.high);
    }

    #[tokio::test]
    async fn test_unknown_run() {
        let c = coordinator();
        assert!(matches!(c.pause("r0"), Err(CoordinatorError::RunNotFound(_))));
        assert!(matches!(c.snapshot("r0"), Err(CoordinatorError::RunNotFound(_))));
        assert!(matches!(c.export_tasks("r0"), Err(CoordinatorError::RunNotFound(_))));
    }
}
