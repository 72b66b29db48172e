//! Ensemble run orchestration
//!
//! Drives runs of one or more models over a dataset, collecting a consensus
//! verdict per puzzle when several models take part.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                     RunCoordinator                         │
//! │  • Validates launches, owns the run registry               │
//! │  • Spawns one driver per run                               │
//! └─────────────────────────┬─────────────────────────────────┘
//!                           │
//!                           ▼
//! ┌───────────────────────────────────────────────────────────┐
//! │                    RunStateMachine                         │
//! │  • Lifecycle: pending → running ⇄ paused → terminal        │
//! │  • Counters, ledger, consensus and progress in one commit  │
//! └─────────────────────────┬─────────────────────────────────┘
//!                           │
//!           ┌───────────────┼───────────────┐
//!           ▼               ▼               ▼
//!     ┌───────────┐   ┌───────────┐   ┌───────────┐
//!     │ TaskQueue │   │ Consensus │   │ CostMeter │
//!     │ + workers │   │Aggregator │   │           │
//!     └───────────┘   └───────────┘   └───────────┘
//! ```
//!
//! # Workflow
//!
//! 1. `launch` checks the request and creates one pending task per
//!    (puzzle, model)
//! 2. The driver starts the run and prepares every backend; a setup failure
//!    moves the run to `error`
//! 3. Workers claim tasks, call the model (retrying timeouts and rate
//!    limits) and report the outcome
//! 4. Each report updates counters and cost, and finalizes the puzzle's
//!    consensus once every model has reported
//! 5. The last terminal task completes the run; the driver archives it
//!
//! # Usage
//!
//! ```ignore
//! use orchestrator::ensemble::{LaunchRequest, RunCoordinator};
//! use orchestrator::config::OrchestratorConfig;
//! use orchestrator::dataset::DirectoryDatasets;
//!
//! let config = OrchestratorConfig::from_env()?;
//! let datasets = Arc::new(DirectoryDatasets::new("./datasets"));
//! let coordinator = RunCoordinator::from_config(config, datasets)?.shared();
//!
//! let run_id = coordinator
//!     .launch(LaunchRequest::new("evaluation", ["gpt-4o", "claude-sonnet-4"], "testing"))
//!     .await?;
//!
//! let mut progress = coordinator.subscribe(&run_id)?;
//! while let Some(view) = progress.next().await {
//!     println!("{}/{} ({:.2} USD)", view.completed, view.total, view.running_cost);
//! }
//! ```

pub mod aggregator;
pub mod coordinator;
pub mod machine;
pub mod voting;
pub mod worker;

// Re-export core types
pub use aggregator::ConsensusAggregator;
pub use coordinator::{
    CoordinatorError, CoordinatorResult, LaunchRequest, RunCoordinator, SharedRunCoordinator,
};
pub use machine::{
    Completion, ModelSummary, PuzzleSummary, RunStateMachine, TaskExportRow, TaskFilter,
};
pub use voting::{majority_vote, VoteOutcome};
