//! Ensemble Run Orchestrator
//!
//! This library runs evaluation datasets against one or more language
//! models and reports live, cancellable progress:
//! - A per-run task queue handing each (puzzle, model) task to one worker
//! - Backends for OpenAI-compatible and Anthropic endpoints, plus a
//!   deterministic simulated backend
//! - Majority-vote consensus per puzzle for multi-model runs
//! - Cost estimates before launch and an idempotent cost ledger during a run
//! - Pause, resume and cancel with a consistent progress snapshot
//!
//! # Features
//!
//! - `heavy-state`: archive finished runs to RocksDB
//!
//! # Configuration
//!
//! | Variable | Meaning |
//! |----------|---------|
//! | `ENSEMBLE_CONFIG` | Path to a TOML config file |
//! | `ENSEMBLE_DATASET_DIR` | Root directory for datasets |
//! | per-model `api_key_env` | API key for that model's endpoint |

#![allow(dead_code)]
#![allow(clippy::uninlined_format_args)]

pub mod config;
pub mod cost;
pub mod dataset;
pub mod ensemble;
pub mod events;
pub mod invoker;
pub mod queue;
pub mod state;

pub use config::{ModeProfile, OrchestratorConfig, MODE_PRODUCTION, MODE_TESTING};
pub use cost::{CostEstimate, CostMeter, PricingTable};
pub use dataset::{DatasetSource, DirectoryDatasets, InMemoryDatasets, Puzzle};
pub use ensemble::{
    CoordinatorError, CoordinatorResult, LaunchRequest, PuzzleSummary, RunCoordinator,
    SharedRunCoordinator, TaskFilter,
};
pub use events::{EventBus, ProgressSubscription, ProgressView, RunEvent};
pub use invoker::{BackendRegistry, ModelBackend, ModelInvoker};
pub use queue::TaskQueue;
pub use state::{
    ConsensusRecord, ErrorKind, ModelId, Run, RunStatus, Task, TaskKey, TaskOutcome, TaskStatus,
};
