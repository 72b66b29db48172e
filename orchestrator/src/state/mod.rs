//! Run state for ensemble evaluation
//!
//! This module holds the data model shared by every other component:
//! - Runs, their counters and lifecycle status
//! - Tasks (one puzzle attempted by one model) and their outcomes
//! - Consensus records for multi-model runs
//! - Cost ledgers
//!
//! Live runs are owned by the coordinator. Once a run reaches a terminal
//! state its full record set is handed to a [`RunArchive`].

pub mod schema;
pub mod store;
pub mod types;

pub use store::{
    MemoryArchive, NoopArchive, RunArchive, RunRecordSet, SharedRunArchive, StoreError,
    StoreResult,
};
#[cfg(feature = "heavy-state")]
pub use store::RocksArchive;
pub use types::{
    ConsensusRecord, CostLedger, ErrorKind, ModelCost, ModelId, ModelVerdict, PuzzleId, Run,
    RunCounters, RunId, RunStatus, RunTransition, Task, TaskKey, TaskOutcome, TaskStatus,
};
