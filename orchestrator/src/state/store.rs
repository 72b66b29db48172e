//! Run archive: where finished runs are written once they reach a terminal state
//!
//! The in-process coordinator stays authoritative while a run is live; the
//! archive only ever sees complete record sets. A RocksDB-backed archive is
//! available behind the `heavy-state` feature and uses bincode for the
//! binary encoding.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use super::types::{ConsensusRecord, CostLedger, Run, Task};

/// Error type for archive operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[cfg(feature = "heavy-state")]
    #[error("RocksDB error: {0}")]
    RocksDb(#[from] rocksdb::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    #[error("Lock poisoned")]
    LockPoisoned,

    #[error("Column family not found: {0}")]
    ColumnFamilyNotFound(String),
}

/// Result type for archive operations
pub type StoreResult<T> = Result<T, StoreError>;

/// Shared reference to a run archive
pub type SharedRunArchive = Arc<dyn RunArchive>;

/// Everything recorded about one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecordSet {
    pub run: Run,
    pub tasks: Vec<Task>,
    pub consensus: Vec<ConsensusRecord>,
    pub ledger: CostLedger,
}

/// Storage for terminal runs
pub trait RunArchive: Send + Sync {
    /// Write (or overwrite) a run's record set
    fn persist(&self, records: &RunRecordSet) -> StoreResult<()>;

    /// Load a run's record set
    fn load(&self, run_id: &str) -> StoreResult<Option<RunRecordSet>>;

    /// Archived run headers, newest first
    fn list_runs(&self) -> StoreResult<Vec<Run>>;

    /// Delete everything stored for a run
    fn remove(&self, run_id: &str) -> StoreResult<()>;
}

/// Archive that keeps nothing
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopArchive;

impl RunArchive for NoopArchive {
    fn persist(&self, _records: &RunRecordSet) -> StoreResult<()> {
        Ok(())
    }

    fn load(&self, _run_id: &str) -> StoreResult<Option<RunRecordSet>> {
        Ok(None)
    }

    fn list_runs(&self) -> StoreResult<Vec<Run>> {
        Ok(Vec::new())
    }

    fn remove(&self, _run_id: &str) -> StoreResult<()> {
        Ok(())
    }
}

/// Archive held in process memory
#[derive(Debug, Default)]
pub struct MemoryArchive {
    runs: RwLock<HashMap<String, RunRecordSet>>,
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.runs.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl RunArchive for MemoryArchive {
    fn persist(&self, records: &RunRecordSet) -> StoreResult<()> {
        let mut runs = self.runs.write().map_err(|_| StoreError::LockPoisoned)?;
        runs.insert(records.run.id.clone(), records.clone());
        Ok(())
    }

    fn load(&self, run_id: &str) -> StoreResult<Option<RunRecordSet>> {
        let runs = self.runs.read().map_err(|_| StoreError::LockPoisoned)?;
        Ok(runs.get(run_id).cloned())
    }

    fn list_runs(&self) -> StoreResult<Vec<Run>> {
        let runs = self.runs.read().map_err(|_| StoreError::LockPoisoned)?;
        let mut headers: Vec<Run> = runs.values().map(|r| r.run.clone()).collect();
        headers.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(headers)
    }

    fn remove(&self, run_id: &str) -> StoreResult<()> {
        let mut runs = self.runs.write().map_err(|_| StoreError::LockPoisoned)?;
        runs.remove(run_id);
        Ok(())
    }
}

#[cfg(feature = "heavy-state")]
pub use rocks::RocksArchive;

#[cfg(feature = "heavy-state")]
mod rocks {
    use std::path::PathBuf;
    use std::sync::RwLock;

    use rocksdb::{ColumnFamilyDescriptor, Options, DB};
    use serde::{de::DeserializeOwned, Serialize};

    use super::{RunArchive, RunRecordSet, StoreError, StoreResult};
    use crate::state::schema::{self, ALL_CFS};
    use crate::state::types::{ConsensusRecord, CostLedger, Run, Task};

    /// RocksDB-backed run archive
    pub struct RocksArchive {
        db: RwLock<DB>,
        path: PathBuf,
    }

    impl RocksArchive {
        /// Open or create an archive at the given path
        pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
            let path = path.into();

            let mut opts = Options::default();
            opts.create_if_missing(true);
            opts.create_missing_column_families(true);

            let cf_descriptors: Vec<ColumnFamilyDescriptor> = ALL_CFS
                .iter()
                .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
                .collect();

            let db = DB::open_cf_descriptors(&opts, &path, cf_descriptors)?;

            Ok(Self {
                db: RwLock::new(db),
                path,
            })
        }

        pub fn path(&self) -> &PathBuf {
            &self.path
        }

        // =====================================================================
        // Generic operations
        // =====================================================================

        fn put<T: Serialize>(&self, cf_name: &str, key: &str, value: &T) -> StoreResult<()> {
            let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
            let cf = db
                .cf_handle(cf_name)
                .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;

            let bytes = bincode::serde::encode_to_vec(value, bincode::config::standard())
                .map_err(|e| StoreError::Serialization(e.to_string()))?;

            db.put_cf(&cf, key.as_bytes(), bytes)?;
            Ok(())
        }

        fn get<T: DeserializeOwned>(&self, cf_name: &str, key: &str) -> StoreResult<Option<T>> {
            let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
            let cf = db
                .cf_handle(cf_name)
                .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;

            match db.get_cf(&cf, key.as_bytes())? {
                Some(bytes) => {
                    let (value, _) =
                        bincode::serde::decode_from_slice(&bytes, bincode::config::standard())
                            .map_err(|e| StoreError::Deserialization(e.to_string()))?;
                    Ok(Some(value))
                }
                None => Ok(None),
            }
        }

        fn delete(&self, cf_name: &str, key: &str) -> StoreResult<()> {
            let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
            let cf = db
                .cf_handle(cf_name)
                .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;

            db.delete_cf(&cf, key.as_bytes())?;
            Ok(())
        }

        fn list_keys(&self, cf_name: &str, prefix: &str) -> StoreResult<Vec<String>> {
            let db = self.db.read().map_err(|_| StoreError::LockPoisoned)?;
            let cf = db
                .cf_handle(cf_name)
                .ok_or_else(|| StoreError::ColumnFamilyNotFound(cf_name.to_string()))?;

            let mut keys = Vec::new();
            for result in db.prefix_iterator_cf(&cf, prefix.as_bytes()) {
                let (key, _) = result?;
                if let Ok(key_str) = String::from_utf8(key.to_vec()) {
                    if key_str.starts_with(prefix) {
                        keys.push(key_str);
                    } else {
                        break;
                    }
                }
            }

            Ok(keys)
        }
    }

    impl RunArchive for RocksArchive {
        fn persist(&self, records: &RunRecordSet) -> StoreResult<()> {
            let run_id = &records.run.id;
            for task in &records.tasks {
                let key = schema::keys::task(run_id, &task.puzzle_id, task.model_id.as_str());
                self.put(schema::CF_TASKS, &key, task)?;
            }
            for record in &records.consensus {
                let key = schema::keys::consensus(run_id, &record.puzzle_id);
                self.put(schema::CF_CONSENSUS, &key, record)?;
            }
            self.put(
                schema::CF_LEDGERS,
                &schema::keys::ledger(run_id),
                &records.ledger,
            )?;
            // Header last: a readable header implies the rest is present
            self.put(schema::CF_RUNS, &schema::keys::run(run_id), &records.run)
        }

        fn load(&self, run_id: &str) -> StoreResult<Option<RunRecordSet>> {
            let Some(run) = self.get::<Run>(schema::CF_RUNS, &schema::keys::run(run_id))? else {
                return Ok(None);
            };

            let mut tasks = Vec::new();
            for key in self.list_keys(schema::CF_TASKS, &schema::keys::task_prefix(run_id))? {
                if let Some(task) = self.get::<Task>(schema::CF_TASKS, &key)? {
                    tasks.push(task);
                }
            }

            let mut consensus = Vec::new();
            for key in
                self.list_keys(schema::CF_CONSENSUS, &schema::keys::consensus_prefix(run_id))?
            {
                if let Some(record) = self.get::<ConsensusRecord>(schema::CF_CONSENSUS, &key)? {
                    consensus.push(record);
                }
            }

            let ledger = self
                .get::<CostLedger>(schema::CF_LEDGERS, &schema::keys::ledger(run_id))?
                .unwrap_or_else(|| CostLedger::new(run_id.to_string()));

            Ok(Some(RunRecordSet {
                run,
                tasks,
                consensus,
                ledger,
            }))
        }

        fn list_runs(&self) -> StoreResult<Vec<Run>> {
            let keys = self.list_keys(schema::CF_RUNS, "run:")?;

            let mut runs: Vec<Run> = keys
                .iter()
                .filter_map(|key| self.get(schema::CF_RUNS, key).ok()?)
                .collect();

            runs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(runs)
        }

        fn remove(&self, run_id: &str) -> StoreResult<()> {
            self.delete(schema::CF_RUNS, &schema::keys::run(run_id))?;
            for key in self.list_keys(schema::CF_TASKS, &schema::keys::task_prefix(run_id))? {
                self.delete(schema::CF_TASKS, &key)?;
            }
            for key in
                self.list_keys(schema::CF_CONSENSUS, &schema::keys::consensus_prefix(run_id))?
            {
                self.delete(schema::CF_CONSENSUS, &key)?;
            }
            self.delete(schema::CF_LEDGERS, &schema::keys::ledger(run_id))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::types::{ModelId, TaskKey};

    fn record_set(dataset: &str) -> RunRecordSet {
        let run = Run::new(dataset.into(), vec![ModelId::from("m1")], "testing".into(), 1);
        let task = Task::new(run.id.clone(), TaskKey::new("p1", "m1"));
        let ledger = CostLedger::new(run.id.clone());
        RunRecordSet {
            run,
            tasks: vec![task],
            consensus: Vec::new(),
            ledger,
        }
    }

    #[test]
    fn test_memory_archive_roundtrip() {
        let archive = MemoryArchive::new();
        let records = record_set("d1");
        archive.persist(&records).unwrap();

        let loaded = archive.load(&records.run.id).unwrap().unwrap();
        assert_eq!(loaded, records);
        assert_eq!(archive.list_runs().unwrap().len(), 1);

        archive.remove(&records.run.id).unwrap();
        assert!(archive.load(&records.run.id).unwrap().is_none());
        assert!(archive.is_empty());
    }

    #[test]
    fn test_noop_archive_keeps_nothing() {
        let archive = NoopArchive;
        let records = record_set("d1");
        archive.persist(&records).unwrap();
        assert!(archive.load(&records.run.id).unwrap().is_none());
        assert!(archive.list_runs().unwrap().is_empty());
    }

    #[cfg(feature = "heavy-state")]
    #[test]
    fn test_rocks_archive_roundtrip() {
        use crate::state::types::TaskOutcome;

        let dir = tempfile::tempdir().unwrap();
        let archive = RocksArchive::open(dir.path()).unwrap();

        let mut records = record_set("d1");
        records.tasks[0].status = crate::state::types::TaskStatus::Completed;
        records.tasks[0].outcome = Some(TaskOutcome::answered("[1]".into(), true, 1.0, 12, 0.05));
        records.ledger.total_nanos = 50_000_000;
        archive.persist(&records).unwrap();

        let loaded = archive.load(&records.run.id).unwrap().unwrap();
        assert_eq!(loaded.run.id, records.run.id);
        assert_eq!(loaded.tasks, records.tasks);
        assert_eq!(loaded.ledger.total_nanos, 50_000_000);

        let runs = archive.list_runs().unwrap();
        assert_eq!(runs.len(), 1);

        archive.remove(&records.run.id).unwrap();
        assert!(archive.load(&records.run.id).unwrap().is_none());
    }
}
